//! Per-iteration convergence records of a deconvolution run.

use std::io;

use csv::WriterBuilder;
use serde::Serialize;

use crate::error::Result;

/// Statistics of one completed iteration.
///
/// # Fields
/// - `iteration`: 1-based iteration number.
/// - `t`: Wall-clock seconds spent in the iteration.
/// - `tau1`: Relative L1 change of the estimate, `0.0` when the tau1 rule is disabled.
/// - `leak`: Photon leak in percent of the initial photon count.
/// - `e`, `s`, `u`: Converged, shrinking and growing photon sums.
/// - `n`: Number of rejected voxels.
/// - `u_esu`: `u / (e + s + u)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub t: f64,
    pub tau1: f64,
    pub leak: f64,
    pub e: f64,
    pub s: f64,
    pub u: f64,
    pub n: u64,
    pub u_esu: f64,
}

/// Append-only table of [`IterationRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    records: Vec<IterationRecord>,
}

impl Diagnostics {
    /// An empty table with room for `max_iterations` records.
    pub fn with_capacity(max_iterations: usize) -> Self {
        Diagnostics {
            records: Vec::with_capacity(max_iterations),
        }
    }

    pub fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }

    /// Writes the table as CSV with the header `t,tau1,leak,e,s,u,n,u_esu`, one row per
    /// iteration in order.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(writer);
        wtr.write_record(["t", "tau1", "leak", "e", "s", "u", "n", "u_esu"])?;
        for record in &self.records {
            wtr.write_record(&[
                record.t.to_string(),
                record.tau1.to_string(),
                record.leak.to_string(),
                record.e.to_string(),
                record.s.to_string(),
                record.u.to_string(),
                record.n.to_string(),
                record.u_esu.to_string(),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }
}
