//! # cancellable_loops
//!
//! A small utility crate for driving open-ended, step-wise loops that can be cancelled
//! from another thread through an abort flag.
//!
//! The flag is polled *between* steps only. A step that has started always runs to
//! completion, so state mutated by a step is never left half-updated by a cancellation.
//! This makes the loop suitable for iterative solvers where every iteration must either
//! be fully committed or not started at all.
//!
//! ## Example
//!
//! ```
//! use std::ops::ControlFlow;
//! use std::sync::atomic::AtomicBool;
//! use cancellable_loops::{loop_cancellable, LoopExit};
//!
//! let abort_flag = AtomicBool::new(false);
//! let mut value = 1u64;
//!
//! let exit = loop_cancellable(&abort_flag, |_step| -> Result<_, ()> {
//!     value *= 2;
//!     if value >= 64 {
//!         Ok(ControlFlow::Break(value))
//!     } else {
//!         Ok(ControlFlow::Continue(()))
//!     }
//! });
//!
//! assert_eq!(exit, Ok(LoopExit::Finished(64)));
//! ```

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};

/// How a cancellable loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit<S> {
    /// A step returned `ControlFlow::Break` with the given value.
    Finished(S),
    /// The abort flag was observed before a step started.
    ///
    /// `completed` is the number of steps that ran to completion.
    Cancelled { completed: usize },
}

/// Runs `step` repeatedly until it breaks, fails, or the abort flag is raised.
///
/// The abort flag is checked before every step, including the first one. Each step
/// receives its zero-based index. The flag is only read, never reset, so the caller
/// decides whether a raised flag should also stop subsequent loops.
///
/// # Arguments
///
/// * `abort_flag` - An atomic boolean that can be set to `true` to cancel the loop
/// * `step` - The loop body; returns `ControlFlow::Break(value)` to finish
///
/// # Errors
///
/// The first error returned by `step` ends the loop and is returned unchanged.
///
/// # Examples
///
/// ```
/// use std::ops::ControlFlow;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use cancellable_loops::{loop_cancellable, LoopExit};
///
/// let abort_flag = AtomicBool::new(false);
///
/// // The third step raises the flag; the loop stops before a fourth step starts.
/// let exit = loop_cancellable(&abort_flag, |step| -> Result<ControlFlow<()>, ()> {
///     if step == 2 {
///         abort_flag.store(true, Ordering::Relaxed);
///     }
///     Ok(ControlFlow::Continue(()))
/// });
///
/// assert_eq!(exit, Ok(LoopExit::Cancelled { completed: 3 }));
/// ```
pub fn loop_cancellable<S, E, F>(abort_flag: &AtomicBool, mut step: F) -> Result<LoopExit<S>, E>
where
    F: FnMut(usize) -> Result<ControlFlow<S>, E>,
{
    let mut completed = 0;
    loop {
        if abort_flag.load(Ordering::Relaxed) {
            return Ok(LoopExit::Cancelled { completed });
        }
        let flow = step(completed)?;
        completed += 1;
        if let ControlFlow::Break(value) = flow {
            return Ok(LoopExit::Finished(value));
        }
    }
}
