//! # cancellable_loops
//!
//! Loops that stop early when an abort flag is raised, in sequential and rayon-parallel flavours.
//!
//! Every loop reports a [`LoopOutcome`] so the caller can tell a finished computation from an
//! aborted one and discard partial results. A [`ProgressCounter`] can be shared between parallel
//! workers to turn completed items into a fraction in `0.0..=1.0`.
//!
//! ## Example
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use cancellable_loops::{for_each_cancellable, LoopOutcome};
//!
//! let abort_flag = AtomicBool::new(false);
//! let mut sum = 0;
//!
//! let outcome = for_each_cancellable(1..=10, &abort_flag, |i| {
//!     sum += i;
//!     if sum > 15 {
//!         abort_flag.store(true, Ordering::Relaxed);
//!     }
//! });
//!
//! assert_eq!(outcome, LoopOutcome::Cancelled);
//! assert_eq!(sum, 21);
//! ```

use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// How a cancellable loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Every item was processed.
    Completed,
    /// The abort flag was observed and the remaining items were skipped.
    Cancelled,
}

impl LoopOutcome {
    pub fn is_cancelled(&self) -> bool {
        *self == LoopOutcome::Cancelled
    }
}

/// Executes a sequential loop that stops as soon as `abort_flag` is set.
///
/// The flag is checked before every item, so an item that is already running always finishes.
pub fn for_each_cancellable<I, F, T>(iter: I, abort_flag: &AtomicBool, mut func: F) -> LoopOutcome
where
    I: IntoIterator<Item = T>,
    F: FnMut(T),
{
    for item in iter {
        if abort_flag.load(Ordering::Relaxed) {
            return LoopOutcome::Cancelled;
        }
        func(item);
    }
    // the last item may itself have raised the flag
    if abort_flag.load(Ordering::Relaxed) {
        LoopOutcome::Cancelled
    } else {
        LoopOutcome::Completed
    }
}

/// Executes a parallel loop that skips all remaining work once `abort_flag` is set.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
/// use cancellable_loops::{par_for_each_cancellable, LoopOutcome};
///
/// let abort_flag = AtomicBool::new(false);
/// let counter = AtomicUsize::new(0);
///
/// let outcome = par_for_each_cancellable(0..100, &abort_flag, |_| {
///     counter.fetch_add(1, Ordering::Relaxed);
/// });
///
/// assert_eq!(outcome, LoopOutcome::Completed);
/// assert_eq!(counter.load(Ordering::Relaxed), 100);
/// ```
pub fn par_for_each_cancellable<I, F>(iter: I, abort_flag: &AtomicBool, func: F) -> LoopOutcome
where
    I: IntoParallelIterator,
    F: Fn(I::Item) + Sync + Send,
    I::Item: Send,
{
    let result = iter.into_par_iter().try_for_each(|item| {
        if abort_flag.load(Ordering::Relaxed) {
            Err(())
        } else {
            func(item);
            Ok(())
        }
    });
    match result {
        Ok(()) if !abort_flag.load(Ordering::Relaxed) => LoopOutcome::Completed,
        _ => LoopOutcome::Cancelled,
    }
}

/// Maps every item in parallel and collects the results in input order.
///
/// Returns `None` if the loop was cancelled, because a partially mapped vector would silently
/// misalign with its input.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::AtomicBool;
/// use cancellable_loops::par_map_cancellable;
///
/// let abort_flag = AtomicBool::new(false);
/// let squares = par_map_cancellable(vec![1, 2, 3], &abort_flag, |i| i * i);
/// assert_eq!(squares, Some(vec![1, 4, 9]));
/// ```
pub fn par_map_cancellable<I, F, R>(iter: I, abort_flag: &AtomicBool, func: F) -> Option<Vec<R>>
where
    I: IntoParallelIterator,
    I::Iter: IndexedParallelIterator,
    F: Fn(I::Item) -> R + Sync + Send,
    I::Item: Send,
    R: Send,
{
    let mapped: Option<Vec<R>> = iter
        .into_par_iter()
        .map(|item| {
            if abort_flag.load(Ordering::Relaxed) {
                None
            } else {
                Some(func(item))
            }
        })
        .collect();
    if abort_flag.load(Ordering::Relaxed) {
        None
    } else {
        mapped
    }
}

/// Counts finished items across threads and converts them into a progress fraction.
///
/// # Examples
///
/// ```
/// use cancellable_loops::ProgressCounter;
///
/// let counter = ProgressCounter::new(4);
/// counter.tick();
/// assert_eq!(counter.fraction(), 0.25);
/// ```
#[derive(Debug)]
pub struct ProgressCounter {
    total: usize,
    done: AtomicUsize,
}

impl ProgressCounter {
    pub fn new(total: usize) -> Self {
        ProgressCounter {
            total,
            done: AtomicUsize::new(0),
        }
    }

    /// Marks one item as done and returns the new fraction.
    pub fn tick(&self) -> f32 {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        Self::to_fraction(done, self.total)
    }

    pub fn fraction(&self) -> f32 {
        Self::to_fraction(self.done.load(Ordering::Relaxed), self.total)
    }

    fn to_fraction(done: usize, total: usize) -> f32 {
        if total == 0 {
            1.0
        } else {
            (done.min(total) as f32) / (total as f32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_loop_completes_without_abort() {
        let abort = AtomicBool::new(false);
        let mut seen = vec![];
        let outcome = for_each_cancellable(0..5, &abort, |i| seen.push(i));
        assert_eq!(outcome, LoopOutcome::Completed);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_parallel_loop_reports_cancel_when_flag_preset() {
        let abort = AtomicBool::new(true);
        let counter = AtomicUsize::new(0);
        let outcome = par_for_each_cancellable(0..1000, &abort, |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert!(outcome.is_cancelled());
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_par_map_keeps_order() {
        let abort = AtomicBool::new(false);
        let out = par_map_cancellable((0..64).collect::<Vec<_>>(), &abort, |i| i * 2).unwrap();
        assert_eq!(out, (0..64).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_progress_counter_saturates() {
        let counter = ProgressCounter::new(2);
        counter.tick();
        counter.tick();
        counter.tick();
        assert_eq!(counter.fraction(), 1.0);
        assert_eq!(ProgressCounter::new(0).fraction(), 1.0);
    }
}
