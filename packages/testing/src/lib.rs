#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, examples and benchmarks in this workspace.

use std::panic;
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

/// Runs a test body on a separate thread and fails the test if it does not finish in time.
///
/// Reactor and registry tests block on condition variables and backend polls; a bug there
/// shows up as a hang rather than a failure. This turns such a hang into a panic after
/// 10 seconds (60 seconds under Miri).
///
/// Set `MUTATION_TESTING=1` to run the body directly, so that mutation testing can observe
/// mutations that cause hangs.
///
/// # Panics
///
/// Panics if the body exceeds the timeout. Re-raises any panic from the body.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(body: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return body();
    }

    let (tx, rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        // If the receiver is gone, the watchdog has already given up on us.
        drop(tx.send(body()));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            worker.join().expect("test thread panicked after producing a result");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {timeout:?}");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match worker.join() {
            Ok(()) => panic!("test thread exited without producing a result"),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Runs `body` on `count` new threads at once, passing each its index, and waits for all.
///
/// The threads are released together after all of them have started, which maximizes the
/// chance of them racing each other. A panic on any thread is re-raised on the caller's
/// thread once every thread has finished.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use testing::on_threads;
///
/// let total = Arc::new(AtomicUsize::new(0));
///
/// on_threads(4, {
///     let total = Arc::clone(&total);
///     move |index| {
///         total.fetch_add(index, Ordering::Relaxed);
///     }
/// });
///
/// assert_eq!(total.load(Ordering::Relaxed), 0 + 1 + 2 + 3);
/// ```
pub fn on_threads<F>(count: usize, body: F)
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let start = Arc::new(Barrier::new(count));

    let workers: Vec<_> = (0..count)
        .map(|index| {
            let body = Arc::clone(&body);
            let start = Arc::clone(&start);

            thread::spawn(move || {
                start.wait();
                body(index);
            })
        })
        .collect();

    let mut first_panic = None;

    for worker in workers {
        if let Err(payload) = worker.join() {
            first_panic.get_or_insert(payload);
        }
    }

    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn watchdog_returns_body_result() {
        assert_eq!(with_watchdog(|| "done"), "done");
    }

    #[test]
    #[should_panic]
    fn watchdog_propagates_panic() {
        with_watchdog(|| assert_eq!(1 + 1, 3, "boom"));
    }

    #[test]
    fn on_threads_runs_every_index_once() {
        let seen = Arc::new(AtomicUsize::new(0));

        on_threads(5, {
            let seen = Arc::clone(&seen);
            move |index| {
                seen.fetch_or(1 << index, Ordering::Relaxed);
            }
        });

        assert_eq!(seen.load(Ordering::Relaxed), 0b1_1111);
    }

    #[test]
    #[should_panic]
    fn on_threads_propagates_panic() {
        on_threads(3, |index| assert_ne!(index, 1));
    }
}
