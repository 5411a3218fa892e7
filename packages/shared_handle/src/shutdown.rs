use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::{ERR_POISONED_LOCK, Error, Result};

type FinalizerFn = Box<dyn FnOnce() + Send + 'static>;

struct Finalizer {
    name: &'static str,
    run: FinalizerFn,
}

/// Runs teardown steps once, in the reverse of the order they were registered, followed by a
/// single backend finalizer.
///
/// Whatever is registered first is torn down last. Register resources from the lowest layer
/// up (event queues, then pools, then containers) and they are torn down from the top layer
/// down. The backend finalizer always runs after all of them, even if one of them panics.
///
/// Finalizers cannot fail. Teardown errors are expected to be logged and swallowed by the
/// finalizer itself, since shutdown must always run to the end.
///
/// ```
/// use std::sync::{Arc, Mutex};
///
/// use shared_handle::ShutdownSequence;
///
/// let log = Arc::new(Mutex::new(Vec::new()));
/// let sequence = ShutdownSequence::new();
///
/// for name in ["queues", "pools", "containers"] {
///     let log = Arc::clone(&log);
///     sequence
///         .register(name, move || log.lock().unwrap().push(name))
///         .unwrap();
/// }
///
/// let backend_log = Arc::clone(&log);
/// sequence
///     .set_backend_finalizer("backend", move || backend_log.lock().unwrap().push("backend"))
///     .unwrap();
///
/// assert!(sequence.run());
/// assert!(!sequence.run());
///
/// assert_eq!(
///     *log.lock().unwrap(),
///     ["containers", "pools", "queues", "backend"]
/// );
/// ```
pub struct ShutdownSequence {
    state: Mutex<SequenceState>,
}

#[derive(Default)]
struct SequenceState {
    finalizers: Vec<Finalizer>,
    backend_finalizer: Option<Finalizer>,
    has_run: bool,
}

impl ShutdownSequence {
    /// Creates an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SequenceState::default()),
        }
    }

    /// Adds a teardown step. It will run before every step registered earlier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the sequence has already run.
    pub fn register<F>(&self, name: &'static str, finalizer: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock_not_run(name)?;

        state.finalizers.push(Finalizer {
            name,
            run: Box::new(finalizer),
        });

        Ok(())
    }

    /// Sets the step that runs after all others, typically to finalize the backend library.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the sequence has already run or already has a
    /// backend finalizer.
    pub fn set_backend_finalizer<F>(&self, name: &'static str, finalizer: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock_not_run(name)?;

        if let Some(existing) = &state.backend_finalizer {
            return Err(Error::invalid_state(format!(
                "cannot set backend finalizer '{name}' because '{}' is already set",
                existing.name
            )));
        }

        state.backend_finalizer = Some(Finalizer {
            name,
            run: Box::new(finalizer),
        });

        Ok(())
    }

    /// Runs every step, newest first, then the backend finalizer.
    ///
    /// Returns `false` without doing anything if the sequence has already run.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from a step, after running the backend finalizer. Steps after the
    /// panicking one are skipped.
    pub fn run(&self) -> bool {
        let (finalizers, backend_finalizer) = {
            let mut state = self.lock();

            if state.has_run {
                return false;
            }

            state.has_run = true;

            (
                std::mem::take(&mut state.finalizers),
                state.backend_finalizer.take(),
            )
        };

        tracing::debug!(steps = finalizers.len(), "running shutdown sequence");

        let _backend = scopeguard::guard(backend_finalizer, |backend_finalizer| {
            if let Some(finalizer) = backend_finalizer {
                tracing::debug!(step = finalizer.name, "running backend finalizer");
                (finalizer.run)();
            }
        });

        for finalizer in finalizers.into_iter().rev() {
            tracing::debug!(step = finalizer.name, "running shutdown step");
            (finalizer.run)();
        }

        true
    }

    /// Whether [`run()`][Self::run] has been called.
    #[must_use]
    pub fn has_run(&self) -> bool {
        self.lock().has_run
    }

    /// Number of steps waiting to run, not counting the backend finalizer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().finalizers.len()
    }

    /// Whether no steps are waiting to run, not counting the backend finalizer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, SequenceState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    fn lock_not_run(&self, name: &'static str) -> Result<MutexGuard<'_, SequenceState>> {
        let state = self.lock();

        if state.has_run {
            return Err(Error::invalid_state(format!(
                "cannot register shutdown step '{name}' after shutdown has run"
            )));
        }

        Ok(state)
    }
}

impl Default for ShutdownSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownSequence {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();

        f.debug_struct("ShutdownSequence")
            .field(
                "steps",
                &state.finalizers.iter().map(|f| f.name).collect::<Vec<_>>(),
            )
            .field(
                "backend_finalizer",
                &state.backend_finalizer.as_ref().map(|f| f.name),
            )
            .field("has_run", &state.has_run)
            .finish()
    }
}
