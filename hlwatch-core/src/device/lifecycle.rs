//! Initialize/shutdown bracket shared by the in-process providers

use std::sync::atomic::{AtomicU8, Ordering};

use super::HlmlError;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Tracks `Created -> Running -> Stopped`
#[derive(Debug, Default)]
pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(CREATED))
    }

    /// Enter `Running` from `Created` or `Stopped`
    pub(crate) fn start(&self) -> Result<(), HlmlError> {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if current == RUNNING {
                return Err(HlmlError::AlreadyInitialized);
            }
            match self
                .0
                .compare_exchange(current, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn stop(&self) -> Result<(), HlmlError> {
        self.0
            .compare_exchange(RUNNING, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| HlmlError::Uninitialized)
    }

    pub(crate) fn ensure_running(&self) -> Result<(), HlmlError> {
        if self.0.load(Ordering::SeqCst) == RUNNING {
            Ok(())
        } else {
            Err(HlmlError::Uninitialized)
        }
    }
}
