//! Progress reporting for a single generation.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

type Callback = dyn Fn(u8) + Send + Sync;

/// Forwards integer percentages to an optional callback.
///
/// Reported values never decrease and stay below 100 until
/// [`Progress::complete`] is called on success.
#[derive(Clone, Default)]
pub struct Progress {
    callback: Option<Arc<Callback>>,
    last: Arc<AtomicU8>,
}

impl Progress {
    /// Creates a reporter that forwards to `callback`.
    pub fn new(callback: impl Fn(u8) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    /// A reporter that discards updates.
    pub fn none() -> Self {
        Self::default()
    }

    /// Reports an intermediate percentage, capped at 99.
    pub fn report(&self, percent: u8) {
        let percent = percent.min(99);
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            if let Some(callback) = &self.callback {
                callback(percent);
            }
        }
    }

    /// Reports 100%. Only call after the media reference is in hand.
    pub fn complete(&self) {
        let previous = self.last.fetch_max(100, Ordering::SeqCst);
        if previous < 100 {
            if let Some(callback) = &self.callback {
                callback(100);
            }
        }
    }

    /// Last value reported.
    pub fn current(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("current", &self.current())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
