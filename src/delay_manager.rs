use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

const TICK: Duration = Duration::from_millis(500);

/// Shared stop signal. Cancelled either explicitly or, when a stop file is
/// configured, as soon as that file exists.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    stop_file: Option<Arc<PathBuf>>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn with_stop_file(path: impl Into<PathBuf>) -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            stop_file: Some(Arc::new(path.into())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.stop_file {
            Some(path) if path.exists() => {
                warn!("Stop file {:?} found, cancelling.", path);
                self.flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }
}

/// Blocking waits between orchestrator phases.
pub trait Pause {
    /// Waits for `duration`. Returns false if `cancel` fired first.
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// Sleeps the current thread, waking every half second to check for cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if duration.is_zero() {
            return !cancel.is_cancelled();
        }
        info!("Waiting for {} seconds...", duration.as_secs_f32());
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(TICK.min(deadline - now));
        }
    }
}
