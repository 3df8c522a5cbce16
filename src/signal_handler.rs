use std::fmt;
use std::future::Future;
use std::io;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};
use tokio::runtime::Builder;

use crate::delay_manager::CancelToken;
use crate::error::Result;

/// Exit status used when a second signal forces the process down.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Terminate,
    /// SIGINT / Ctrl+C
    Interrupt,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Cancels `token` on SIGINT or SIGTERM. The run then stops at its next wait
/// and records what it already fetched. A second signal exits immediately.
pub fn install(token: CancelToken) -> Result<JoinHandle<()>> {
    watch(token, wait_for_signal)
}

/// Runs `wait` on a dedicated thread with its own small runtime. The first
/// signal it yields cancels `token`, the second one exits the process.
pub fn watch<F, Fut>(token: CancelToken, wait: F) -> Result<JoinHandle<()>>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = io::Result<ShutdownSignal>>,
{
    let runtime = Builder::new_current_thread().enable_all().build()?;
    let handle = thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match wait().await {
                    Ok(signal) => {
                        warn!("Received {}, stopping after the current step", signal);
                        token.cancel();
                    }
                    Err(e) => {
                        error!("Signal handler failed: {}", e);
                        return;
                    }
                }
                if let Ok(signal) = wait().await {
                    warn!("Received {} again, exiting now", signal);
                    std::process::exit(FORCED_EXIT_CODE);
                }
            })
        })?;
    info!("Signal handler installed, Ctrl+C stops the run gracefully");
    Ok(handle)
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok(ShutdownSignal::Terminate),
        _ = sigint.recv() => Ok(ShutdownSignal::Interrupt),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn wait_until_cancelled(token: &CancelToken) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if token.is_cancelled() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn first_signal_cancels_the_token() {
        let token = CancelToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        watch(token.clone(), move || {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok(ShutdownSignal::Terminate)
                } else {
                    std::future::pending().await
                }
            }
        })
        .unwrap();

        assert!(wait_until_cancelled(&token));
    }

    #[test]
    fn failed_registration_leaves_the_token_alone() {
        let token = CancelToken::new();
        let handle = watch(token.clone(), || async {
            Err(io::Error::new(io::ErrorKind::Other, "no signals here"))
        })
        .unwrap();

        handle.join().unwrap();
        assert!(!token.is_cancelled());
    }
}
