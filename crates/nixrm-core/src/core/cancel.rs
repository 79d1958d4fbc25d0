use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

/// Cleanup that must run even when the process exits without unwinding.
pub type ExitHook = Box<dyn Fn() + Send + Sync>;

/// Shared cancellation flag checked between units of work.
#[derive(Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    exit_hooks: Arc<Mutex<Vec<ExitHook>>>,
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Cancellation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Registers `hook` to run before a forced exit; destructors are skipped then.
    pub fn on_forced_exit(&self, hook: ExitHook) {
        if let Ok(mut hooks) = self.exit_hooks.lock() {
            hooks.push(hook);
        }
    }

    fn run_exit_hooks(&self) {
        let hooks = match self.exit_hooks.lock() {
            Ok(mut hooks) => std::mem::take(&mut *hooks),
            Err(_) => return,
        };
        for hook in hooks {
            hook();
        }
    }

    /// Sets the flag on the first SIGINT/SIGTERM; a second signal runs the exit
    /// hooks and exits with 130.
    ///
    /// The listener runs on its own thread with a current-thread runtime so the
    /// synchronous pipeline never has to poll for signals.
    pub fn install_signal_handlers(&self) {
        let cancel = self.clone();
        let spawned = thread::Builder::new()
            .name("nixrm-signals".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        warn!(%err, "signal listener unavailable");
                        return;
                    }
                };
                runtime.block_on(async move {
                    loop {
                        wait_for_signal().await;
                        if cancel.is_cancelled() {
                            cancel.run_exit_hooks();
                            std::process::exit(130);
                        }
                        debug!("cancellation requested");
                        cancel.cancel();
                    }
                });
            });
        if let Err(err) = spawned {
            warn!(%err, "failed to start signal listener");
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
