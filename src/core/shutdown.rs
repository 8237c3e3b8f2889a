//! Process shutdown coordination
//!
//! One coordinator per process, cloned into every background loop. OS
//! signals and explicit calls flip the same latch; waiters observe it even
//! if they start waiting after the fact. A second signal forces an
//! immediate exit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Exit status used when a second signal interrupts a graceful stop
const FORCED_EXIT_CODE: i32 = 130;

/// Latched shutdown flag shared by the node's background tasks
#[derive(Clone)]
pub struct ShutdownCoordinator {
    latch: Arc<watch::Sender<bool>>,
    signals_seen: Arc<AtomicUsize>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (latch, _) = watch::channel(false);
        Self {
            latch: Arc::new(latch),
            signals_seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn trigger_shutdown(&self) {
        if !self.latch.send_replace(true) {
            log::debug!("Shutdown latched");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.latch.borrow()
    }

    /// Resolve once shutdown has been requested, including before this call
    ///
    /// Cancel-safe, so loops can `select!` on it every iteration.
    pub async fn wait(&self) {
        let mut rx = self.latch.subscribe();
        // the sender lives as long as self, so this only returns on `true`
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Route SIGINT/SIGTERM/SIGHUP/SIGQUIT (Ctrl-C elsewhere) into this coordinator
    pub fn install_signal_handlers(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            }

            for kind in [
                SignalKind::interrupt(),
                SignalKind::terminate(),
                SignalKind::hangup(),
                SignalKind::quit(),
            ] {
                let coordinator = self.clone();
                tokio::spawn(async move {
                    let mut stream = match signal(kind) {
                        Ok(stream) => stream,
                        Err(e) => {
                            log::warn!("Cannot listen for signal {:?}: {}", kind, e);
                            return;
                        }
                    };
                    while stream.recv().await.is_some() {
                        coordinator.on_signal();
                    }
                });
            }
        }

        #[cfg(not(unix))]
        {
            let coordinator = self.clone();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    coordinator.on_signal();
                }
            });
        }
    }

    fn on_signal(&self) {
        if self.signals_seen.fetch_add(1, Ordering::AcqRel) >= 1 {
            log::warn!("Second shutdown signal received; exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        }
        log::info!("Shutdown signal received, stopping node");
        self.trigger_shutdown();
    }
}
