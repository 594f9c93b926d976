//! Parent-process signal handling: SIGTERM/SIGINT start graceful
//! shutdown, SIGHUP triggers a full restart under the frozen plan (§4.1,
//! §4.2, Open Question (i)).

use crate::dispatch::ShutdownFlag;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Default)]
pub struct SignalState {
    pub shutdown: ShutdownFlag,
    pub reload: Arc<AtomicBool>,
}

impl SignalState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reload_requested(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }
}

/// Spawns a background thread that blocks on the given signals and
/// updates `state` accordingly. Returns a `Handle` the caller can
/// `close()` during its own shutdown sequence to unblock the thread.
pub fn install(state: SignalState) -> std::io::Result<Handle> {
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
    let handle = signals.handle();
    std::thread::spawn(move || {
        for signal in &mut signals {
            match signal {
                SIGTERM | SIGINT => {
                    log::info!("received signal {signal}, starting graceful shutdown");
                    state.shutdown.trigger();
                }
                SIGHUP => {
                    log::info!("received SIGHUP, scheduling a full restart under the same plan");
                    state.reload.store(true, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    });
    Ok(handle)
}

/// Worker-process variant: only SIGTERM is meaningful (the parent uses
/// it to ask a worker to finish in-flight work and exit). Workers do
/// not handle SIGHUP themselves; the parent reforks them instead.
pub fn install_worker(shutdown: ShutdownFlag) -> std::io::Result<Handle> {
    let mut signals = Signals::new([SIGTERM])?;
    let handle = signals.handle();
    std::thread::spawn(move || {
        for signal in &mut signals {
            if signal == SIGTERM {
                shutdown.trigger();
            }
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_flag_is_consumed_once() {
        let state = SignalState::new();
        state.reload.store(true, Ordering::SeqCst);
        assert!(state.reload_requested());
        assert!(!state.reload_requested());
    }
}
