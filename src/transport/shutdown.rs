//! One-shot shutdown signal shared by the connection tasks.
//!
//! The signal fires at most once, with either [`ShutdownMode::Lameduck`]
//! (drain outbound traffic for a bounded time, then stop hard) or
//! [`ShutdownMode::Immediate`]. Hooks registered with
//! [`ShutdownSignal::on_fire`] run exactly once; a hook registered after
//! the signal fired runs on the spot.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How the connection should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let queued writes drain for a bounded time before stopping.
    Lameduck,
    /// Stop all tasks right away.
    Immediate,
}

type Hook = Box<dyn FnOnce(ShutdownMode) + Send>;

#[derive(Default)]
struct SignalState {
    fired: Option<ShutdownMode>,
    hooks: Vec<Hook>,
}

/// Fire-once shutdown relay.
pub struct ShutdownSignal {
    state: Mutex<SignalState>,
    hard_stop: CancellationToken,
}

impl ShutdownSignal {
    /// Unfired signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            hard_stop: CancellationToken::new(),
        }
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn fire(&self, mode: ShutdownMode) -> bool {
        let hooks = {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if state.fired.is_some() {
                return false;
            }
            state.fired = Some(mode);
            std::mem::take(&mut state.hooks)
        };

        debug!(?mode, hooks = hooks.len(), "shutdown signal fired");
        for hook in hooks {
            hook(mode);
        }
        true
    }

    /// Register a hook to run when the signal fires.
    pub fn on_fire(&self, hook: impl FnOnce(ShutdownMode) + Send + 'static) {
        let fired = match self.state.lock() {
            Ok(mut state) => match state.fired {
                Some(mode) => Some(mode),
                None => {
                    state.hooks.push(Box::new(hook));
                    return;
                }
            },
            Err(_) => Some(ShutdownMode::Immediate),
        };
        if let Some(mode) = fired {
            hook(mode);
        }
    }

    /// Mode the signal fired with, if it fired.
    #[must_use]
    pub fn fired(&self) -> Option<ShutdownMode> {
        self.state.lock().ok().and_then(|state| state.fired)
    }

    /// Token cancelled when every task must stop.
    #[must_use]
    pub fn hard_stop_token(&self) -> CancellationToken {
        self.hard_stop.clone()
    }

    /// Cancel the hard-stop token.
    pub fn stop_now(&self) {
        self.hard_stop.cancel();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
