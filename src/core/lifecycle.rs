use std::{
    future::Future,
    sync::atomic::{AtomicU8, Ordering},
};

use serde::Serialize;
use tokio::sync::Mutex;

/// Lifecycle phase shared by every stage and the orchestrator.
///
/// `Completed` and `Error` are terminal until [`Lifecycle::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Initializing,
    Completed,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::Completed => "completed",
            Phase::Error => "error",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Completed,
            2 => Phase::Error,
            _ => Phase::Initializing,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Phase::Initializing => 0,
            Phase::Completed => 1,
            Phase::Error => 2,
        }
    }
}

/// One-shot `Initializing -> Completed | Error` transition.
///
/// Concurrent callers of [`Lifecycle::run`] are serialized; only the first
/// one executes the setup future, the others observe its outcome.
pub struct Lifecycle {
    phase: AtomicU8,
    gate: Mutex<()>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Initializing.to_u8()),
            gate: Mutex::new(()),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_completed(&self) -> bool {
        self.phase() == Phase::Completed
    }

    /// Run `setup` unless a terminal phase was already reached, and return
    /// whether the phase is `Completed`.
    pub async fn run<F, Fut>(&self, setup: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        if let Some(done) = self.terminal() {
            return done;
        }

        let _guard = self.gate.lock().await;
        if let Some(done) = self.terminal() {
            return done;
        }

        let ok = setup().await;
        let phase = if ok { Phase::Completed } else { Phase::Error };
        self.phase.store(phase.to_u8(), Ordering::SeqCst);
        ok
    }

    /// Return to `Initializing` so the next `run` executes setup again
    pub fn reset(&self) {
        self.phase
            .store(Phase::Initializing.to_u8(), Ordering::SeqCst);
    }

    fn terminal(&self) -> Option<bool> {
        match self.phase() {
            Phase::Initializing => None,
            Phase::Completed => Some(true),
            Phase::Error => Some(false),
        }
    }
}
