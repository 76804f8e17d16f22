//! State machine for the capture coordinator
//!
//! Defines the coordinator phases for one triggered capture:
//! Idle → Armed → Active → Draining → Done → (next trigger) Armed
//!
//! Any failure returns the machine to Idle. The phase lives in a single
//! atomic cell shared by the event loop (which arms) and the capture
//! thread (which advances it), so a trigger can never observe a stale
//! "idle" while a session is still running.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Coordinator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No session, ready for a trigger
    Idle,
    /// Trigger accepted, device not yet confirmed running
    Armed,
    /// Device acquired, sampling
    Active,
    /// Duration elapsed, writing the container
    Draining,
    /// Last session finished, ready for the next trigger
    Done,
}

impl Phase {
    fn as_u8(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Armed => 1,
            Phase::Active => 2,
            Phase::Draining => 3,
            Phase::Done => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Armed,
            2 => Phase::Active,
            3 => Phase::Draining,
            4 => Phase::Done,
            _ => Phase::Idle,
        }
    }

    /// A session exists and has not reached a terminal state
    pub fn is_busy(self) -> bool {
        matches!(self, Phase::Armed | Phase::Active | Phase::Draining)
    }

    /// A new trigger may start a session
    pub fn accepts_trigger(self) -> bool {
        matches!(self, Phase::Idle | Phase::Done)
    }

    /// Capture session status implied by this phase
    pub fn session_status(self) -> SessionStatus {
        match self {
            Phase::Idle => SessionStatus::Idle,
            Phase::Armed | Phase::Active => SessionStatus::Recording,
            Phase::Draining => SessionStatus::Finalizing,
            Phase::Done => SessionStatus::Completed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Armed => "armed",
            Phase::Active => "active",
            Phase::Draining => "draining",
            Phase::Done => "done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Recording,
    Finalizing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Recording => "recording",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, atomically updated coordinator phase
///
/// Cloning shares the same cell. Writers only go through the transition
/// methods; each returns the phase it found when the transition is not
/// allowed.
#[derive(Debug, Clone, Default)]
pub struct PhaseCell {
    inner: Arc<AtomicU8>,
}

impl PhaseCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase
    pub fn get(&self) -> Phase {
        Phase::from_u8(self.inner.load(Ordering::Acquire))
    }

    fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.inner
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Phase::from_u8)
    }

    /// Idle | Done → Armed
    pub fn try_arm(&self) -> Result<(), Phase> {
        match self.transition(Phase::Idle, Phase::Armed) {
            Err(Phase::Done) => self.transition(Phase::Done, Phase::Armed),
            other => other,
        }
    }

    /// Armed → Active
    pub fn activate(&self) -> Result<(), Phase> {
        self.transition(Phase::Armed, Phase::Active)
    }

    /// Active → Draining
    pub fn drain(&self) -> Result<(), Phase> {
        self.transition(Phase::Active, Phase::Draining)
    }

    /// Draining → Done
    pub fn finish(&self) -> Result<(), Phase> {
        self.transition(Phase::Draining, Phase::Done)
    }

    /// Any busy phase → Idle. Returns the phase the session failed in.
    pub fn fail(&self) -> Result<Phase, Phase> {
        let mut current = self.inner.load(Ordering::Acquire);
        loop {
            let phase = Phase::from_u8(current);
            if !phase.is_busy() {
                return Err(phase);
            }
            match self.inner.compare_exchange(
                current,
                Phase::Idle.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(phase),
                Err(actual) => current = actual,
            }
        }
    }
}
