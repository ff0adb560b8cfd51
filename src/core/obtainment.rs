//! Per-provider obtainment state machine.
//!
//! The multi-source fulfiller keeps one [`ObtainmentState`] per registered
//! provider:
//!
//! ```text
//!            start_obtaining_core            accept_obtained_core
//!   Idle ─────────────────────────▶ Obtaining ─────────────────────▶ HasCore
//!    ▲                                 │                               │
//!    │      indicate_obtainment_failed │                               │
//!    ├─────────────────────────────────┘                               │
//!    │      take_obtained_core                                         │
//!    ├─────────────────────────────────────────────────────────────────┘
//!    │      cancel_obtaining_core (from Obtaining or HasCore)
//!    └──────────────────────────────────────────────────────────────────
//! ```
//!
//! Each attempt carries a number. Outcomes reported for an attempt that is
//! no longer current (it was cancelled, or the provider was re-registered)
//! are refused, and a core delivered by such an attempt is handed back to the
//! caller for disposal.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::provider_collection::SharedProvider;
use crate::core::worker_core::WorkerCore;

enum ObtainmentPhase<C> {
    Idle,
    Obtaining {
        attempt: u64,
        cancel: CancellationToken,
    },
    HasCore(C),
}

/// Handle for one in-flight obtainment attempt.
#[derive(Debug, Clone)]
pub struct ObtainmentAttempt {
    /// Attempt number, unique per state.
    pub attempt: u64,
    /// Cancelled when the attempt is no longer wanted.
    pub cancel: CancellationToken,
}

/// Diagnostic view of one provider's obtainment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderObtainmentSnapshot {
    /// Provider identifier.
    pub provider_id: String,
    /// An attempt is in flight.
    pub is_obtaining: bool,
    /// A core has been obtained and is waiting for a request.
    pub has_core: bool,
}

/// Obtainment bookkeeping for one provider.
pub struct ObtainmentState<C: WorkerCore> {
    provider: SharedProvider<C>,
    phase: ObtainmentPhase<C>,
    next_attempt: u64,
}

impl<C: WorkerCore> ObtainmentState<C> {
    /// A fresh, idle state for `provider`.
    #[must_use]
    pub const fn new(provider: SharedProvider<C>) -> Self {
        Self {
            provider,
            phase: ObtainmentPhase::Idle,
            next_attempt: 0,
        }
    }

    /// The provider this state belongs to.
    #[must_use]
    pub const fn provider(&self) -> &SharedProvider<C> {
        &self.provider
    }

    /// Whether this state tracks exactly `provider`, not just a provider
    /// registered under the same id.
    #[must_use]
    pub fn belongs_to(&self, provider: &SharedProvider<C>) -> bool {
        Arc::ptr_eq(&self.provider, provider)
    }

    /// Neither obtaining nor holding a core.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.phase, ObtainmentPhase::Idle)
    }

    /// An attempt is in flight.
    #[must_use]
    pub const fn is_obtaining(&self) -> bool {
        matches!(self.phase, ObtainmentPhase::Obtaining { .. })
    }

    /// Holding an obtained core.
    #[must_use]
    pub const fn has_core(&self) -> bool {
        matches!(self.phase, ObtainmentPhase::HasCore(_))
    }

    /// Obtaining or holding; counts against the sizing target.
    #[must_use]
    pub const fn is_engaged(&self) -> bool {
        !self.is_idle()
    }

    /// `Idle -> Obtaining`. Returns `None` unless idle.
    ///
    /// The attempt's token is a child of `parent`.
    pub fn start_obtaining_core(&mut self, parent: &CancellationToken) -> Option<ObtainmentAttempt> {
        if !self.is_idle() {
            return None;
        }
        self.next_attempt += 1;
        let cancel = parent.child_token();
        self.phase = ObtainmentPhase::Obtaining {
            attempt: self.next_attempt,
            cancel: cancel.clone(),
        };
        Some(ObtainmentAttempt {
            attempt: self.next_attempt,
            cancel,
        })
    }

    fn is_current(&self, attempt: u64) -> bool {
        matches!(self.phase, ObtainmentPhase::Obtaining { attempt: current, .. } if current == attempt)
    }

    /// `Obtaining -> HasCore`.
    ///
    /// # Errors
    ///
    /// Hands `core` back if `attempt` is not the current attempt.
    pub fn accept_obtained_core(&mut self, attempt: u64, core: C) -> Result<(), C> {
        if !self.is_current(attempt) {
            return Err(core);
        }
        self.phase = ObtainmentPhase::HasCore(core);
        Ok(())
    }

    /// `Obtaining -> Idle` after a failed attempt. Returns `false` if stale.
    pub fn indicate_obtainment_failed(&mut self, attempt: u64) -> bool {
        if !self.is_current(attempt) {
            return false;
        }
        self.phase = ObtainmentPhase::Idle;
        true
    }

    /// `HasCore -> Idle`, handing the core to the caller.
    pub fn take_obtained_core(&mut self) -> Option<C> {
        match std::mem::replace(&mut self.phase, ObtainmentPhase::Idle) {
            ObtainmentPhase::HasCore(core) => Some(core),
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// Put back a core taken with [`Self::take_obtained_core`] that no
    /// request ended up needing.
    ///
    /// # Errors
    ///
    /// Hands `core` back unless the state is idle.
    pub fn restore_obtained_core(&mut self, core: C) -> Result<(), C> {
        if !self.is_idle() {
            return Err(core);
        }
        self.phase = ObtainmentPhase::HasCore(core);
        Ok(())
    }

    /// `Obtaining | HasCore -> Idle`.
    ///
    /// Cancels an in-flight attempt and returns a held core, which the
    /// caller must dispose.
    pub fn cancel_obtaining_core(&mut self) -> Option<C> {
        match std::mem::replace(&mut self.phase, ObtainmentPhase::Idle) {
            ObtainmentPhase::Idle => None,
            ObtainmentPhase::Obtaining { cancel, .. } => {
                cancel.cancel();
                None
            }
            ObtainmentPhase::HasCore(core) => Some(core),
        }
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ProviderObtainmentSnapshot {
        ProviderObtainmentSnapshot {
            provider_id: self.provider.id().to_owned(),
            is_obtaining: self.is_obtaining(),
            has_core: self.has_core(),
        }
    }
}
