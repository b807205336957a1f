//! [`GoalLifecycle`] – the capture/request cycle state machine.
//!
//! ```text
//! Idle → CapturePending → Accumulating → Filtering → AwaitingBackend
//!      → Publishing → Succeeded | Aborted → Idle
//! ```
//!
//! The machine is pure: it holds no clouds and does no I/O.  The pipeline
//! feeds it triggers and frame timestamps and reports stage completions; the
//! machine decides what is admitted.
//!
//! Trigger rules:
//!
//! * A manual trigger re-runs the last requested object list and is ignored
//!   when nothing has been requested yet.
//! * A named-object request is a one-element request.
//! * A goal with no identifiers is rejected outright; it never enters
//!   capture.
//! * Outside `Idle` only a goal is acted on, and only while capture has not
//!   reached filtering: it replaces the in-progress capture.  Everything
//!   else arriving mid-cycle is ignored.
//!
//! Every trigger refreshes the trigger timestamp.  With wait-for-recent
//! enabled, frames stamped before it are rejected as stale.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    CapturePending,
    Accumulating { collected: usize },
    Filtering,
    AwaitingBackend,
    Publishing,
    Succeeded,
    Aborted,
}

impl CycleState {
    pub fn is_capturing(self) -> bool {
        matches!(self, CycleState::CapturePending | CycleState::Accumulating { .. })
    }
}

/// Something that may start a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Keypress `'c'`.
    Manual,
    NamedObject(String),
    Goal { id: Uuid, object_ids: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    Started,
    /// A goal took over an in-progress capture; buffered frames must go.
    Replaced,
    Ignored,
    /// Empty goal; report it aborted with no poses.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAdmission {
    NotCapturing,
    Stale,
    Admitted,
}

#[derive(Debug)]
pub struct GoalLifecycle {
    state: CycleState,
    wait_for_recent: bool,
    requested: Vec<String>,
    goal: Option<Uuid>,
    triggered_at: Option<DateTime<Utc>>,
    last_terminal: Option<CycleState>,
}

impl GoalLifecycle {
    pub fn new(wait_for_recent: bool) -> Self {
        Self {
            state: CycleState::Idle,
            wait_for_recent,
            requested: Vec::new(),
            goal: None,
            triggered_at: None,
            last_terminal: None,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Identifiers of the current (or most recent) request, in order.
    pub fn requested_objects(&self) -> &[String] {
        &self.requested
    }

    /// The goal the current cycle reports to, if it was goal-triggered.
    pub fn active_goal(&self) -> Option<Uuid> {
        self.goal
    }

    pub fn triggered_at(&self) -> Option<DateTime<Utc>> {
        self.triggered_at
    }

    /// `Succeeded` or `Aborted` of the last finished cycle.
    pub fn last_terminal(&self) -> Option<CycleState> {
        self.last_terminal
    }

    /// Whether a goal arriving now would be acted on.
    pub fn accepts_goals(&self) -> bool {
        self.state == CycleState::Idle || self.state.is_capturing()
    }

    pub fn trigger(&mut self, trigger: Trigger, at: DateTime<Utc>) -> TriggerDecision {
        self.triggered_at = Some(at);
        let idle = self.state == CycleState::Idle;

        let decision = match trigger {
            Trigger::Goal { object_ids, .. } if object_ids.is_empty() => TriggerDecision::Rejected,
            Trigger::Goal { id, object_ids } if idle || self.state.is_capturing() => {
                let decision = if idle {
                    TriggerDecision::Started
                } else {
                    TriggerDecision::Replaced
                };
                self.requested = object_ids;
                self.goal = Some(id);
                self.state = CycleState::CapturePending;
                decision
            }
            _ if !idle => TriggerDecision::Ignored,
            Trigger::Manual if self.requested.is_empty() => {
                info!("capture requested but no objects have been requested yet");
                TriggerDecision::Ignored
            }
            Trigger::Manual => {
                self.goal = None;
                self.state = CycleState::CapturePending;
                TriggerDecision::Started
            }
            Trigger::NamedObject(id) => {
                self.requested = vec![id];
                self.goal = None;
                self.state = CycleState::CapturePending;
                TriggerDecision::Started
            }
            Trigger::Goal { .. } => TriggerDecision::Ignored,
        };

        debug!(?decision, state = ?self.state, objects = ?self.requested, "trigger handled");
        decision
    }

    /// Decide whether a frame stamped `stamp` counts toward the capture.
    pub fn admit_frame(&mut self, stamp: DateTime<Utc>) -> FrameAdmission {
        let collected = match self.state {
            CycleState::CapturePending => 0,
            CycleState::Accumulating { collected } => collected,
            _ => return FrameAdmission::NotCapturing,
        };
        if self.wait_for_recent && self.triggered_at.is_some_and(|t| stamp < t) {
            debug!(%stamp, "dropping frame older than the trigger");
            return FrameAdmission::Stale;
        }
        self.state = CycleState::Accumulating {
            collected: collected + 1,
        };
        FrameAdmission::Admitted
    }

    /// Drop back to `CapturePending` after an unusable admitted frame.
    pub fn discard_frame(&mut self) {
        if let CycleState::Accumulating { collected } = self.state {
            self.state = match collected {
                0 | 1 => CycleState::CapturePending,
                n => CycleState::Accumulating { collected: n - 1 },
            };
        }
    }

    pub fn begin_filtering(&mut self) -> bool {
        self.advance(self.state.is_capturing(), CycleState::Filtering)
    }

    pub fn begin_request(&mut self) -> bool {
        self.advance(self.state == CycleState::Filtering, CycleState::AwaitingBackend)
    }

    pub fn begin_publishing(&mut self) -> bool {
        self.advance(self.state == CycleState::AwaitingBackend, CycleState::Publishing)
    }

    /// Enter `Succeeded` or `Aborted`.  Aborting is allowed from any
    /// in-cycle state.
    pub fn finish(&mut self, succeeded: bool) -> bool {
        if succeeded {
            self.advance(self.state == CycleState::Publishing, CycleState::Succeeded)
        } else {
            self.advance(self.state != CycleState::Idle, CycleState::Aborted)
        }
    }

    /// Return to `Idle`, remembering how the cycle ended.
    pub fn reset(&mut self) {
        if matches!(self.state, CycleState::Succeeded | CycleState::Aborted) {
            self.last_terminal = Some(self.state);
        }
        self.state = CycleState::Idle;
        self.goal = None;
    }

    fn advance(&mut self, allowed: bool, next: CycleState) -> bool {
        if !allowed {
            warn!(from = ?self.state, to = ?next, "illegal lifecycle transition");
            return false;
        }
        self.state = next;
        true
    }
}
