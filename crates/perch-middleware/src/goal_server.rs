//! Single-slot goal server for "localize these objects" requests.
//!
//! At most one goal is current.  [`GoalServer::submit`] installs a new goal
//! and supersedes any earlier one; the superseded requester's
//! [`GoalHandle::outcome`] then resolves to `None` because the server drops
//! its reply channel instead of answering.  The pipeline side polls with
//! [`GoalServer::accept_new_goal`] and reports the result with one of the
//! `set_*` calls, which only act when the id still names the current goal.

use std::sync::{Arc, Mutex, MutexGuard};

use perch_types::Pose;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

/// Terminal status of a goal as seen by its requester.
#[derive(Debug, Clone, PartialEq)]
pub enum GoalOutcome {
    Succeeded(Vec<Pose>),
    Aborted(Vec<Pose>),
    Preempted(Vec<Pose>),
}

impl GoalOutcome {
    pub fn poses(&self) -> &[Pose] {
        match self {
            GoalOutcome::Succeeded(p) | GoalOutcome::Aborted(p) | GoalOutcome::Preempted(p) => p,
        }
    }
}

/// A goal as handed to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedGoal {
    pub id: Uuid,
    pub object_ids: Vec<String>,
}

/// The requester's end of a submitted goal.
#[derive(Debug)]
pub struct GoalHandle {
    id: Uuid,
    reply: oneshot::Receiver<GoalOutcome>,
}

impl GoalHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the goal to finish; `None` if it was superseded.
    pub async fn outcome(self) -> Option<GoalOutcome> {
        self.reply.await.ok()
    }
}

#[derive(Debug)]
struct GoalEntry {
    id: Uuid,
    object_ids: Vec<String>,
    accepted: bool,
    preempt_requested: bool,
    reply: oneshot::Sender<GoalOutcome>,
}

#[derive(Debug, Default)]
struct Shared {
    current: Mutex<Option<GoalEntry>>,
    incoming: Notify,
}

/// Cloneable handle to the goal slot; all clones share it.
#[derive(Debug, Clone, Default)]
pub struct GoalServer {
    shared: Arc<Shared>,
}

impl GoalServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<GoalEntry>> {
        self.shared.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Submit a goal, superseding the current one.
    pub fn submit(&self, object_ids: Vec<String>) -> GoalHandle {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let previous = self.slot().replace(GoalEntry {
            id,
            object_ids,
            accepted: false,
            preempt_requested: false,
            reply: tx,
        });
        if let Some(old) = previous {
            info!(old_goal = %old.id, new_goal = %id, "goal superseded");
        }
        self.shared.incoming.notify_one();
        GoalHandle { id, reply: rx }
    }

    /// Resolves when a goal has been submitted since the last wake-up.
    pub async fn notified(&self) {
        self.shared.incoming.notified().await;
    }

    /// Take the pending goal, if one has been submitted and not yet accepted.
    pub fn accept_new_goal(&self) -> Option<AcceptedGoal> {
        let mut slot = self.slot();
        let entry = slot.as_mut().filter(|e| !e.accepted)?;
        entry.accepted = true;
        debug!(goal = %entry.id, objects = ?entry.object_ids, "goal accepted");
        Some(AcceptedGoal {
            id: entry.id,
            object_ids: entry.object_ids.clone(),
        })
    }

    /// Ask the pipeline to stop working on goal `id`.  Returns `false` when
    /// `id` is not current.
    pub fn preempt(&self, id: Uuid) -> bool {
        match self.slot().as_mut() {
            Some(entry) if entry.id == id => {
                entry.preempt_requested = true;
                true
            }
            _ => false,
        }
    }

    /// Preempt whichever goal is current.
    pub fn preempt_current(&self) -> Option<Uuid> {
        let mut slot = self.slot();
        let entry = slot.as_mut()?;
        entry.preempt_requested = true;
        Some(entry.id)
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.slot().as_ref().is_some_and(|e| e.id == id)
    }

    pub fn is_preempt_requested(&self, id: Uuid) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|e| e.id == id && e.preempt_requested)
    }

    /// The current goal, accepted or not.
    pub fn active_goal(&self) -> Option<AcceptedGoal> {
        self.slot().as_ref().map(|e| AcceptedGoal {
            id: e.id,
            object_ids: e.object_ids.clone(),
        })
    }

    pub fn set_succeeded(&self, id: Uuid, poses: Vec<Pose>) -> bool {
        self.finish(id, GoalOutcome::Succeeded(poses))
    }

    pub fn set_aborted(&self, id: Uuid, poses: Vec<Pose>) -> bool {
        self.finish(id, GoalOutcome::Aborted(poses))
    }

    pub fn set_preempted(&self, id: Uuid, poses: Vec<Pose>) -> bool {
        self.finish(id, GoalOutcome::Preempted(poses))
    }

    fn finish(&self, id: Uuid, outcome: GoalOutcome) -> bool {
        let entry = {
            let mut slot = self.slot();
            if !slot.as_ref().is_some_and(|e| e.id == id) {
                debug!(goal = %id, "ignoring result for inactive goal");
                return false;
            }
            slot.take()
        };
        if let Some(entry) = entry {
            // The requester may have stopped waiting.
            let _ = entry.reply.send(outcome);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn accepted_goal_reports_success() {
        let server = GoalServer::new();
        let handle = server.submit(ids(&["cup", "bowl"]));

        let goal = server.accept_new_goal().unwrap();
        assert_eq!(goal.id, handle.id());
        assert_eq!(goal.object_ids, ids(&["cup", "bowl"]));
        assert!(server.accept_new_goal().is_none(), "accepted only once");

        assert!(server.set_succeeded(goal.id, vec![Pose::default()]));
        assert_eq!(handle.outcome().await, Some(GoalOutcome::Succeeded(vec![Pose::default()])));
        assert!(server.active_goal().is_none());
    }

    #[tokio::test]
    async fn new_goal_supersedes_old_one_silently() {
        let server = GoalServer::new();
        let first = server.submit(ids(&["cup"]));
        let old = server.accept_new_goal().unwrap();
        let second = server.submit(ids(&["bowl"]));

        assert!(!server.is_active(old.id));
        assert!(!server.set_succeeded(old.id, vec![]));
        assert_eq!(first.outcome().await, None);

        let goal = server.accept_new_goal().unwrap();
        assert_eq!(goal.id, second.id());
        server.set_aborted(goal.id, vec![]);
        assert_eq!(second.outcome().await, Some(GoalOutcome::Aborted(vec![])));
    }

    #[test]
    fn preempt_only_marks_the_current_goal() {
        let server = GoalServer::new();
        let handle = server.submit(ids(&["cup"]));
        assert!(!server.preempt(Uuid::new_v4()));
        assert!(!server.is_preempt_requested(handle.id()));
        assert!(server.preempt(handle.id()));
        assert!(server.is_preempt_requested(handle.id()));
        assert_eq!(server.preempt_current(), Some(handle.id()));
    }

    #[tokio::test]
    async fn notified_wakes_on_submit() {
        let server = GoalServer::new();
        let waiter = server.clone();
        let task = tokio::spawn(async move {
            waiter.notified().await;
            waiter.accept_new_goal()
        });
        tokio::task::yield_now().await;
        server.submit(ids(&["cup"]));
        let goal = task.await.unwrap().unwrap();
        assert_eq!(goal.object_ids, ids(&["cup"]));
    }
}
