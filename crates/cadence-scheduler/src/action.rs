//! Action definitions — the core data model for deferred work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted record describing one deferred unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAction {
    /// Unique action ID, assigned at creation and never changed.
    pub id: Uuid,
    /// Key identifying who this action belongs to (e.g. a conversation ID).
    pub owner_key: String,
    /// What kind of deferred work this is.
    pub kind: ActionKind,
    /// When the action becomes due. Fixed at creation — rescheduling means
    /// cancelling and creating a new action.
    pub due_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: ActionStatus,
    /// Opaque key-value payload handed to the execution callback.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When a worker claimed this action; drives stale-claim recovery.
    pub claimed_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

/// What kind of deferred work an action represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Re-engage a conversation that has gone quiet.
    FollowUp,
    /// Remind a participant shortly before a booked event.
    PreEventReminder,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::FollowUp => "follow_up",
            ActionKind::PreEventReminder => "pre_event_reminder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "follow_up" => Some(ActionKind::FollowUp),
            "pre_event_reminder" => Some(ActionKind::PreEventReminder),
            _ => None,
        }
    }
}

/// Action lifecycle status.
///
/// Legal transitions form a DAG: pending → claimed → executed,
/// claimed → pending (stale-claim recovery), pending → cancelled.
/// `Executed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Claimed,
    Executed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Claimed => "claimed",
            ActionStatus::Executed => "executed",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActionStatus::Pending),
            "claimed" => Some(ActionStatus::Claimed),
            "executed" => Some(ActionStatus::Executed),
            "cancelled" => Some(ActionStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this status can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Executed | ActionStatus::Cancelled)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ScheduledAction {
    /// Create a follow-up action due at `due_at`.
    pub fn follow_up(owner_key: &str, due_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self::new(owner_key, ActionKind::FollowUp, due_at, payload)
    }

    /// Create a pre-event reminder due at `due_at`.
    pub fn pre_event_reminder(
        owner_key: &str,
        due_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(owner_key, ActionKind::PreEventReminder, due_at, payload)
    }

    fn new(
        owner_key: &str,
        kind: ActionKind,
        due_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_key: owner_key.to_string(),
            kind,
            due_at,
            status: ActionStatus::Pending,
            payload,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            executed_at: None,
            cancelled_at: None,
            cancel_reason: None,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_action_is_pending() {
        let action = ScheduledAction::follow_up(
            "conv-42",
            Utc::now() + chrono::Duration::hours(4),
            serde_json::json!({"reason": "no reply"}),
        );
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.kind, ActionKind::FollowUp);
        assert!(action.claimed_at.is_none());
        assert!(!action.status.is_terminal());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            ActionStatus::Pending,
            ActionStatus::Claimed,
            ActionStatus::Executed,
            ActionStatus::Cancelled,
        ] {
            assert_eq!(ActionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ActionStatus::parse("running"), None);
    }

    #[test]
    fn test_kind_string_round_trip() {
        for kind in [ActionKind::FollowUp, ActionKind::PreEventReminder] {
            assert_eq!(ActionKind::parse(kind.as_str()), Some(kind));
        }
    }
}
