//! Client-facing submit/poll results.

use crate::queue::Priority;
use serde::{Deserialize, Serialize};

/// Progress hint while no cache entry exists yet.
pub const PROGRESS_QUEUED: u8 = 50;
/// Progress hint while the entry is loading.
pub const PROGRESS_LOADING: u8 = 70;

/// Who is asking; decides the priority of the work it triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerTier {
    #[default]
    Anonymous,
    Authenticated,
    Privileged,
}

impl CallerTier {
    pub fn priority(self) -> Priority {
        match self {
            CallerTier::Privileged => Priority::ELEVATED,
            CallerTier::Anonymous | CallerTier::Authenticated => Priority::NORMAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Served from cache.
    Ready { payload: serde_json::Value },
    /// Poll `req_id` for the result. `enqueued` is true when this submission started the work.
    Pending {
        req_id: String,
        poll_url: String,
        enqueued: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollOutcome {
    Pending { progress: u8 },
    Loading { progress: u8 },
    Ready { payload: serde_json::Value },
    Failed { error: String },
    NotFound,
}

impl PollOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. } | PollOutcome::Failed { .. })
    }

    /// Position in the lifecycle: pending < loading < ready/failed.
    pub fn rank(&self) -> u8 {
        match self {
            PollOutcome::NotFound => 0,
            PollOutcome::Pending { .. } => 1,
            PollOutcome::Loading { .. } => 2,
            PollOutcome::Ready { .. } | PollOutcome::Failed { .. } => 3,
        }
    }
}

pub fn poll_url(req_id: &str) -> String {
    format!("/api/public/query/fuzzy/result?req_id={req_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_privileged_callers_are_elevated() {
        assert_eq!(CallerTier::Privileged.priority(), Priority::ELEVATED);
        assert_eq!(CallerTier::Authenticated.priority(), Priority::NORMAL);
        assert_eq!(CallerTier::default().priority(), Priority::NORMAL);
    }

    #[test]
    fn poll_outcome_serializes_with_status_tag() {
        let value = serde_json::to_value(PollOutcome::Loading {
            progress: PROGRESS_LOADING,
        })
        .unwrap();
        assert_eq!(value, json!({"status": "loading", "progress": 70}));
        assert_eq!(
            serde_json::to_value(PollOutcome::NotFound).unwrap(),
            json!({"status": "not_found"})
        );
    }

    #[test]
    fn submit_pending_carries_poll_url() {
        let value = serde_json::to_value(SubmitOutcome::Pending {
            req_id: "01J".into(),
            poll_url: poll_url("01J"),
            enqueued: true,
        })
        .unwrap();
        assert_eq!(value["poll_url"], "/api/public/query/fuzzy/result?req_id=01J");
        assert_eq!(value["status"], "pending");
    }
}
