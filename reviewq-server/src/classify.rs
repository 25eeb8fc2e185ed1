//! Decides which inbound events the pipeline acts on.

/// Actions on a pull request that warrant a (re-)review.
pub const REVIEW_ACTIONS: &[&str] = &["opened", "synchronize", "reopened"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub in_scope: bool,
}

/// Pure check on the event kind (the `X-GitHub-Event` header) and the
/// payload's `action`. A missing action is never in scope.
pub fn classify(event_kind: &str, action: Option<&str>) -> Classification {
    let in_scope = event_kind == "pull_request"
        && action.is_some_and(|action| REVIEW_ACTIONS.contains(&action));
    Classification { in_scope }
}
