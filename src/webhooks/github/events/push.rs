use serde::Deserialize;

use crate::webhooks::github::events::Repository;

const BRANCH_PREFIX: &str = "refs/heads/";

#[derive(Debug, Deserialize)]
pub struct PushEvent {
    pub r#ref: Option<String>,
    /// Commit the branch points to after the push
    pub after: Option<String>,
    pub head_commit: Option<Commit>,
    pub repository: Option<Repository>,
}

#[derive(Debug, Deserialize)]
pub struct Commit {
    pub id: String,
    pub message: String,
}

impl PushEvent {
    /// Branch name of the pushed ref, `refs/heads/` stripped. Other refs (tags...) are kept
    /// whole so they never match a branch name.
    pub fn branch(&self) -> Option<&str> {
        self.r#ref
            .as_deref()
            .map(|r| r.strip_prefix(BRANCH_PREFIX).unwrap_or(r))
    }
}

impl Commit {
    pub fn title(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}
