use serde::Deserialize;

use crate::webhooks::github::events::Repository;

#[derive(Debug, Default, Deserialize)]
pub struct PingEvent {
    pub zen: Option<String>,
    pub hook_id: Option<u64>,
    pub repository: Option<Repository>,
}
