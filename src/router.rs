use std::{fmt::Display, sync::Arc};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::RepositoryConfig,
    deploy::DeployRequest,
    utils::shorten_content,
    webhooks::github::{signing::validate_signature, PingEvent, PushEvent},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Push,
    Ping,
    Other(Option<String>),
}

impl EventKind {
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some("push") => Self::Push,
            Some("ping") => Self::Ping,
            other => Self::Other(other.map(str::to_owned)),
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Ping => write!(f, "ping"),
            Self::Other(Some(kind)) => write!(f, "{}", kind),
            Self::Other(None) => write!(f, "unknown"),
        }
    }
}

/// A webhook delivery, owned by the request that received it.
#[derive(Debug)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum Route {
    /// The hosting service is checking the hook works, nothing to deploy.
    Pong,
    Deploy(DeployRequest),
    /// Push on a branch we don't deploy.
    Skip { branch: String, target: String },
    Ignore,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no signature provided")]
    SignatureMissing,
    #[error("signature does not match payload")]
    SignatureInvalid,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid push payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Checks the event signature when the repository asks for it.
pub fn authenticate(config: &RepositoryConfig, event: &InboundEvent) -> Result<(), AuthError> {
    if !config.verify_signature {
        debug!("signature verification disabled, skipping");
        return Ok(());
    }

    let signature = event.signature.as_deref().filter(|s| !s.is_empty());
    if signature.is_none() {
        return Err(AuthError::SignatureMissing);
    }

    if validate_signature(config.secret.as_bytes(), signature, &event.body) {
        debug!("signature verified");
        Ok(())
    } else {
        Err(AuthError::SignatureInvalid)
    }
}

/// Decides what an authenticated event leads to. Nothing is spawned here, a deployment is
/// only described by the returned [`Route::Deploy`].
pub fn route(
    identifier: &str,
    config: &Arc<RepositoryConfig>,
    event: &InboundEvent,
) -> Result<Route, RouteError> {
    match &event.kind {
        EventKind::Ping => {
            // pings aren't worth rejecting over a weird body
            let ping: PingEvent = serde_json::from_slice(&event.body).unwrap_or_default();
            info!(
                "ping for {} from {} (hook {:?}): {}",
                identifier,
                ping.repository
                    .as_ref()
                    .map_or("unknown repository", |repo| repo.full_name.as_str()),
                ping.hook_id,
                ping.zen.as_deref().unwrap_or("no zen")
            );
            Ok(Route::Pong)
        }
        EventKind::Push => route_push(identifier, config, event),
        EventKind::Other(kind) => {
            info!("ignoring event {:?} for {}", kind, identifier);
            Ok(Route::Ignore)
        }
    }
}

fn route_push(
    identifier: &str,
    config: &Arc<RepositoryConfig>,
    event: &InboundEvent,
) -> Result<Route, RouteError> {
    let push: PushEvent = serde_json::from_slice(&event.body)?;
    let branch = push.branch().unwrap_or("unknown").to_owned();

    if branch != config.branch {
        info!(
            "skipping deployment of {}: branch {} does not match {}",
            identifier, branch, config.branch
        );
        return Ok(Route::Skip {
            branch,
            target: config.branch.clone(),
        });
    }

    let repo_name = push
        .repository
        .map(|repo| repo.full_name)
        .unwrap_or_else(|| identifier.to_owned());
    let commit_id = push
        .after
        .or_else(|| push.head_commit.as_ref().map(|c| c.id.clone()));
    let commit_message = push.head_commit.as_ref().map(|c| c.message.clone());

    info!(
        "dispatching deployment of {} on {} ({})",
        config.project_name,
        branch,
        push.head_commit
            .as_ref()
            .map(|c| shorten_content(c.title()))
            .unwrap_or_else(|| "no head commit".to_owned())
    );

    Ok(Route::Deploy(DeployRequest {
        identifier: identifier.to_owned(),
        repo_name,
        branch,
        commit_id,
        commit_message,
        config: Arc::clone(config),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{registry::repository, webhooks::github::signing::expected_signature};

    fn event(kind: EventKind, body: &str, signature: Option<String>) -> InboundEvent {
        InboundEvent {
            kind,
            signature,
            body: body.as_bytes().to_vec(),
        }
    }

    fn signed(kind: EventKind, body: &str) -> InboundEvent {
        let signature = expected_signature(b"topsecret", body.as_bytes());
        event(kind, body, signature)
    }

    #[test]
    fn event_kind_from_header() {
        assert_eq!(EventKind::from_header(Some("push")), EventKind::Push);
        assert_eq!(EventKind::from_header(Some("ping")), EventKind::Ping);
        assert_eq!(
            EventKind::from_header(Some("issues")),
            EventKind::Other(Some("issues".to_owned()))
        );
        assert_eq!(EventKind::from_header(None), EventKind::Other(None));
    }

    #[test]
    fn authenticate_accepts_valid_signature() {
        let config = repository("main", "/tmp/deploy.sh");
        let event = signed(EventKind::Push, r#"{"ref":"refs/heads/main"}"#);
        assert_eq!(authenticate(&config, &event), Ok(()));
    }

    #[test]
    fn authenticate_rejects_missing_and_invalid_signatures() {
        let config = repository("main", "/tmp/deploy.sh");

        let missing = event(EventKind::Push, "{}", None);
        assert_eq!(
            authenticate(&config, &missing),
            Err(AuthError::SignatureMissing)
        );

        let empty = event(EventKind::Push, "{}", Some(String::new()));
        assert_eq!(authenticate(&config, &empty), Err(AuthError::SignatureMissing));

        let mut tampered = signed(EventKind::Push, r#"{"ref":"refs/heads/main"}"#);
        tampered.body = br#"{"ref":"refs/heads/evil"}"#.to_vec();
        assert_eq!(
            authenticate(&config, &tampered),
            Err(AuthError::SignatureInvalid)
        );
    }

    #[test]
    fn authenticate_trusts_unverified_repositories() {
        let mut config = repository("main", "/tmp/deploy.sh");
        config.verify_signature = false;
        let unsigned = event(EventKind::Push, "{}", None);
        assert_eq!(authenticate(&config, &unsigned), Ok(()));
    }

    #[test]
    fn ping_is_answered_without_deployment() {
        let config = Arc::new(repository("main", "/tmp/deploy.sh"));
        let ping = event(EventKind::Ping, r#"{"zen":"Keep it simple.","hook_id":1}"#, None);
        assert!(matches!(route("acme/site", &config, &ping), Ok(Route::Pong)));

        let garbage = event(EventKind::Ping, "not json", None);
        assert!(matches!(route("acme/site", &config, &garbage), Ok(Route::Pong)));
    }

    #[test]
    fn push_to_other_branch_is_skipped() {
        let config = Arc::new(repository("main", "/tmp/deploy.sh"));
        let push = event(EventKind::Push, r#"{"ref":"refs/heads/develop"}"#, None);

        match route("acme/site", &config, &push).unwrap() {
            Route::Skip { branch, target } => {
                assert_eq!(branch, "develop");
                assert_eq!(target, "main");
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn push_to_target_branch_is_dispatched() {
        let config = Arc::new(repository("main", "/tmp/deploy.sh"));
        let body = r#"{
            "ref": "refs/heads/main",
            "after": "2344c05c8136207b55090d1d2e37b094db37c112",
            "repository": {"full_name": "acme/site"},
            "head_commit": {"id": "2344c05c8136207b55090d1d2e37b094db37c112", "message": "ship it"}
        }"#;
        let push = event(EventKind::Push, body, None);

        match route("acme/site", &config, &push).unwrap() {
            Route::Deploy(request) => {
                assert_eq!(request.identifier, "acme/site");
                assert_eq!(request.repo_name, "acme/site");
                assert_eq!(request.branch, "main");
                assert_eq!(
                    request.commit_id.as_deref(),
                    Some("2344c05c8136207b55090d1d2e37b094db37c112")
                );
                assert_eq!(request.commit_message.as_deref(), Some("ship it"));
            }
            other => panic!("expected deployment, got {:?}", other),
        }
    }

    #[test]
    fn minimal_push_falls_back_to_identifier() {
        let config = Arc::new(repository("main", "/tmp/deploy.sh"));
        let push = event(EventKind::Push, r#"{"ref":"refs/heads/main"}"#, None);

        match route("acme/site", &config, &push).unwrap() {
            Route::Deploy(request) => {
                assert_eq!(request.repo_name, "acme/site");
                assert_eq!(request.commit_id, None);
                assert_eq!(request.commit_message, None);
            }
            other => panic!("expected deployment, got {:?}", other),
        }
    }

    #[test]
    fn commit_id_falls_back_to_head_commit() {
        let config = Arc::new(repository("main", "/tmp/deploy.sh"));
        let body = r#"{"ref":"refs/heads/main","head_commit":{"id":"abc123","message":"m"}}"#;
        let push = event(EventKind::Push, body, None);

        match route("acme/site", &config, &push).unwrap() {
            Route::Deploy(request) => assert_eq!(request.commit_id.as_deref(), Some("abc123")),
            other => panic!("expected deployment, got {:?}", other),
        }
    }

    #[test]
    fn other_events_are_ignored() {
        let config = Arc::new(repository("main", "/tmp/deploy.sh"));
        let issues = event(EventKind::Other(Some("issues".to_owned())), "{}", None);
        assert!(matches!(route("acme/site", &config, &issues), Ok(Route::Ignore)));
    }

    #[test]
    fn invalid_push_payload_is_an_error() {
        let config = Arc::new(repository("main", "/tmp/deploy.sh"));
        let push = event(EventKind::Push, "not json", None);
        assert!(matches!(
            route("acme/site", &config, &push),
            Err(RouteError::InvalidPayload(_))
        ));
    }
}
