use std::io;

use chrono::Utc;
use rocket::{
    catchers,
    http::Status,
    response::{self, Responder},
    routes,
    serde::json::Json,
    Build, Request, Rocket, State,
};
use serde::Deserialize;
use serde_json::{json, value::RawValue, Value};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

pub mod github;
pub use github::github_webhook;

use crate::{
    deploy::{AuditLog, DeployRequest},
    registry::{webhook_path, NotFound, Registry},
    router::{AuthError, RouteError},
    webhooks::github::signing::validate_signature,
};

const DEFAULT_DEPLOYMENTS_LIMIT: usize = 20;

pub struct DeploySender(pub UnboundedSender<DeployRequest>);

/// Errors reported synchronously to the webhook sender.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("repository not found: {}", .0.identifier)]
    RepositoryNotFound(NotFound),
    #[error("signature verification failed: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("request header needs at most one event type, got {0}")]
    AmbiguousEvent(usize),
    #[error("payload exceeds the size limit")]
    PayloadTooLarge,
    #[error(transparent)]
    InvalidPayload(#[from] RouteError),
    #[error("deployment worker is not running")]
    DispatchUnavailable,
    #[error("couldn't read audit log: {0}")]
    AuditUnavailable(#[from] io::Error),
}

impl From<NotFound> for WebhookError {
    fn from(not_found: NotFound) -> Self {
        Self::RepositoryNotFound(not_found)
    }
}

impl WebhookError {
    fn status(&self) -> Status {
        match self {
            Self::RepositoryNotFound(_) => Status::NotFound,
            Self::Unauthorized(_) => Status::Unauthorized,
            Self::AmbiguousEvent(_) | Self::InvalidPayload(_) => Status::BadRequest,
            Self::PayloadTooLarge => Status::PayloadTooLarge,
            Self::DispatchUnavailable => Status::ServiceUnavailable,
            Self::AuditUnavailable(_) => Status::InternalServerError,
        }
    }

    fn body(&self) -> Value {
        match self {
            Self::RepositoryNotFound(not_found) => json!({
                "error": "Repository not found",
                "repository": not_found.identifier,
                "available_repositories": not_found.known,
            }),
            Self::Unauthorized(e) => json!({
                "error": "Signature verification failed",
                "message": e.to_string(),
            }),
            other => json!({ "error": other.to_string() }),
        }
    }
}

impl<'r> Responder<'r, 'static> for WebhookError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        (self.status(), Json(self.body())).respond_to(request)
    }
}

/// Mounts every route on `rocket` along with the state they need.
pub fn mount(
    rocket: Rocket<Build>,
    registry: Registry,
    audit: AuditLog,
    sender: DeploySender,
) -> Rocket<Build> {
    rocket
        .mount(
            "/",
            routes![github_webhook, health, config, test_signature, deployments],
        )
        .register("/", catchers![not_found, default_catcher])
        .manage(registry)
        .manage(audit)
        .manage(sender)
}

#[rocket::get("/health")]
fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "server": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Never exposes secrets, only whether one is set.
#[rocket::get("/config")]
async fn config(registry: &State<Registry>) -> Json<Value> {
    let mut repositories = Vec::new();
    for (identifier, repo) in registry.iter() {
        let script_exists = tokio::fs::try_exists(&repo.deploy_script)
            .await
            .unwrap_or(false);
        repositories.push(json!({
            "repository": identifier,
            "webhook_path": webhook_path(identifier),
            "has_secret": !repo.secret.is_empty(),
            "verify_signature": repo.verify_signature,
            "deploy_script": repo.deploy_script,
            "script_exists": script_exists,
            "branch": repo.branch,
        }));
    }

    Json(json!({
        "status": "ok",
        "repositories": repositories,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SignatureTest {
    secret: Option<String>,
    signature: Option<String>,
    payload: Option<Box<RawValue>>,
}

impl SignatureTest {
    /// A JSON string payload is signed as its content, anything else as its JSON text.
    fn payload_bytes(&self) -> Option<Vec<u8>> {
        let raw = self.payload.as_ref()?.get();
        let bytes = match serde_json::from_str::<Option<String>>(raw) {
            Ok(Some(s)) => s.into_bytes(),
            Ok(None) => return None,
            Err(_) => raw.as_bytes().to_vec(),
        };

        Some(bytes).filter(|b| !b.is_empty())
    }
}

#[rocket::post("/test-signature", format = "json", data = "<test>")]
fn test_signature(test: Json<SignatureTest>) -> (Status, Json<Value>) {
    let secret = test.secret.as_deref().filter(|s| !s.is_empty());
    let signature = test.signature.as_deref().filter(|s| !s.is_empty());
    let payload = test.payload_bytes();

    let (secret, signature, payload) = match (secret, signature, payload) {
        (Some(secret), Some(signature), Some(payload)) => (secret, signature, payload),
        _ => {
            return (
                Status::BadRequest,
                Json(json!({
                    "error": "Missing parameters",
                    "required": ["secret", "signature", "payload"],
                })),
            )
        }
    };

    let valid = validate_signature(secret.as_bytes(), Some(signature), &payload);
    debug!("signature test: valid = {}", valid);

    (
        Status::Ok,
        Json(json!({
            "valid": valid,
            "message": if valid { "Signature is valid" } else { "Signature is invalid" },
        })),
    )
}

#[rocket::get("/deployments?<limit>")]
async fn deployments(
    limit: Option<usize>,
    audit: &State<AuditLog>,
) -> Result<Json<Value>, WebhookError> {
    let records = audit
        .recent(limit.unwrap_or(DEFAULT_DEPLOYMENTS_LIMIT))
        .await?;

    Ok(Json(json!({
        "status": "ok",
        "deployments": records,
    })))
}

#[rocket::catch(404)]
fn not_found(request: &Request<'_>) -> (Status, Json<Value>) {
    let mut post_routes: Vec<String> = request
        .rocket()
        .state::<Registry>()
        .map(|registry| {
            registry
                .identifiers()
                .iter()
                .map(|identifier| webhook_path(identifier))
                .collect()
        })
        .unwrap_or_default();
    post_routes.push("/test-signature".to_owned());

    (
        Status::NotFound,
        Json(json!({
            "error": "Route not found",
            "path": request.uri().path().as_str(),
            "available_routes": {
                "GET": ["/health", "/config", "/deployments"],
                "POST": post_routes,
            },
        })),
    )
}

#[rocket::catch(default)]
fn default_catcher(status: Status, request: &Request<'_>) -> (Status, Json<Value>) {
    warn!("{} on {} {}", status, request.method(), request.uri());
    (
        status,
        Json(json!({ "error": status.reason().unwrap_or("Unknown error") })),
    )
}
