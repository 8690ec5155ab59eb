use std::convert::Infallible;

use rocket::{
    request::{FromRequest, Outcome},
    serde::json::Json,
    Request, State,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, trace};

pub mod signing;
use signing::{RawPayload, SIGNATURE_PREFIX};

mod events;
pub use events::*;

use crate::{
    registry::Registry,
    router::{self, EventKind, InboundEvent, Route},
    webhooks::{DeploySender, WebhookError},
};

// Gitea and Gogs send the GitHub headers too, their own are only used as a fallback.
const X_GITHUB_EVENT: &str = "X-GitHub-Event";
const EVENT_HEADERS: &[&str] = &[X_GITHUB_EVENT, "X-Gitea-Event", "X-Gogs-Event"];

const X_HUB_SIGNATURE_256: &str = "X-Hub-Signature-256";
// bare hex digest, without the `sha256=` prefix
const HEX_SIGNATURE_HEADERS: &[&str] = &["X-Gogs-Signature", "X-Gitea-Signature"];

#[rocket::post("/webhook/<repository>", data = "<payload>")]
pub fn github_webhook(
    repository: &str,
    headers: WebhookHeaders,
    payload: RawPayload,
    registry: &State<Registry>,
    sender: &State<DeploySender>,
) -> Result<Json<Value>, WebhookError> {
    let identifier = registry.resolve_segment(repository);
    debug!("processing {} webhook for {}", headers.kind, identifier);

    let config = registry.lookup(&identifier)?;

    if headers.event_headers > 1 {
        return Err(WebhookError::AmbiguousEvent(headers.event_headers));
    }
    if payload.truncated {
        return Err(WebhookError::PayloadTooLarge);
    }

    let event = InboundEvent {
        kind: headers.kind,
        signature: headers.signature,
        body: payload.bytes,
    };

    router::authenticate(config, &event).map_err(|e| {
        info!("rejected webhook for {}: {}", identifier, e);
        e
    })?;

    let action = match router::route(&identifier, config, &event)? {
        Route::Pong => {
            return Ok(Json(json!({
                "status": "pong",
                "message": "Webhook is working",
            })))
        }
        Route::Deploy(request) => {
            if let Err(e) = sender.0.send(request) {
                error!("deploy worker is gone, dropping request: {}", e);
                return Err(WebhookError::DispatchUnavailable);
            }
            "deploy"
        }
        Route::Skip { .. } => "skipped",
        Route::Ignore => "ignored",
    };

    Ok(Json(json!({
        "status": "success",
        "message": "Webhook processed successfully",
        "repository": identifier,
        "event": event.kind.to_string(),
        "action": action,
    })))
}

/// Event kind and signature of a webhook delivery, whichever hosting service sent it.
#[derive(Debug)]
pub struct WebhookHeaders {
    pub kind: EventKind,
    pub signature: Option<String>,
    /// Number of `X-GitHub-Event` headers, the handler rejects more than one.
    pub event_headers: usize,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WebhookHeaders {
    type Error = Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let event_headers = request.headers().get(X_GITHUB_EVENT).count();
        let kind = EventKind::from_header(first_header(request, EVENT_HEADERS));
        let signature = signature(request);

        trace!("event: {}, signature: {:?}", kind, signature);
        Outcome::Success(WebhookHeaders {
            kind,
            signature,
            event_headers,
        })
    }
}

fn first_header<'r>(request: &'r Request<'_>, names: &[&str]) -> Option<&'r str> {
    names
        .iter()
        .find_map(|name| request.headers().get_one(name))
}

fn signature(request: &Request<'_>) -> Option<String> {
    if let Some(signature) = request.headers().get_one(X_HUB_SIGNATURE_256) {
        return Some(signature.to_owned());
    }

    first_header(request, HEX_SIGNATURE_HEADERS).map(|signature| {
        if signature.is_empty() || signature.starts_with(SIGNATURE_PREFIX) {
            signature.to_owned()
        } else {
            format!("{}{}", SIGNATURE_PREFIX, signature)
        }
    })
}
