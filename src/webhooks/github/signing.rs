use hmac::{Hmac, Mac};
use rocket::{
    data::{ByteUnit, FromData, Outcome},
    http::Status,
    Data, Request,
};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::trace;

type HmacSha256 = Hmac<Sha256>;

// GitHub puts a prefix in front of its hex SHA256
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Computes `sha256=<hex HMAC-SHA256 of payload>`.
pub fn expected_signature(secret: &[u8], payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload);

    Some(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Checks a presented signature against the payload in constant time.
///
/// Missing or empty signatures never validate, and a length mismatch is rejected before any
/// byte is compared.
pub fn validate_signature(secret: &[u8], signature: Option<&str>, payload: &[u8]) -> bool {
    trace!("validating signature...");

    let signature = match signature {
        Some(s) if !s.is_empty() => s,
        _ => {
            trace!("no signature provided");
            return false;
        }
    };

    let expected = match expected_signature(secret, payload) {
        Some(expected) => expected,
        None => {
            trace!("couldn't compute HMAC for payload");
            return false;
        }
    };

    if expected.len() != signature.len() {
        trace!(
            "signature length mismatch: expected {}, got {}",
            expected.len(),
            signature.len()
        );
        return false;
    }

    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// The request body exactly as it was received, which is what the sender signed.
///
/// A body over the size limit isn't rejected here: the handler answers 413 only once it knows
/// the repository exists.
pub struct RawPayload {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

const LIMIT: ByteUnit = ByteUnit::Mebibyte(1);

#[rocket::async_trait]
impl<'r> FromData<'r> for RawPayload {
    type Error = anyhow::Error;

    async fn from_data(request: &'r Request<'_>, data: Data<'r>) -> Outcome<'r, Self> {
        trace!("received payload on webhook endpoint: {:?}", request.uri());

        let size_limit = request.limits().get("json").unwrap_or(LIMIT);
        match data.open(size_limit).into_bytes().await {
            Ok(bytes) => {
                let truncated = !bytes.is_complete();
                if truncated {
                    trace!("payload was too big");
                }
                Outcome::Success(RawPayload {
                    bytes: bytes.into_inner(),
                    truncated,
                })
            }
            Err(e) => Outcome::Error((Status::BadRequest, e.into())),
        }
    }
}
