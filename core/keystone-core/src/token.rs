//! Access-token expiry evaluation.
//!
//! Tokens are opaque signed strings; the client never verifies signatures. It
//! only reads the payload segment to learn when the backend will stop accepting
//! the token, so that refreshes can be scheduled before that happens.
//!
//! Every function here fails closed: a token that cannot be decoded is treated
//! as already expired, never as valid, and never panics.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token must have three segments, found {0}")]
    SegmentCount(usize),

    #[error("token payload is not base64url: {0}")]
    Encoding(String),

    #[error("token payload is not JSON: {0}")]
    Payload(String),

    #[error("token payload has no numeric exp claim")]
    MissingExpiry,

    #[error("token exp claim out of range: {0}")]
    ExpiryOutOfRange(i64),
}

/// The claims the client cares about. Unknown claims are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub exp: i64,
    pub sub: Option<String>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub role_id: Option<String>,
}

#[derive(Deserialize)]
struct RawClaims {
    exp: Option<Value>,
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    tenant_id: Option<Value>,
    #[serde(default)]
    role_id: Option<Value>,
}

/// Outcome of checking a token against the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValidity {
    Valid { expires_at: DateTime<Utc> },
    Expired { expired_at: DateTime<Utc> },
    Invalid,
}

impl TokenValidity {
    pub fn is_valid(&self) -> bool {
        matches!(self, TokenValidity::Valid { .. })
    }
}

pub fn decode_claims(token: &str) -> Result<TokenClaims, TokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(TokenError::SegmentCount(segments.len()));
    }

    let payload = segments[1].trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|err| TokenError::Encoding(err.to_string()))?;
    let raw: RawClaims =
        serde_json::from_slice(&bytes).map_err(|err| TokenError::Payload(err.to_string()))?;

    let exp = raw
        .exp
        .as_ref()
        .and_then(numeric_seconds)
        .ok_or(TokenError::MissingExpiry)?;

    Ok(TokenClaims {
        exp,
        sub: raw.sub.as_ref().and_then(claim_string),
        user_id: raw.user_id.as_ref().and_then(claim_string),
        tenant_id: raw.tenant_id.as_ref().and_then(claim_string),
        role_id: raw.role_id.as_ref().and_then(claim_string),
    })
}

/// Expiry instant of `token` (`exp` seconds scaled to milliseconds).
pub fn expires_at(token: &str) -> Result<DateTime<Utc>, TokenError> {
    let claims = decode_claims(token)?;
    let millis = claims
        .exp
        .checked_mul(1000)
        .ok_or(TokenError::ExpiryOutOfRange(claims.exp))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(TokenError::ExpiryOutOfRange(claims.exp))
}

pub fn evaluate(token: &str, now: DateTime<Utc>) -> TokenValidity {
    match expires_at(token) {
        Ok(expires_at) if expires_at > now => TokenValidity::Valid { expires_at },
        Ok(expired_at) => TokenValidity::Expired { expired_at },
        Err(err) => {
            tracing::debug!(error = %err, "Access token failed to decode");
            TokenValidity::Invalid
        }
    }
}

/// True when the token expires within `lead` of `now`, or cannot be decoded.
pub fn needs_proactive_refresh(token: &str, now: DateTime<Utc>, lead: Duration) -> bool {
    match expires_at(token) {
        Ok(expires_at) => expires_at.signed_duration_since(now) <= lead,
        Err(_) => true,
    }
}

fn numeric_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|secs| secs.floor() as i64)),
        _ => None,
    }
}

fn claim_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds an unsigned token whose payload is `claims`.
    pub fn token_with_claims(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.signature")
    }

    pub fn token_expiring_at(expires_at: DateTime<Utc>) -> String {
        token_with_claims(&serde_json::json!({
            "exp": expires_at.timestamp(),
            "sub": "user-1",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn decodes_expiry_in_milliseconds() {
        let token = token_with_claims(&json!({ "exp": 1_800_000_000 }));
        let expiry = expires_at(&token).expect("decodes");
        assert_eq!(expiry.timestamp_millis(), 1_800_000_000_000);
    }

    #[test]
    fn reads_tenant_and_role_claims() {
        let token = token_with_claims(&json!({
            "exp": 1_800_000_000,
            "user_id": 7,
            "tenant_id": "acme",
            "role_id": 2
        }));
        let claims = decode_claims(&token).expect("decodes");
        assert_eq!(claims.user_id.as_deref(), Some("7"));
        assert_eq!(claims.tenant_id.as_deref(), Some("acme"));
        assert_eq!(claims.role_id.as_deref(), Some("2"));
    }

    #[test]
    fn tolerates_padded_payload() {
        let token = token_with_claims(&json!({ "exp": 1_800_000_000 }));
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        parts[1].push_str("==");
        assert!(decode_claims(&parts.join(".")).is_ok());
    }

    #[test]
    fn malformed_tokens_are_invalid_not_panics() {
        let now = at(1_700_000_000);
        let not_json = format!("a.{}.c", URL_SAFE_NO_PAD.encode("not json"));
        let no_exp = token_with_claims(&json!({ "sub": "u" }));
        let string_exp = token_with_claims(&json!({ "exp": "soon" }));
        let cases = [
            "",
            "garbage",
            "only.two",
            "a.b.c.d",
            "a.%%%.c",
            not_json.as_str(),
            no_exp.as_str(),
            string_exp.as_str(),
        ];

        for token in cases {
            assert_eq!(evaluate(token, now), TokenValidity::Invalid, "{token:?}");
            assert!(needs_proactive_refresh(token, now, Duration::minutes(5)));
        }
    }

    #[test]
    fn huge_expiry_is_rejected() {
        let token = token_with_claims(&json!({ "exp": i64::MAX }));
        assert_eq!(expires_at(&token), Err(TokenError::ExpiryOutOfRange(i64::MAX)));
    }

    #[test]
    fn evaluate_distinguishes_expired_from_valid() {
        let now = at(1_700_000_000);
        let past = token_expiring_at(now - Duration::seconds(1));
        let future = token_expiring_at(now + Duration::hours(1));

        assert!(matches!(evaluate(&past, now), TokenValidity::Expired { .. }));
        assert!(evaluate(&future, now).is_valid());
    }

    #[test]
    fn proactive_refresh_threshold_is_inclusive() {
        let now = at(1_700_000_000);
        let lead = Duration::minutes(5);

        let outside = token_expiring_at(now + Duration::minutes(5) + Duration::seconds(1));
        let boundary = token_expiring_at(now + Duration::minutes(5));
        let inside = token_expiring_at(now + Duration::minutes(1));

        assert!(!needs_proactive_refresh(&outside, now, lead));
        assert!(needs_proactive_refresh(&boundary, now, lead));
        assert!(needs_proactive_refresh(&inside, now, lead));
    }
}
