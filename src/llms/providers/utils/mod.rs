//! Helpers shared by the HTTP providers: status classification, transport
//! error mapping and the common send/decode step.

use std::time::Duration;

use serde_json::Value;

use crate::errors::BackendError;

/// Longest body excerpt carried in an error message.
const BODY_EXCERPT: usize = 500;

/// Truncate a response body for logs and error messages.
pub fn excerpt(body: &str) -> &str {
    if body.len() <= BODY_EXCERPT {
        return body;
    }
    let mut end = BODY_EXCERPT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Parse a `Retry-After` header given in seconds. HTTP-date values are
/// ignored and the caller falls back to its own backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Map a non-success HTTP status to a backend error.
///
/// 401/403 are auth failures, 429 is a rate limit, 5xx (including
/// Anthropic's 529 overload) are server errors, and any other status is an
/// invalid response.
pub fn classify_status(
    provider: &str,
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> BackendError {
    let provider = provider.to_string();
    let message = api_error_message(body).unwrap_or_else(|| excerpt(body).to_string());
    match status {
        401 | 403 => BackendError::AuthFailure { provider, message },
        429 => BackendError::RateLimited {
            provider,
            retry_after,
        },
        500..=599 => BackendError::ServerError {
            provider,
            status,
            message,
        },
        _ => BackendError::InvalidResponse {
            provider,
            message: format!("HTTP {}: {}", status, message),
        },
    }
}

/// Map a transport failure. Timeouts are reported as such; anything else
/// that kept us from getting a response counts as a server-side problem.
pub fn classify_transport(provider: &str, err: &reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout {
            provider: provider.to_string(),
        }
    } else if err.is_decode() {
        BackendError::InvalidResponse {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    } else {
        BackendError::ServerError {
            provider: provider.to_string(),
            status: 0,
            message: err.to_string(),
        }
    }
}

/// `error.message` from a JSON error body, as OpenAI, Anthropic and Ollama
/// all return one form of it.
fn api_error_message(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    let error = json.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}

/// Send a prepared request and decode a successful JSON body.
pub async fn send_json(provider: &str, request: reqwest::RequestBuilder) -> Result<Value, BackendError> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_transport(provider, &e))?;

    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);

    let body = response
        .text()
        .await
        .map_err(|e| classify_transport(provider, &e))?;

    if !status.is_success() {
        log::debug!("{} returned {}: {}", provider, status, excerpt(&body));
        return Err(classify_status(provider, status.as_u16(), retry_after, &body));
    }

    serde_json::from_str(&body).map_err(|e| BackendError::InvalidResponse {
        provider: provider.to_string(),
        message: format!("malformed JSON: {} - body: {}", e, excerpt(&body)),
    })
}

/// Reject empty replies, which carry no answer to parse.
pub fn non_empty(provider: &str, text: String) -> Result<String, BackendError> {
    if text.trim().is_empty() {
        Err(BackendError::InvalidResponse {
            provider: provider.to_string(),
            message: "empty content".into(),
        })
    } else {
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BackendErrorKind;

    #[test]
    fn test_status_mapping() {
        let kind = |status| classify_status("openai", status, None, "").kind();
        assert_eq!(kind(401), BackendErrorKind::AuthFailure);
        assert_eq!(kind(403), BackendErrorKind::AuthFailure);
        assert_eq!(kind(429), BackendErrorKind::RateLimited);
        assert_eq!(kind(500), BackendErrorKind::ServerError);
        assert_eq!(kind(503), BackendErrorKind::ServerError);
        assert_eq!(kind(529), BackendErrorKind::ServerError);
        assert_eq!(kind(400), BackendErrorKind::InvalidResponse);
        assert_eq!(kind(404), BackendErrorKind::InvalidResponse);
    }

    #[test]
    fn test_rate_limit_keeps_retry_after() {
        let err = classify_status("anthropic", 429, parse_retry_after("7"), "");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(parse_retry_after(" 2 "), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("0.5"), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[test]
    fn test_error_message_extracted_from_body() {
        let body = r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        match classify_status("anthropic", 401, None, body) {
            BackendError::AuthFailure { message, .. } => assert_eq!(message, "invalid x-api-key"),
            other => panic!("unexpected {:?}", other),
        }
        match classify_status("local", 404, None, r#"{"error":"model 'llama9' not found"}"#) {
            BackendError::InvalidResponse { message, .. } => {
                assert!(message.contains("model 'llama9' not found"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let body = "é".repeat(400);
        let cut = excerpt(&body);
        assert!(cut.len() <= 500);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_empty_content_rejected() {
        assert!(non_empty("openai", "  \n".into()).is_err());
        assert_eq!(non_empty("openai", "4".into()).unwrap(), "4");
    }
}
