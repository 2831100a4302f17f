//! Error types shared by the HTTP-facing modules.
//!
//! Every remote call ends in an [`ApiError`] that carries the classified
//! [`ErrorKind`] so callers can react to an auth failure differently from a
//! transport failure without re-reading status codes.

use std::fmt;

/// Coarse classification of a failed HTTP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 401 from the server.
    Unauthorized,
    /// 403 from the server.
    Forbidden,
    /// 404 from the server.
    NotFound,
    /// The request never produced a response (DNS, connect, body read...).
    Transport,
    /// Any other non-2xx status, or a response we could not decode.
    Unknown,
}

impl ErrorKind {
    /// Map an HTTP status code onto a kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            _ => ErrorKind::Unknown,
        }
    }

    /// True for the two statuses that mean the credential needs attention.
    pub fn is_auth(self) -> bool {
        matches!(self, ErrorKind::Unauthorized | ErrorKind::Forbidden)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not found",
            ErrorKind::Transport => "transport error",
            ErrorKind::Unknown => "unexpected response",
        };
        f.write_str(s)
    }
}

/// A failed remote call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{operation} failed ({kind}{}): {detail}", status_suffix(.status))]
pub struct ApiError {
    /// Name of the operation that failed, e.g. `put_chunk`.
    pub operation: String,
    pub kind: ErrorKind,
    pub status: Option<u16>,
    /// Server-provided description when there is one, otherwise the raw body
    /// or the transport error text.
    pub detail: String,
}

impl ApiError {
    pub fn new(operation: &str, kind: ErrorKind, status: Option<u16>, detail: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            kind,
            status,
            detail: detail.into(),
        }
    }

    /// Build an error from a non-2xx status and its response body.
    pub fn from_response(operation: &str, status: u16, body: &str) -> Self {
        Self::new(
            operation,
            ErrorKind::from_status(status),
            Some(status),
            describe_body(body),
        )
    }

    pub fn transport(operation: &str, err: impl fmt::Display) -> Self {
        Self::new(operation, ErrorKind::Transport, None, err.to_string())
    }

    pub fn decode(operation: &str, err: impl fmt::Display) -> Self {
        Self::new(
            operation,
            ErrorKind::Unknown,
            None,
            format!("could not decode response: {err}"),
        )
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(", HTTP {s}")).unwrap_or_default()
}

/// Pull the human-readable part out of an error body.
///
/// OAuth endpoints answer with `error_description`, the platform API with
/// `message` (sometimes nested under `status`). Anything else is returned
/// trimmed as-is.
pub fn describe_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let candidates = [
            value.get("error_description"),
            value.get("message"),
            value.get("status").and_then(|s| s.get("message")),
            value.get("error"),
        ];
        for c in candidates.into_iter().flatten() {
            if let Some(s) = c.as_str() {
                return s.to_string();
            }
        }
    }
    body.trim().to_string()
}
