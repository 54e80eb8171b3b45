use axum::http::HeaderMap;

use crate::engine::{Role, Session};

/// Header carrying the acting user's identity. Token issuance and validation
/// live outside this service; the deployment-wide bearer token plus these
/// headers are what the proxy in front of us forwards.
pub const USER_HEADER: &str = "x-user-id";
pub const ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    BadToken,
    MissingUser,
    BadRole,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "missing bearer token"),
            AuthError::BadToken => write!(f, "invalid bearer token"),
            AuthError::MissingUser => write!(f, "missing {USER_HEADER} header"),
            AuthError::BadRole => write!(f, "unrecognized {ROLE_HEADER} header"),
        }
    }
}

/// Build the explicit session passed into the engine. Never read from
/// ambient state — every handler receives its caller this way.
pub fn session_from_headers(headers: &HeaderMap, expected_token: &str) -> Result<Session, AuthError> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?;
    let token = auth.strip_prefix("Bearer ").ok_or(AuthError::MissingToken)?;
    if token != expected_token {
        metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
        return Err(AuthError::BadToken);
    }

    let user = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or(AuthError::MissingUser)?;

    let role = match headers.get(ROLE_HEADER) {
        None => Role::Resident,
        Some(v) => v
            .to_str()
            .ok()
            .and_then(Role::parse)
            .ok_or(AuthError::BadRole)?,
    };

    Ok(Session {
        user: user.to_string(),
        role,
    })
}
