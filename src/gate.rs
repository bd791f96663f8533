//! Cookie-based access control.
//!
//! The gate only ever holds the SHA-256 digest of the configured password.
//! A successful login hands that digest back as the session cookie, so
//! checking a request is a plain comparison against the stored value.

use std::fmt;

use axum::extract::{Request, State};
use axum::http::header::{COOKIE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::server::AppState;

pub const COOKIE_NAME: &str = "tailhub_session";

/// How long an issued session cookie stays valid in the browser.
pub const SESSION_TTL_SECS: i64 = 24 * 60 * 60;

const MAX_COOKIE_SIZE: usize = 4 * 1024;

/// Where a request is headed, which decides how a rejection looks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Entry {
    Page,
    Stream,
}

/// Why the gate turned a request away.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rejection {
    RedirectToLogin,
    Unauthorized,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::RedirectToLogin => redirect("/login"),
            Rejection::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
        }
    }
}

pub(crate) fn redirect(to: &'static str) -> Response {
    (StatusCode::FOUND, [(LOCATION, HeaderValue::from_static(to))]).into_response()
}

pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone, Default)]
pub struct SessionGate {
    secret_hash: Option<String>,
}

impl fmt::Debug for SessionGate {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("SessionGate")
            .field("open", &self.is_open())
            .finish()
    }
}

impl SessionGate {
    /// Builds a gate from the configured password. `None` or an empty
    /// password leaves the gate open.
    pub fn new(password: Option<&str>) -> Self {
        let secret_hash = password.filter(|p| !p.is_empty()).map(hash_password);
        SessionGate { secret_hash }
    }

    pub fn is_open(&self) -> bool {
        self.secret_hash.is_none()
    }

    pub fn check(&self, headers: &HeaderMap, entry: Entry) -> Result<(), Rejection> {
        let Some(secret) = self.secret_hash.as_deref() else {
            return Ok(());
        };

        match session_cookie(headers) {
            Some(value) if value == secret => Ok(()),
            _ => Err(match entry {
                Entry::Page => Rejection::RedirectToLogin,
                Entry::Stream => Rejection::Unauthorized,
            }),
        }
    }

    /// Checks a submitted password. On success returns the `Set-Cookie`
    /// value to issue.
    pub fn login(&self, password: &str) -> Option<HeaderValue> {
        let secret = self.secret_hash.as_deref()?;
        let presented = hash_password(password);
        if presented != secret {
            return None;
        }

        let expires = Utc::now() + ChronoDuration::seconds(SESSION_TTL_SECS);
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}; Expires={}",
            COOKIE_NAME,
            presented,
            SESSION_TTL_SECS,
            expires.format("%a, %d %b %Y %H:%M:%S GMT"),
        );
        HeaderValue::from_str(&cookie).ok()
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    let prefix = format!("{}=", COOKIE_NAME);

    headers
        .get_all(COOKIE)
        .iter()
        .filter(|header| header.len() <= MAX_COOKIE_SIZE)
        .filter_map(|header| header.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .map(str::trim)
        .find_map(|cookie| cookie.strip_prefix(prefix.as_str()))
        .map(|value| value.trim_matches('"'))
        .filter(|value| !value.is_empty())
}

async fn guard(state: &AppState, request: Request, next: Next, entry: Entry) -> Response {
    match state.gate.check(request.headers(), entry) {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            debug!(path = %request.uri().path(), ?rejection, "request rejected by session gate");
            rejection.into_response()
        }
    }
}

/// Middleware for page routes: unauthenticated requests go to the login form.
pub async fn require_page_session(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    guard(&state, request, next, Entry::Page).await
}

/// Middleware for the stream endpoint: unauthenticated requests get a 401.
pub async fn require_stream_session(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    guard(&state, request, next, Entry::Stream).await
}

/// Appends a session cookie to a response.
pub(crate) fn with_cookie(mut response: Response, cookie: HeaderValue) -> Response {
    response.headers_mut().append(SET_COOKIE, cookie);
    response
}
