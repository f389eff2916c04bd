use {
    axum::{
        extract::FromRequestParts,
        http::{StatusCode, header::AUTHORIZATION, request::Parts},
    },
    tracing::warn,
};

use crate::state::AppState;

// ── Types ────────────────────────────────────────────────────────────────────

/// Resolved admin auth configuration.
#[derive(Debug, Clone, Default)]
pub struct ResolvedAuth {
    pub token: Option<String>,
}

impl ResolvedAuth {
    pub fn is_open(&self) -> bool {
        self.token.is_none()
    }
}

/// Result of an authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub ok: bool,
    pub reason: Option<&'static str>,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison.
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

// ── Auth logic ───────────────────────────────────────────────────────────────

/// Resolve auth from the environment value. Blank tokens count as unset.
pub fn resolve_auth(token: Option<String>) -> ResolvedAuth {
    ResolvedAuth {
        token: token.filter(|t| !t.trim().is_empty()),
    }
}

/// Authorize an administrative request.
pub fn authorize(auth: &ResolvedAuth, provided: Option<&str>) -> AuthResult {
    let Some(expected) = auth.token.as_deref() else {
        return AuthResult {
            ok: true,
            reason: None,
        };
    };
    let Some(given) = provided else {
        return AuthResult {
            ok: false,
            reason: Some("token_missing"),
        };
    };
    if !safe_equal(given, expected) {
        return AuthResult {
            ok: false,
            reason: Some("token_mismatch"),
        };
    }
    AuthResult {
        ok: true,
        reason: None,
    }
}

/// Extractor guarding mutating endpoints.
pub struct Admin;

impl FromRequestParts<AppState> for Admin {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let result = authorize(&state.auth, bearer_token(header));
        if result.ok {
            return Ok(Admin);
        }
        warn!(
            path = %parts.uri.path(),
            reason = result.reason.unwrap_or("unknown"),
            "rejected admin request"
        );
        Err((StatusCode::UNAUTHORIZED, "unauthorized"))
    }
}
