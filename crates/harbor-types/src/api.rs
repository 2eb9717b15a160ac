use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- JWT Claims --

/// Access-token claims shared between harbor-api (REST middleware) and the
/// gateway handshake. Canonical definition lives here in harbor-types to
/// eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

/// Refresh-token claims. The refresh token is also tracked row-by-row in
/// storage; the claims alone are never sufficient to refresh. `jti` makes
/// every issued token distinct even within the same second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub jti: Uuid,
    pub exp: usize,
}

// -- Registration (OTP handshake) --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestOtpRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RequestOtpResponse {
    pub ok: bool,
    pub expires_in_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyOtpRequest {
    pub email: String,
    pub code: String,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    /// Email or username; emails are recognized by shape.
    pub identifier: String,
    pub password: String,
}

/// Returned by login and verify-otp alongside the auth cookies.
#[derive(Debug, Serialize)]
pub struct AuthUserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub authenticated: bool,
    pub id: Option<Uuid>,
    pub username: Option<String>,
    pub email: Option<String>,
}
