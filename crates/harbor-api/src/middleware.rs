use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::CookieJar;

use crate::auth::AppState;
use crate::error::ApiError;

pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";

/// Verifies the access cookie and attaches the caller's `Identity` as a
/// request extension. Purely computational — no storage lookup.
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = jar
        .get(ACCESS_COOKIE)
        .ok_or_else(|| ApiError::auth("no access token cookie"))?;

    let identity = state.tokens.verify_access(token.value())?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
