use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use harbor_db::{Database, is_email_like, is_unique_violation, normalize_email, normalize_username};
use harbor_types::api::{
    AuthUserResponse, LoginRequest, MeResponse, OkResponse, RequestOtpRequest, RequestOtpResponse,
    VerifyOtpRequest,
};
use harbor_types::models::Identity;

use crate::error::ApiError;
use crate::mail::Mailer;
use crate::middleware::{ACCESS_COOKIE, REFRESH_COOKIE, require_auth};
use crate::password::{hash_password, verify_password};
use crate::tokens::{ACCESS_TTL_SECS, OTP_TTL_MS, REFRESH_TTL_MS, Tokens};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub tokens: Tokens,
    pub mailer: Arc<dyn Mailer>,
    /// Secure + SameSite=None cookies behind TLS; Lax for local dev.
    pub cookie_secure: bool,
}

pub fn routes(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/register/request-otp", post(request_otp))
        .route("/api/register/verify-otp", post(verify_otp))
        .route("/api/login", post(login))
        .route("/api/refresh", post(refresh))
        .route("/api/logout", post(logout))
        .route("/api/me", get(me))
        .with_state(state.clone());

    let protected = Router::new()
        .route("/api/logout-all", post(logout_all))
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    public.merge(protected)
}

// -- Handlers --

async fn request_otp(
    State(state): State<AppState>,
    Json(req): Json<RequestOtpRequest>,
) -> Result<Json<RequestOtpResponse>, ApiError> {
    let email = normalize_email(&req.email);
    let username = normalize_username(&req.username);

    if !is_email_like(&email) {
        return Err(ApiError::Validation("email is not valid".into()));
    }
    if username.chars().count() < 3 {
        return Err(ApiError::Validation("username must be at least 3 characters".into()));
    }
    if req.password.chars().count() < 6 {
        return Err(ApiError::Validation("password must be at least 6 characters".into()));
    }

    // opportunistic sweep; a failure here must never block registration
    let now = Utc::now().timestamp_millis();
    if let Err(e) = run_db_raw(&state.db, move |db| db.sweep_pending_registrations(now)).await? {
        warn!("pending-registration sweep failed: {:#}", e);
    }

    let lookup_email = email.clone();
    if run_db(&state.db, move |db| db.find_user_by_email(&lookup_email))
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict("email already in use".into()));
    }
    let lookup_username = username.clone();
    if run_db(&state.db, move |db| db.find_user_by_username(&lookup_username))
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict("username already in use".into()));
    }

    let pass_hash = hash_password(&req.password)?;
    let code = make_otp_code();
    let code_hash = hash_password(&code)?;

    let now = Utc::now().timestamp_millis();
    {
        let email = email.clone();
        let username = username.clone();
        run_db(&state.db, move |db| {
            db.upsert_pending_registration(&email, &code_hash, now + OTP_TTL_MS, &username, &pass_hash)
        })
        .await?;
    }

    // the pending row is kept on failure so the caller can retry delivery
    state
        .mailer
        .send_verification_code(&email, &code)
        .await
        .map_err(ApiError::Delivery)?;

    Ok(Json(RequestOtpResponse {
        ok: true,
        expires_in_sec: (OTP_TTL_MS / 1000) as u64,
    }))
}

async fn verify_otp(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<VerifyOtpRequest>,
) -> Result<(CookieJar, Json<AuthUserResponse>), ApiError> {
    let email = normalize_email(&req.email);
    let code = req.code.trim().to_string();

    if !is_email_like(&email) {
        return Err(ApiError::Validation("email is not valid".into()));
    }
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::Validation("code must be 6 digits".into()));
    }

    let lookup_email = email.clone();
    let pending = run_db(&state.db, move |db| db.get_pending_registration(&lookup_email))
        .await?
        .ok_or_else(|| ApiError::NotFound("no pending registration for this email".into()))?;

    let now = Utc::now().timestamp_millis();
    if now > pending.expires_at {
        let cleanup_email = email.clone();
        run_db(&state.db, move |db| db.delete_pending_registration(&cleanup_email)).await?;
        return Err(ApiError::Expired("verification code expired, request a new one".into()));
    }

    if !verify_password(&code, &pending.code_hash)? {
        return Err(ApiError::InvalidCode);
    }

    // two verification attempts can race; re-check before claiming
    let lookup_email = email.clone();
    if run_db(&state.db, move |db| db.find_user_by_email(&lookup_email))
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict("email already in use".into()));
    }
    let lookup_username = pending.username.clone();
    if run_db(&state.db, move |db| db.find_user_by_username(&lookup_username))
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict("username already in use".into()));
    }

    let user_id = Uuid::new_v4();
    let created = {
        let id = user_id.to_string();
        let username = pending.username.clone();
        let email = email.clone();
        let pass_hash = pending.pass_hash.clone();
        run_db_raw(&state.db, move |db| {
            db.create_user(&id, &username, &email, &pass_hash, now)
        })
        .await?
    };

    // the pending record is consumed no matter how creation went, so a
    // code can never be replayed
    {
        let cleanup_email = email.clone();
        if let Err(e) =
            run_db_raw(&state.db, move |db| db.delete_pending_registration(&cleanup_email)).await?
        {
            warn!("failed to delete consumed pending registration: {:#}", e);
        }
    }

    if let Err(e) = created {
        if is_unique_violation(&e) {
            return Err(ApiError::Conflict("email or username already in use".into()));
        }
        return Err(ApiError::Storage(e));
    }

    let identity = Identity {
        id: user_id,
        username: pending.username.clone(),
    };
    let jar = issue_session(&state, jar, &identity).await?;

    Ok((
        jar,
        Json(AuthUserResponse {
            id: user_id,
            username: pending.username,
            email,
        }),
    ))
}

async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, Json<AuthUserResponse>), ApiError> {
    let identifier = req.identifier.trim().to_string();

    let user = run_db(&state.db, move |db| db.find_user_by_identifier(&identifier))
        .await?
        .ok_or_else(|| ApiError::auth("no such user"))?;

    if !verify_password(&req.password, &user.pass_hash)? {
        return Err(ApiError::auth("wrong password"));
    }

    let identity = Identity {
        id: user
            .id
            .parse()
            .map_err(|e| ApiError::Storage(anyhow::anyhow!("corrupt user id '{}': {}", user.id, e)))?,
        username: user.username.clone(),
    };
    let jar = issue_session(&state, jar, &identity).await?;

    Ok((
        jar,
        Json(AuthUserResponse {
            id: identity.id,
            username: user.username,
            email: user.email,
        }),
    ))
}

/// Rotation-on-use: the presented token is revoked the moment it is
/// honored, so a stolen copy that is replayed later is already dead.
async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<OkResponse>), ApiError> {
    let presented = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or_else(|| ApiError::auth("no refresh token cookie"))?;

    let lookup = presented.clone();
    let record = run_db(&state.db, move |db| db.get_refresh_token(&lookup))
        .await?
        .ok_or_else(|| ApiError::auth("unknown refresh token"))?;

    if record.is_revoked() {
        return Err(ApiError::auth("refresh token revoked"));
    }

    let now = Utc::now().timestamp_millis();
    if record.is_expired(now) {
        revoke_quietly(&state.db, &presented, now).await;
        return Err(ApiError::auth("refresh token expired"));
    }

    let user_id = match state.tokens.decode_refresh(&presented) {
        Ok(id) => id,
        Err(e) => {
            revoke_quietly(&state.db, &presented, now).await;
            return Err(e);
        }
    };

    let lookup = user_id.to_string();
    let user = match run_db(&state.db, move |db| db.find_user_by_id(&lookup)).await? {
        Some(user) => user,
        None => {
            revoke_quietly(&state.db, &presented, now).await;
            return Err(ApiError::auth("refresh token user no longer exists"));
        }
    };

    let old = presented.clone();
    run_db(&state.db, move |db| db.revoke_refresh_token(&old, now)).await?;

    let identity = Identity {
        id: user_id,
        username: user.username,
    };
    let jar = issue_session(&state, jar, &identity).await?;

    // opportunistic sweep; failures logged, never surfaced
    if let Err(e) = run_db_raw(&state.db, move |db| db.sweep_refresh_tokens(now)).await? {
        warn!("refresh-token sweep failed: {:#}", e);
    }

    Ok((jar, Json(OkResponse { ok: true })))
}

/// Idempotent: logging out with an unknown or already-revoked token is fine.
async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<OkResponse>), ApiError> {
    if let Some(token) = jar.get(REFRESH_COOKIE).map(|c| c.value().to_string()) {
        let now = Utc::now().timestamp_millis();
        run_db(&state.db, move |db| db.revoke_refresh_token(&token, now)).await?;
    }

    Ok((clear_auth_cookies(jar), Json(OkResponse { ok: true })))
}

/// "Sign out everywhere."
async fn logout_all(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<OkResponse>), ApiError> {
    let now = Utc::now().timestamp_millis();
    let user_id = identity.id.to_string();
    run_db(&state.db, move |db| db.revoke_all_for_user(&user_id, now)).await?;

    Ok((clear_auth_cookies(jar), Json(OkResponse { ok: true })))
}

/// Optional-auth introspection: never fails, just reports whether the
/// presented access token (if any) is valid.
async fn me(State(state): State<AppState>, jar: CookieJar) -> Result<Json<MeResponse>, ApiError> {
    let identity = jar
        .get(ACCESS_COOKIE)
        .and_then(|c| state.tokens.verify_access(c.value()).ok());

    let Some(identity) = identity else {
        return Ok(Json(MeResponse {
            authenticated: false,
            id: None,
            username: None,
            email: None,
        }));
    };

    let lookup = identity.id.to_string();
    let email = run_db(&state.db, move |db| db.find_user_by_id(&lookup))
        .await?
        .map(|u| u.email);

    Ok(Json(MeResponse {
        authenticated: true,
        id: Some(identity.id),
        username: Some(identity.username),
        email,
    }))
}

// -- Helpers --

fn make_otp_code() -> String {
    rand::rng().random_range(100_000..=999_999).to_string()
}

async fn issue_session(
    state: &AppState,
    jar: CookieJar,
    identity: &Identity,
) -> Result<CookieJar, ApiError> {
    let access = state.tokens.sign_access(identity)?;
    let refresh = state.tokens.sign_refresh(identity.id)?;

    let now = Utc::now().timestamp_millis();
    let user_id = identity.id.to_string();
    let stored = refresh.clone();
    run_db(&state.db, move |db| {
        db.store_refresh_token(&stored, &user_id, now + REFRESH_TTL_MS, now)
    })
    .await?;

    Ok(set_auth_cookies(jar, access, refresh, state.cookie_secure))
}

async fn revoke_quietly(db: &Arc<Database>, token: &str, now: i64) {
    let token = token.to_string();
    match run_db_raw(db, move |db| db.revoke_refresh_token(&token, now)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("failed to revoke refresh token: {:#}", e),
        Err(e) => warn!("failed to revoke refresh token: {}", e),
    }
}

fn auth_cookie(
    name: &'static str,
    value: String,
    max_age: time::Duration,
    secure: bool,
) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);
    cookie.set_http_only(true);
    cookie.set_path("/");
    cookie.set_secure(secure);
    cookie.set_same_site(if secure { SameSite::None } else { SameSite::Lax });
    cookie.set_max_age(max_age);
    cookie
}

pub fn set_auth_cookies(jar: CookieJar, access: String, refresh: String, secure: bool) -> CookieJar {
    jar.add(auth_cookie(
        ACCESS_COOKIE,
        access,
        time::Duration::seconds(ACCESS_TTL_SECS),
        secure,
    ))
    .add(auth_cookie(
        REFRESH_COOKIE,
        refresh,
        time::Duration::milliseconds(REFRESH_TTL_MS),
        secure,
    ))
}

pub fn clear_auth_cookies(jar: CookieJar) -> CookieJar {
    jar.remove(removal_cookie(ACCESS_COOKIE))
        .remove(removal_cookie(REFRESH_COOKIE))
}

fn removal_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, "")).path("/").build()
}

/// Run a blocking storage call off the async runtime, mapping any failure
/// (including a lost worker) to `ApiError::Storage`.
async fn run_db<T, F>(db: &Arc<Database>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    run_db_raw(db, f).await?.map_err(ApiError::Storage)
}

/// Like `run_db`, but hands back the inner result so callers can inspect
/// the storage error (e.g. unique-constraint races).
async fn run_db_raw<T, F>(db: &Arc<Database>, f: F) -> Result<anyhow::Result<T>, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| ApiError::Storage(anyhow::anyhow!("spawn_blocking join error: {}", e)))
}
