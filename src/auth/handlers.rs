use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument};

use crate::{
    auth::{
        dto::{AuthResponse, ExternalAuthRequest, LoginRequest, MeResponse, SignupRequest},
        extractors::{ApiJson, AuthUser},
    },
    error::{AppError, Result},
    state::AppState,
    users::{
        repo_types::{Provider, User},
        services::ExternalAuthMode,
    },
    validation::{validate_assertion, validate_login, validate_signup},
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/me", get(get_me))
        .route("/auth/google", post(google))
        .route("/auth/firebase-signup", post(firebase_signup))
        .route("/auth/firebase-login", post(firebase_login))
}

fn respond(
    state: &AppState,
    status: StatusCode,
    message: &'static str,
    user: User,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let token = state.tokens.issue(user.id)?;
    Ok((
        status,
        Json(AuthResponse {
            message,
            token,
            user: user.into(),
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<SignupRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    validate_signup(&payload.email, &payload.password, &payload.confirm_password)?;

    let user = state
        .users
        .create_local(&payload.email, &payload.password)
        .await?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    respond(&state, StatusCode::CREATED, "User created successfully", user)
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    validate_login(&payload.email, &payload.password)?;

    let user = state
        .users
        .authenticate_local(&payload.email, &payload.password)
        .await?;

    info!(user_id = %user.id, email = %user.email, "user logged in");
    respond(&state, StatusCode::OK, "Login successful", user)
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<MeResponse>> {
    let user = state
        .users
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    Ok(Json(MeResponse { user: user.into() }))
}

async fn external_sign_in(
    state: &AppState,
    payload: ExternalAuthRequest,
    provider: Provider,
    mode: ExternalAuthMode,
) -> Result<(User, bool)> {
    validate_assertion(&payload.assertion)?;
    let identity = state.identity.verify(payload.assertion.trim()).await?;
    let (user, created) = state
        .users
        .resolve_external(&identity, payload.profile_hints.into(), provider, mode)
        .await?;
    info!(
        user_id = %user.id,
        provider = provider.as_str(),
        sign_in_provider = ?identity.sign_in_provider,
        created,
        "external sign-in"
    );
    Ok((user, created))
}

fn created_or_ok(created: bool) -> StatusCode {
    if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

#[instrument(skip(state, payload))]
pub async fn google(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<ExternalAuthRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let (user, created) = external_sign_in(
        &state,
        payload,
        Provider::Google,
        ExternalAuthMode::SignInOrCreate,
    )
    .await?;
    respond(
        &state,
        created_or_ok(created),
        "Google authentication successful",
        user,
    )
}

#[instrument(skip(state, payload))]
pub async fn firebase_signup(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<ExternalAuthRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let (user, created) = external_sign_in(
        &state,
        payload,
        Provider::External,
        ExternalAuthMode::SignInOrCreate,
    )
    .await?;
    let message = if created {
        "User created successfully"
    } else {
        "Existing account signed in"
    };
    respond(&state, created_or_ok(created), message, user)
}

#[instrument(skip(state, payload))]
pub async fn firebase_login(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<ExternalAuthRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let (user, _) = external_sign_in(
        &state,
        payload,
        Provider::External,
        ExternalAuthMode::SignInOnly,
    )
    .await?;
    respond(&state, StatusCode::OK, "Login successful", user)
}
