use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRef, FromRequest, FromRequestParts, Request},
    http::{header::AUTHORIZATION, request::Parts},
    Json,
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    auth::jwt::{JwtKeys, TokenError},
    error::{AppError, FieldError},
    state::AppState,
    users::repo_types::User,
};

/// Verified session token; carries the user ID only.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);
        let token = bearer_token(parts).ok_or(TokenError::Missing)?;

        let claims = keys.verify(token).map_err(|e| {
            warn!(reason = %e, "session token rejected");
            e
        })?;

        Ok(AuthUser(claims.sub))
    }
}

/// Verified session token whose user still exists.
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(user_id) = AuthUser::from_request_parts(parts, state).await?;
        let user = state.users.find_by_id(user_id).await?.ok_or_else(|| {
            warn!(user_id = %user_id, "token for deleted user");
            AppError::UserGone
        })?;
        Ok(CurrentUser(user))
    }
}

/// JSON request body whose rejections become `AppError::Validation`.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => {
                debug!(reason = %rejection.body_text(), "request body rejected");
                Err(body_error(&rejection))
            }
        }
    }
}

fn body_error(rejection: &JsonRejection) -> AppError {
    let message = match rejection {
        JsonRejection::MissingJsonContentType(_) => "Request body must be sent as application/json",
        JsonRejection::JsonSyntaxError(_) => "Request body is not valid JSON",
        JsonRejection::JsonDataError(_) => "Request body has a missing or mistyped field",
        _ => "Request body could not be read",
    };
    AppError::Validation(vec![FieldError {
        field: "body",
        message,
    }])
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let auth = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}
