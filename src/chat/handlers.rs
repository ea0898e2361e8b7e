use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use crate::{
    auth::extractors::{ApiJson, CurrentUser},
    chat::dto::{ModelsResponse, SendMessageRequest, SendMessageResponse},
    error::Result,
    state::AppState,
    validation::validate_chat_message,
};

pub fn chat_routes() -> Router<AppState> {
    Router::new()
        .route("/chat", post(send_message))
        .route("/chat/models", get(list_models))
}

#[instrument(skip(state, user, payload), fields(user_id = %user.id))]
pub async fn send_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiJson(payload): ApiJson<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>> {
    validate_chat_message(&payload.message)?;

    let reply = state
        .chat
        .complete(&payload.conversation_history, &payload.message)
        .await?;

    Ok(Json(SendMessageResponse {
        message: "Response generated successfully",
        response: reply.content,
        usage: reply.usage,
    }))
}

#[instrument(skip(state, user), fields(user_id = %user.id))]
pub async fn list_models(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<ModelsResponse>> {
    let models = state.chat.list_models().await?;
    Ok(Json(ModelsResponse { models }))
}
