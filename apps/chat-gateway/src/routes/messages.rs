//! Post-persistence dispatch for messages written outside the gateway.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use messenger_common::MessageId;

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::gateway::dispatcher::DispatchReport;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/messages/{message_id}/dispatch", post(dispatch_message))
}

// ---------------------------------------------------------------------------
// POST /api/v1/messages/{message_id}/dispatch
// ---------------------------------------------------------------------------

async fn dispatch_message(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
) -> Result<Json<DispatchReport>, ApiError> {
    let stored = state.store.message_by_id(message_id).await?;

    // Only the author may announce their own message.
    if stored.user_id != user_id {
        return Err(ApiError::forbidden("You can only dispatch your own messages"));
    }

    let report = state.handler.dispatch_stored(stored).await?;

    tracing::info!(
        message_id,
        user_id,
        delivered = report.delivered,
        "dispatched stored message"
    );

    Ok(Json(report))
}
