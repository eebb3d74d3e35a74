use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    routing::post,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    dispatcher::DispatchOutcome,
    error::AppError,
    gate::GateDecision,
    models::{ChangeType, HandshakeQuery, ResourceQuery},
    state::AppState,
    subscriptions::chat_messages_resource,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/subscriptions",
            get(create_subscription).delete(delete_subscription),
        )
        .route("/subscriptions/delete", get(delete_subscription))
        .route("/subscriptions/list", get(list_subscription))
        .route("/notifications", post(notifications))
        .route("/notifications/lifecycle", post(lifecycle_notifications))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Query(query): Query<ResourceQuery>,
) -> Result<(StatusCode, String), AppError> {
    let resource_id = require_resource_id(&query)?;
    info!(resource_id, "creating chat messages subscription");
    let subscription = state
        .subscriptions
        .create(&chat_messages_resource(resource_id), ChangeType::Created)
        .await?;

    Ok((
        StatusCode::OK,
        format!(
            "Created subscription {} for chat: {resource_id}",
            subscription.id
        ),
    ))
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    Query(query): Query<ResourceQuery>,
) -> Result<(StatusCode, String), AppError> {
    let resource_id = require_resource_id(&query)?;
    info!(resource_id, "deleting chat messages subscription");
    let deleted = state
        .subscriptions
        .delete(&chat_messages_resource(resource_id))
        .await?;

    if deleted {
        Ok((
            StatusCode::OK,
            format!("Deleted subscription for chat: {resource_id}"),
        ))
    } else {
        Err(AppError::new(
            StatusCode::NOT_FOUND,
            format!("No subscription found for chat: {resource_id}"),
        ))
    }
}

pub async fn list_subscription(
    State(state): State<AppState>,
    Query(query): Query<ResourceQuery>,
) -> Result<(StatusCode, String), AppError> {
    let resource_id = require_resource_id(&query)?;
    match state
        .subscriptions
        .find(&chat_messages_resource(resource_id))
        .await?
    {
        Some(subscription) => Ok((
            StatusCode::OK,
            format!(
                "Found a subscription with ID {} until {}",
                subscription.id,
                subscription.expiration_date_time.to_rfc3339()
            ),
        )),
        None => Err(AppError::new(
            StatusCode::NOT_FOUND,
            "No subscriptions found",
        )),
    }
}

pub async fn notifications(
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    let notifications = match state.gate.admit_changes(&query, &body).await? {
        GateDecision::Handshake(reply) => return Ok(handshake_response(reply)),
        GateDecision::Continue(notifications) => notifications,
    };

    let outcomes = state.dispatcher.handle(&notifications).await;
    log_batch("change", &outcomes);
    Ok(StatusCode::OK.into_response())
}

pub async fn lifecycle_notifications(
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    let notifications = match state.gate.admit_lifecycle(&query, &body)? {
        GateDecision::Handshake(reply) => return Ok(handshake_response(reply)),
        GateDecision::Continue(notifications) => notifications,
    };

    let outcomes = state.dispatcher.handle_lifecycle(&notifications).await;
    log_batch("lifecycle", &outcomes);
    Ok(StatusCode::ACCEPTED.into_response())
}

fn handshake_response(reply: String) -> Response {
    info!("answering subscription validation handshake");
    (StatusCode::OK, reply).into_response()
}

fn require_resource_id(query: &ResourceQuery) -> Result<&str, AppError> {
    match query.resource_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "Missing 'resource_id' query parameter",
        )),
    }
}

fn log_batch(channel: &str, outcomes: &[DispatchOutcome]) {
    let accepted = outcomes
        .iter()
        .filter(|outcome| {
            !matches!(
                outcome,
                DispatchOutcome::Rejected | DispatchOutcome::Dropped | DispatchOutcome::Failed
            )
        })
        .count();
    info!(
        channel,
        received = outcomes.len(),
        accepted,
        "processed notification batch"
    );
}
