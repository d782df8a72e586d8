//! HTTP server exposing the query surface.
//!
//! Read-only endpoints over the local store plus a live event stream fed by
//! the capture-side notifier. Errors come back as a JSON envelope with a
//! stable code so callers can branch without parsing prose.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::notify::Notifier;
use crate::query::QueryEngine;
use crate::store::SearchFilters;

pub struct AppState {
    pub query: QueryEngine,
    pub notifier: Notifier,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/search", get(search))
        .route("/ask", post(ask))
        .route("/recent", get(recent))
        .route("/thread", get(thread))
        .route("/context", get(context))
        .route("/events", get(events))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ Handlers ============

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.query.store().message_count().await {
        Ok(messages) => Json(json!({ "status": "ok", "messages": messages })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage", &err),
    }
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    channel: Option<String>,
    author: Option<String>,
    since: Option<String>,
    limit: Option<i64>,
}

impl SearchParams {
    fn filters(&self) -> SearchFilters {
        SearchFilters {
            channel_id: self.channel.clone(),
            author_id: self.author.clone(),
            since_ts: self.since.clone(),
        }
    }
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    if params.q.trim().is_empty() {
        return error_message(StatusCode::BAD_REQUEST, "bad_request", "q must not be empty");
    }
    match state
        .query
        .search(&params.q, &params.filters(), params.limit)
        .await
    {
        Ok(hits) => Json(json!({ "hits": hits })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "query", &err),
    }
}

#[derive(Deserialize)]
struct AskBody {
    query: String,
    channel: Option<String>,
    author: Option<String>,
    since: Option<String>,
}

async fn ask(State(state): State<Arc<AppState>>, Json(body): Json<AskBody>) -> Response {
    if body.query.trim().is_empty() {
        return error_message(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "query must not be empty",
        );
    }
    let filters = SearchFilters {
        channel_id: body.channel,
        author_id: body.author,
        since_ts: body.since,
    };
    match state.query.ask(&body.query, &filters).await {
        Ok(blocks) => Json(json!({ "blocks": blocks })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "query", &err),
    }
}

#[derive(Deserialize)]
struct RecentParams {
    channel: Option<String>,
    limit: Option<i64>,
}

async fn recent(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecentParams>,
) -> Response {
    match state
        .query
        .recent(params.channel.as_deref(), params.limit)
        .await
    {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "query", &err),
    }
}

#[derive(Deserialize)]
struct ThreadParams {
    channel: String,
    ts: String,
}

async fn thread(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ThreadParams>,
) -> Response {
    match state.query.thread(&params.channel, &params.ts).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "query", &err),
    }
}

#[derive(Deserialize)]
struct ContextParams {
    channel: String,
    ts: String,
    radius: Option<i64>,
}

async fn context(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ContextParams>,
) -> Response {
    match state
        .query
        .context(&params.channel, &params.ts, params.radius)
        .await
    {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "query", &err),
    }
}

/// Live message stream. Lossy: a subscriber that falls behind skips ahead
/// rather than stalling the capture side.
async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.notifier.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = Event::default()
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().data("{}"));
                    return Some((Ok(sse), rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event stream subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============ Error envelope ============

fn error_message(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": code, "message": message } })),
    )
        .into_response()
}

fn error_response(status: StatusCode, code: &str, err: &anyhow::Error) -> Response {
    error_message(status, code, &err.to_string())
}
