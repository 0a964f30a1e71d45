use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::{
    config::{Config, StorageBackendKind},
    context::{
        context_counts, delete_entries, get_user_context, set_entries, split_keys,
        user_context_prompt,
    },
    error::ContextError,
    extraction::ContextScanner,
    llm::{CompletionClient, OpenAiClient},
    scan_queue::ScanQueue,
    shutdown::shutdown_signal,
    store::{ContextStore, MemoryStore, PostgresStore},
    types::*,
};

type ApiError = (StatusCode, Json<Value>);

const USER_ID_HEADER: &str = "x-user-id";

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// The fronting auth proxy resolves the session and forwards the user id.
fn user_id_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        ))
}

fn internal_error(context: &str, err: ContextError) -> ApiError {
    error!(error = %err, "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Error processing request" })),
    )
}

async fn owned_chat(state: &AppState, user_id: &str, chat_id: &str) -> Result<Chat, ApiError> {
    let chat = state
        .store
        .find_chat(chat_id)
        .await
        .map_err(|err| internal_error("failed to load chat", err))?;
    chat.filter(|chat| chat.user_id == user_id).ok_or((
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "chat not found" })),
    ))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn post_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateChatBody>,
) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    let title = body
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or("New chat")
        .to_string();
    let chat = Chat {
        id: Uuid::new_v4().to_string(),
        user_id,
        agent_id: body.agent_id.filter(|id| !id.trim().is_empty()),
        title,
        created_at: Utc::now(),
    };
    if let Err(err) = state.store.create_chat(&chat).await {
        return internal_error("failed to create chat", err).into_response();
    }
    (StatusCode::CREATED, Json(json!({ "chat": chat }))).into_response()
}

async fn get_chats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    match state.store.list_chats(&user_id).await {
        Ok(chats) => Json(json!({ "chats": chats })).into_response(),
        Err(err) => internal_error("failed to list chats", err).into_response(),
    }
}

async fn get_chat_messages(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = owned_chat(&state, &user_id, &chat_id).await {
        return err.into_response();
    }
    match state.store.list_messages(&chat_id).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => internal_error("failed to list messages", err).into_response(),
    }
}

async fn post_chat_message(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    let content = body.content.trim();
    if content.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "content is required" })),
        )
            .into_response();
    }
    let Some(role) = Role::parse(body.role.as_deref().unwrap_or("user")) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "role must be user or assistant" })),
        )
            .into_response();
    };
    if let Err(err) = owned_chat(&state, &user_id, &chat_id).await {
        return err.into_response();
    }

    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        chat_id,
        role,
        content: content.to_string(),
        created_at: Utc::now(),
    };
    if let Err(err) = state.store.insert_message(&message).await {
        return internal_error("failed to store message", err).into_response();
    }
    (StatusCode::CREATED, Json(json!({ "message": message }))).into_response()
}

async fn get_context(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    match get_user_context(state.store.as_ref(), &user_id).await {
        Ok(context) => Json(json!(context)).into_response(),
        Err(err) => internal_error("failed to load user context", err).into_response(),
    }
}

/// Queues a scan of the caller's chats and answers 202 right away.
async fn post_context_scan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    let payload = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
    let force_scan = payload.get("forceScan").and_then(Value::as_bool) == Some(true);

    let Some(ticket) = state.scans.submit(&user_id, force_scan).await else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "scan queue is shutting down" })),
        )
            .into_response();
    };
    info!(user_id = %user_id, job_id = %ticket.job_id, force_scan, "context extraction queued");

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "Context extraction process started",
            "userId": user_id,
            "jobId": ticket.job_id
        })),
    )
        .into_response()
}

async fn put_context(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateContextBody>,
) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    match set_entries(
        state.store.as_ref(),
        &user_id,
        body.preferences.as_ref(),
        body.facts.as_ref(),
    )
    .await
    {
        Ok(updates) => Json(json!({
            "message": "User context updated successfully",
            "updates": updates
        }))
        .into_response(),
        Err(err) => internal_error("failed to update user context", err).into_response(),
    }
}

async fn delete_context(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DeleteContextQuery>,
) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    let preference_keys = split_keys(query.preferences.as_deref());
    let fact_keys = split_keys(query.facts.as_deref());
    match delete_entries(state.store.as_ref(), &user_id, &preference_keys, &fact_keys).await {
        Ok(deleted) => Json(json!({
            "message": "User context entries deleted successfully",
            "deleted": deleted
        }))
        .into_response(),
        Err(err) => internal_error("failed to delete user context entries", err).into_response(),
    }
}

async fn get_context_counts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    match context_counts(state.store.as_ref(), &user_id).await {
        Ok(counts) => Json(json!(counts)).into_response(),
        Err(err) => internal_error("failed to count user context entries", err).into_response(),
    }
}

async fn get_context_prompt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    match user_context_prompt(state.store.as_ref(), &user_id).await {
        Ok(prompt) => Json(json!({ "prompt": prompt })).into_response(),
        Err(err) => internal_error("failed to render user context", err).into_response(),
    }
}

async fn get_scan_job(
    Path(job_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_id = match user_id_from_headers(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return err.into_response(),
    };
    let Some(status) = state.scans.status(&job_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "scan job not found" })),
        )
            .into_response();
    };
    if status.user_id != user_id {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Unauthorized access" })),
        )
            .into_response();
    }
    Json(json!({ "job": status })).into_response()
}

async fn get_context_debug(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if state.config.is_production() {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Debug endpoint not available in production" })),
        )
            .into_response();
    }
    if let Err(err) = user_id_from_headers(&headers) {
        return err.into_response();
    }

    let preferences = state.store.list_context_docs(ContextKind::Preferences).await;
    let facts = state.store.list_context_docs(ContextKind::Facts).await;
    match (preferences, facts) {
        (Ok(preferences), Ok(facts)) => Json(json!({
            "userPreferences": preferences,
            "userFacts": facts,
            "message": "Debug view of stored user context documents"
        }))
        .into_response(),
        (Err(err), _) | (_, Err(err)) => {
            internal_error("failed to list user context documents", err).into_response()
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chats", get(get_chats).post(post_chat))
        .route(
            "/api/chats/{chat_id}/messages",
            get(get_chat_messages).post(post_chat_message),
        )
        .route(
            "/api/user/context",
            get(get_context)
                .post(post_context_scan)
                .put(put_context)
                .delete(delete_context),
        )
        .route("/api/user/context/counts", get(get_context_counts))
        .route("/api/user/context/prompt", get(get_context_prompt))
        .route("/api/user/context/scans/{job_id}", get(get_scan_job))
        .route("/api/user/context/debug", get(get_context_debug))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wires the scan queue to `store`/`llm`. Must run inside a tokio runtime.
pub fn build_state(
    config: Config,
    store: Arc<dyn ContextStore>,
    llm: Arc<dyn CompletionClient>,
) -> Arc<AppState> {
    let scanner = ContextScanner::new(store.clone(), llm, config.scan_batch_size);
    Arc::new(AppState {
        store,
        scans: ScanQueue::start(scanner),
        config,
    })
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn ContextStore>> {
    match config.storage {
        StorageBackendKind::Memory => {
            info!("using in-memory storage; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackendKind::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .connect(&config.database_url)
                .await
                .context("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)")?;
            let store = PostgresStore::new(pool);
            store.migrate().await.context("failed to run sqlx migrations")?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env();
    let port = config.port;
    let store = connect_store(&config).await?;
    let llm: Arc<dyn CompletionClient> =
        Arc::new(OpenAiClient::new(config.llm.clone()).context("failed to build llm client")?);
    let state = build_state(config, store, llm);
    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind TCP listener on {addr}"))?;

    info!("chat context server running at http://localhost:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failure")?;

    state.scans.shutdown().await;
    info!("server stopped");
    Ok(())
}
