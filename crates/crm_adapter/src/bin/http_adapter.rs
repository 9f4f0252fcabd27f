#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use crm_adapter::{
    user_context_from_headers, AdapterError, AdapterHealthResponse, AdapterRuntime,
    VerificationItemUpdateRequest, VerificationStatusUpdateRequest, HEADER_CALL_CENTER_ID,
    HEADER_ROLE, HEADER_USER_ID,
};
use crm_kernel_contracts::lead::{LeadInput, LeadPatch};
use crm_os::lead_access::UserContext;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Reply = (StatusCode, Json<Value>);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let bind = env::var("CRM_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;

    let runtime = Arc::new(AdapterRuntime::default_from_env()?);
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/permissions", get(permissions))
        .route("/v1/leads", get(list_leads).post(create_lead))
        .route(
            "/v1/leads/:lead_id",
            axum::routing::patch(update_lead).delete(delete_lead),
        )
        .route("/v1/verification/:session_id", get(verification_snapshot))
        .route(
            "/v1/verification/:session_id/items/:item_id",
            post(update_verification_item),
        )
        .route(
            "/v1/verification/:session_id/status",
            post(update_verification_status),
        )
        .with_state(runtime);

    info!(%addr, "crm_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CRM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn caller(headers: &HeaderMap) -> Result<UserContext, AdapterError> {
    user_context_from_headers(
        header(headers, HEADER_USER_ID),
        header(headers, HEADER_ROLE),
        header(headers, HEADER_CALL_CENTER_ID),
    )
}

fn status_for(err: &AdapterError) -> StatusCode {
    match err {
        AdapterError::BadRequest(_) => StatusCode::BAD_REQUEST,
        AdapterError::Denied(_) => StatusCode::FORBIDDEN,
        AdapterError::NotFound(_) => StatusCode::NOT_FOUND,
        AdapterError::Conflict(_) => StatusCode::CONFLICT,
        AdapterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T: serde::Serialize>(result: Result<T, AdapterError>) -> Reply {
    let encoded = result.and_then(|body| {
        serde_json::to_value(body).map_err(|err| AdapterError::Internal(err.to_string()))
    });
    match encoded {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(err) => {
            let status = status_for(&err);
            if status.is_server_error() {
                warn!(error = %err, "request failed");
            }
            let body = serde_json::to_value(err.to_response()).unwrap_or(Value::Null);
            (status, Json(body))
        }
    }
}

async fn healthz(
    State(runtime): State<Arc<AdapterRuntime>>,
) -> (StatusCode, Json<AdapterHealthResponse>) {
    (StatusCode::OK, Json(runtime.health_report()))
}

async fn permissions(State(runtime): State<Arc<AdapterRuntime>>, headers: HeaderMap) -> Reply {
    reply(caller(&headers).map(|ctx| runtime.permissions_report(&ctx)))
}

async fn list_leads(State(runtime): State<Arc<AdapterRuntime>>, headers: HeaderMap) -> Reply {
    let result = match caller(&headers) {
        Ok(ctx) => runtime.list_leads(&ctx).await,
        Err(err) => Err(err),
    };
    reply(result)
}

async fn create_lead(
    State(runtime): State<Arc<AdapterRuntime>>,
    headers: HeaderMap,
    Json(input): Json<LeadInput>,
) -> Reply {
    let result = match caller(&headers) {
        Ok(ctx) => runtime.create_lead(&ctx, input).await,
        Err(err) => Err(err),
    };
    reply(result)
}

async fn update_lead(
    State(runtime): State<Arc<AdapterRuntime>>,
    Path(lead_id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<LeadPatch>,
) -> Reply {
    let result = match caller(&headers) {
        Ok(ctx) => runtime.update_lead(&ctx, &lead_id, patch).await,
        Err(err) => Err(err),
    };
    reply(result)
}

async fn delete_lead(
    State(runtime): State<Arc<AdapterRuntime>>,
    Path(lead_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    let result = match caller(&headers) {
        Ok(ctx) => runtime.delete_lead(&ctx, &lead_id).await,
        Err(err) => Err(err),
    };
    reply(result)
}

async fn verification_snapshot(
    State(runtime): State<Arc<AdapterRuntime>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    let result = match caller(&headers) {
        Ok(ctx) => runtime.verification_snapshot(&ctx, &session_id).await,
        Err(err) => Err(err),
    };
    reply(result)
}

async fn update_verification_item(
    State(runtime): State<Arc<AdapterRuntime>>,
    Path((session_id, item_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<VerificationItemUpdateRequest>,
) -> Reply {
    let result = match caller(&headers) {
        Ok(ctx) => {
            runtime
                .update_verification_item(&ctx, &session_id, &item_id, request)
                .await
        }
        Err(err) => Err(err),
    };
    reply(result)
}

async fn update_verification_status(
    State(runtime): State<Arc<AdapterRuntime>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<VerificationStatusUpdateRequest>,
) -> Reply {
    let result = match caller(&headers) {
        Ok(ctx) => {
            runtime
                .update_verification_status(&ctx, &session_id, request)
                .await
        }
        Err(err) => Err(err),
    };
    reply(result)
}
