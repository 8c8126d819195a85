//! HTTP/JSON gateway.
//!
//! Every route is translated into a call on the loopback gRPC channel, so
//! the gateway and gRPC clients always see the same answers.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use tonic::transport::{Channel, Endpoint};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info};

use vmfleet_proto::{
    ImagesClient, ImagesResponse, InstancesClient, InstancesResponse, ListRequest, VolumesClient,
    VolumesResponse,
};

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

/// Translate a gRPC failure into an HTTP status and error body.
fn from_status(status: tonic::Status) -> (StatusCode, Json<ApiError>) {
    let (http, error) = match status.code() {
        tonic::Code::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        tonic::Code::Unimplemented => (StatusCode::NOT_IMPLEMENTED, "unsupported"),
        tonic::Code::InvalidArgument => (StatusCode::BAD_REQUEST, "invalid_argument"),
        tonic::Code::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
        tonic::Code::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if http.is_server_error() {
        error!(code = ?status.code(), message = %status.message(), "Gateway call failed");
    }
    (http, Json(ApiError::new(error, status.message())))
}

// ============================================================================
// Server
// ============================================================================

/// Open the loopback channel to the gRPC server at `addr`, retrying until
/// it accepts connections.
pub async fn connect(addr: SocketAddr) -> anyhow::Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{}", addr))?
        .connect_timeout(Duration::from_secs(1));

    let mut attempt = 1;
    loop {
        match endpoint.connect().await {
            Ok(channel) => {
                info!(address = %addr, "Gateway connected to gRPC server");
                return Ok(channel);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                debug!(attempt, error = %e, "gRPC server not ready yet");
                attempt += 1;
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to connect gateway to gRPC server at {}: {}",
                    addr,
                    e
                ))
            }
        }
    }
}

/// Gateway routes over `channel`.
pub fn router(channel: Channel) -> Router {
    let api_routes = Router::new()
        .route("/instances", get(list_instances))
        .route("/images", get(list_images))
        .route("/volumes", get(list_volumes));

    Router::new()
        .nest("/v1", api_routes)
        .with_state(channel)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /v1/instances
async fn list_instances(State(channel): State<Channel>) -> ApiResult<InstancesResponse> {
    InstancesClient::new(channel)
        .get_instances(ListRequest {})
        .await
        .map(|r| Json(r.into_inner()))
        .map_err(from_status)
}

/// GET /v1/images
async fn list_images(State(channel): State<Channel>) -> ApiResult<ImagesResponse> {
    ImagesClient::new(channel)
        .get_images(ListRequest {})
        .await
        .map(|r| Json(r.into_inner()))
        .map_err(from_status)
}

/// GET /v1/volumes
async fn list_volumes(State(channel): State<Channel>) -> ApiResult<VolumesResponse> {
    VolumesClient::new(channel)
        .get_volumes(ListRequest {})
        .await
        .map(|r| Json(r.into_inner()))
        .map_err(from_status)
}
