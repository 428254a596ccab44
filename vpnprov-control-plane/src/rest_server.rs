use std::{fs, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vpnprov_core::VpnConfig;

use crate::error::ProvisionError;
use crate::orchestrator::{DeleteOutcome, Provisioner, RotationOutcome};

#[derive(Debug, Clone)]
pub struct RestServerConfig {
    pub listen_addr: SocketAddr,
    pub jwt_public_key_path: String,
}

#[derive(Clone)]
pub struct AppState {
    jwt_public_key: Arc<DecodingKey>,
    provisioner: Arc<Provisioner>,
}

impl AppState {
    pub fn new(jwt_public_key: DecodingKey, provisioner: Arc<Provisioner>) -> Self {
        Self {
            jwt_public_key: Arc::new(jwt_public_key),
            provisioner,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: i64,
}

/// The authenticated caller, taken from the bearer token's `sub` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub Uuid);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

        let header = decode_header(token).map_err(|e| {
            debug!("Failed to decode JWT header: {}", e);
            ApiError::Unauthorized("Invalid token format".to_string())
        })?;

        let alg = match header.alg {
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => header.alg,
            other => {
                warn!("Unsupported JWT algorithm: {:?}", other);
                return Err(ApiError::Unauthorized(
                    "Unsupported token algorithm".to_string(),
                ));
            }
        };

        let mut validation = Validation::new(alg);
        validation.validate_exp = true;

        let token_data =
            decode::<Claims>(token, &state.jwt_public_key, &validation).map_err(|e| {
                debug!("Failed to decode JWT: {}", e);
                ApiError::Unauthorized("Invalid or expired token".to_string())
            })?;

        let user_id = token_data.claims.sub.parse::<Uuid>().map_err(|_| {
            ApiError::Unauthorized("Token subject is not a user id".to_string())
        })?;
        Ok(AuthUser(user_id))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    retryable: bool,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Provision(ProvisionError),
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        ApiError::Provision(err)
    }
}

/// HTTP status for a provisioning failure.
pub fn status_for(err: &ProvisionError) -> StatusCode {
    match err {
        ProvisionError::NotFound(_) => StatusCode::NOT_FOUND,
        ProvisionError::Validation(_) | ProvisionError::UnsupportedSubnet(_) => {
            StatusCode::BAD_REQUEST
        }
        ProvisionError::Conflict(_) => StatusCode::CONFLICT,
        ProvisionError::PoolExhausted(_) | ProvisionError::AgentUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ProvisionError::Agent(_) => StatusCode::BAD_GATEWAY,
        ProvisionError::KeyGeneration(_) | ProvisionError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "unauthorized",
                    message,
                    retryable: false,
                },
            ),
            ApiError::Provision(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    error!(error = %err, "Request failed");
                }
                // Infrastructure details stay in the logs.
                let message = match &err {
                    ProvisionError::KeyGeneration(_) | ProvisionError::Store(_) => {
                        "Internal error".to_string()
                    }
                    other => other.to_string(),
                };
                (
                    status,
                    ErrorBody {
                        error: err.kind(),
                        message,
                        retryable: err.is_retryable(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    server_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/subscriptions/{id}/configs",
            post(generate_handler).get(list_handler),
        )
        .route("/api/subscriptions/{id}/configs/rotate", post(rotate_handler))
        .route(
            "/api/subscriptions/{id}/configs/{config_id}",
            delete(delete_handler),
        )
        .route("/api/configs/{id}", get(get_config_handler))
        .route("/api/configs/{id}/download", get(download_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct RestServer {
    config: RestServerConfig,
    provisioner: Arc<Provisioner>,
}

impl RestServer {
    pub fn new(config: RestServerConfig, provisioner: Arc<Provisioner>) -> Self {
        Self {
            config,
            provisioner,
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let jwt_public_key_pem = fs::read_to_string(&self.config.jwt_public_key_path)
            .map_err(|e| format!("Failed to read JWT public key: {}", e))?;

        let jwt_public_key = DecodingKey::from_rsa_pem(jwt_public_key_pem.as_bytes())
            .map_err(|e| format!("Failed to parse JWT public key: {}", e))?;

        let app = router(AppState::new(jwt_public_key, self.provisioner));

        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        info!("REST server listening on {}", self.config.listen_addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::VERSION,
    })
}

async fn generate_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(subscription_id): Path<Uuid>,
    Json(payload): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<VpnConfig>), ApiError> {
    let config = state
        .provisioner
        .generate(subscription_id, payload.server_id, user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(config)))
}

async fn list_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Vec<VpnConfig>>, ApiError> {
    let configs = state
        .provisioner
        .get_subscription_configs(subscription_id, user_id)
        .await?;
    Ok(Json(configs))
}

async fn rotate_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<RotationOutcome>, ApiError> {
    let outcome = state.provisioner.rotate(subscription_id, user_id).await?;
    Ok(Json(outcome))
}

async fn delete_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path((subscription_id, config_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<DeleteOutcome>, ApiError> {
    let outcome = state
        .provisioner
        .delete(subscription_id, config_id, user_id)
        .await?;
    Ok(Json(outcome))
}

async fn get_config_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(config_id): Path<Uuid>,
) -> Result<Json<VpnConfig>, ApiError> {
    Ok(Json(state.provisioner.get_config(config_id, user_id).await?))
}

async fn download_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(config_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let config = state.provisioner.get_config(config_id, user_id).await?;
    let disposition = format!("attachment; filename=\"wg-{}.conf\"", config.address);
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        config.config_text,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::AgentError;

    #[test]
    fn provisioning_errors_map_to_statuses() {
        let cases = [
            (ProvisionError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ProvisionError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ProvisionError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                ProvisionError::PoolExhausted("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ProvisionError::AgentUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ProvisionError::Agent(AgentError::Rejected("x".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ProvisionError::UnsupportedSubnet("x".into()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{err}");
        }
    }

    #[tokio::test]
    async fn error_body_carries_kind_and_retry_hint() {
        let response =
            ApiError::from(ProvisionError::AgentUnavailable("agent down".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "agent_unavailable");
        assert_eq!(body["retryable"], true);
        assert!(body["message"].as_str().unwrap().contains("agent down"));
    }

    #[test]
    fn generate_request_server_is_optional() {
        let req: GenerateRequest = serde_json::from_str("{}").unwrap();
        assert!(req.server_id.is_none());
    }
}
