use crate::prelude::*;

use rentbox_core::prelude::*;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(err) = self.0.downcast_ref::<EngineError>() {
            return match err {
                EngineError::Unavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
                }
                _ => {
                    error!("Internal Server EngineError: {:?}", self.0);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Engine Error".to_string(),
                    )
                }
            }
            .into_response();
        }

        if let Some(err) = self.0.downcast_ref::<JobError>() {
            return match err {
                JobError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, err.to_string()),
                _ => {
                    error!("Internal Server JobError: {:?}", self.0);
                    (StatusCode::INTERNAL_SERVER_ERROR, "Job Error".to_string())
                }
            }
            .into_response();
        }

        error!("Internal Server Error: {:?}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        )
            .into_response()
    }
}

/// GET /health
pub async fn health<E: ContainerEngine, G: GpuProbe>(
    State(state): State<AppState<E, G>>,
) -> Result<impl IntoResponse, ApiError> {
    state.coordinator.ping().await?;
    Ok("OK")
}

/// POST /jobs/execute
///
/// Every job outcome is a `200`; only malformed requests are rejected.
pub async fn execute<E: ContainerEngine, G: GpuProbe>(
    State(state): State<AppState<E, G>>,
    Json(request): Json<JobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.source_code.len() > MAX_SOURCE_BYTES {
        return Err(ApiError::from(JobError::InvalidRequest(format!(
            "source code exceeds {MAX_SOURCE_BYTES} bytes"
        ))));
    }

    let result = state.coordinator.execute(request).await;
    Ok(Json(result))
}

/// GET /jobs/active
pub async fn active_jobs<E: ContainerEngine, G: GpuProbe>(
    State(state): State<AppState<E, G>>,
) -> impl IntoResponse {
    Json(state.coordinator.active_jobs())
}

const MAX_SOURCE_BYTES: usize = 512 * 1024;
