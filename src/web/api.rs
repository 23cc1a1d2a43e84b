use crate::error::{CreationError, NotFoundError};
use crate::state::{CreateRequest, SharedState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{info, warn};

/// API 错误响应：`{ "error": <kind>, "detail": <message> }`
pub enum ApiError {
    Creation(CreationError),
    NotFound(NotFoundError),
}

impl From<CreationError> for ApiError {
    fn from(e: CreationError) -> Self {
        Self::Creation(e)
    }
}

impl From<NotFoundError> for ApiError {
    fn from(e: NotFoundError) -> Self {
        Self::NotFound(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, detail) = match self {
            Self::Creation(e) => {
                let status = match e {
                    CreationError::ChatBusy(_) => StatusCode::CONFLICT,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, e.kind(), e.to_string())
            }
            Self::NotFound(e) => (StatusCode::NOT_FOUND, "NotFound", e.to_string()),
        };
        let body = Json(serde_json::json!({ "error": kind, "detail": detail }));
        (status, body).into_response()
    }
}

/// 创建推流会话
///
/// 校验通过后立即返回 201，会话在后台继续连接。
pub async fn create_stream(
    State(state): State<SharedState>,
    Json(request): Json<CreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.registry.create(request).await.map_err(|e| {
        warn!("Rejected stream request: {}", e);
        e
    })?;
    Ok((StatusCode::CREATED, Json(view)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub active_only: bool,
}

/// 获取会话列表
pub async fn list_streams(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let streams = state.registry.list(query.active_only);
    Json(serde_json::json!({
        "total": streams.len(),
        "streams": streams,
    }))
}

pub async fn get_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.get(&id)?))
}

/// 停止会话：只发起停止，完成情况通过 GET 观察
pub async fn stop_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let current = state.registry.stop(&id)?;
    info!(session = %id, state = %current, "Stop requested via API");
    Ok(Json(serde_json::json!({
        "id": id,
        "state": current,
        "message": format!("Stream [{}] is stopping", id),
    })))
}
