pub mod api;
pub mod health;

use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

/// 注册 HTTP 路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health::health)) // 健康检查
        .route("/metrics", get(health::metrics)) // Prometheus 指标
        .route(
            "/api/streams",
            post(api::create_stream).get(api::list_streams), // 创建 / 列出会话
        )
        .route(
            "/api/streams/:id",
            get(api::get_stream).delete(api::stop_stream), // 查询 / 停止会话
        )
        .with_state(state)
}
