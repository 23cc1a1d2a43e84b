use crate::state::SharedState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

/// 健康检查
/// 返回服务状态、运行时长、活跃会话数以及主机内存和负载
pub async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);
    let connected = state.registry.platform_connected();

    Json(serde_json::json!({
        "status": if connected { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.metrics.uptime_seconds(),
        "active_streams": state.registry.active_count(),
        "total_streams": state.registry.total_count(),
        "platform_connected": connected,
        "mem_total": mem.0 / 1024, // MB
        "mem_avail": mem.1 / 1024, // MB
        "load_avg": load,
    }))
}

/// Prometheus 文本格式指标
pub async fn metrics(State(state): State<SharedState>) -> Response {
    match state.metrics.render(state.registry.active_count()) {
        Ok(body) => (
            [(header::CONTENT_TYPE, state.metrics.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use crate::web::router;
    use crate::web::tests::{body_bytes, body_json, empty_request, test_state};
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_ok_and_counts() {
        let app = router(test_state());
        let res = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = body_json(res).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_streams"], 0);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["uptime_seconds"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn metrics_are_prometheus_text() {
        let state = test_state();
        state.metrics.reconnection_attempts.inc();
        let app = router(state);

        let res = app.oneshot(empty_request("GET", "/metrics")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let content_type = res.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"));

        let text = String::from_utf8(body_bytes(res).await).unwrap();
        assert!(text.contains("chatcast_reconnection_attempts_total 1"));
        assert!(text.contains("chatcast_active_streams 0"));
    }
}
