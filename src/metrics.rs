//! 进程级指标
//!
//! 指标挂在实例自己的 `Registry` 上，随 `AppState` 注入，不使用全局单例。

use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;

pub struct Metrics {
    registry: Registry,
    started: Instant,
    pub stream_starts: IntCounterVec,
    pub stream_stops: IntCounterVec,
    pub stream_errors: IntCounterVec,
    pub reconnection_attempts: IntCounter,
    active_streams: IntGauge,
    uptime: Gauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let stream_starts = IntCounterVec::new(
            Opts::new("chatcast_stream_starts_total", "Total number of stream starts"),
            &["profile", "source_type"],
        )?;
        let stream_stops = IntCounterVec::new(
            Opts::new("chatcast_stream_stops_total", "Total number of stream stops"),
            &["reason"],
        )?;
        let stream_errors = IntCounterVec::new(
            Opts::new("chatcast_stream_errors_total", "Total number of stream errors"),
            &["error_type"],
        )?;
        let reconnection_attempts = IntCounter::new(
            "chatcast_reconnection_attempts_total",
            "Total reconnection attempts",
        )?;
        let active_streams = IntGauge::new(
            "chatcast_active_streams",
            "Number of currently active streams",
        )?;
        let uptime = Gauge::new("chatcast_uptime_seconds", "Process uptime in seconds")?;

        registry.register(Box::new(stream_starts.clone()))?;
        registry.register(Box::new(stream_stops.clone()))?;
        registry.register(Box::new(stream_errors.clone()))?;
        registry.register(Box::new(reconnection_attempts.clone()))?;
        registry.register(Box::new(active_streams.clone()))?;
        registry.register(Box::new(uptime.clone()))?;

        Ok(Self {
            registry,
            started: Instant::now(),
            stream_starts,
            stream_stops,
            stream_errors,
            reconnection_attempts,
            active_streams,
            uptime,
        })
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// 刷新瞬时值后按 Prometheus 文本格式输出
    pub fn render(&self, active_streams: usize) -> prometheus::Result<String> {
        self.active_streams.set(active_streams as i64);
        self.uptime.set(self.uptime_seconds());

        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_series() {
        let m = Metrics::new().unwrap();
        m.stream_starts.with_label_values(&["720p", "hls"]).inc();
        m.reconnection_attempts.inc();
        m.reconnection_attempts.inc();

        let text = m.render(3).unwrap();
        let series = "chatcast_stream_starts_total{profile=\"720p\",source_type=\"hls\"} 1";
        assert!(text.contains(series));
        assert!(text.contains("chatcast_reconnection_attempts_total 2"));
        assert!(text.contains("chatcast_active_streams 3"));
        assert!(text.contains("chatcast_uptime_seconds"));
    }

    #[test]
    fn instances_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.reconnection_attempts.inc();
        assert_eq!(b.reconnection_attempts.get(), 0);
    }
}
