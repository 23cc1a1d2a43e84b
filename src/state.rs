use crate::config::AppConfig;
use crate::error::{CreationError, NotFoundError};
use crate::metrics::Metrics;
use crate::platform::CallPlatform;
use crate::profile::{self, TranscodeProfile};
use crate::session::{self, SessionSettings, SessionState, SessionView, StreamSession};
use crate::source::{self, ChatTarget, SourceDescriptor, SourceResolver};
use crate::supervisor::Launcher;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 创建会话的请求
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    pub chat: String,
    pub source: String,
    #[serde(default)]
    pub profile: Option<String>,
}

/// 会话注册表：ID -> 会话
///
/// 读写都经过同一把读写锁；每个会话自身的状态由它自己的 `watch` 通道保护，
/// 所以列表和指标读取拿到的是逐会话一致的快照。
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    settings: SessionSettings,
    default_profile: String,
    launcher: Arc<dyn Launcher>,
    resolver: Arc<dyn SourceResolver>,
    platform: Arc<dyn CallPlatform>,
    metrics: Arc<Metrics>,
}

impl SessionRegistry {
    pub fn new(
        settings: SessionSettings,
        default_profile: impl Into<String>,
        launcher: Arc<dyn Launcher>,
        resolver: Arc<dyn SourceResolver>,
        platform: Arc<dyn CallPlatform>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
            default_profile: default_profile.into(),
            launcher,
            resolver,
            platform,
            metrics,
        }
    }

    /// 校验请求并注册新会话，监管任务在后台把它推进到 Connecting
    ///
    /// # 错误处理
    /// - 聊天或源地址不合法、YouTube 解析失败时返回 `CreationError`，会话不会被注册
    /// - 同一聊天已有未结束的会话时返回 `ChatBusy`
    pub async fn create(&self, request: CreateRequest) -> Result<SessionView, CreationError> {
        let chat = ChatTarget::parse(&request.chat)?;
        let source = SourceDescriptor::classify(&request.source)?;
        let profile = self.pick_profile(request.profile.as_deref());

        // 解析可能耗时数秒，不能持锁
        if self.is_chat_busy(&chat) {
            return Err(CreationError::ChatBusy(chat.to_string()));
        }
        let playable = source::playable_uri(&source, self.resolver.as_ref()).await?;

        let (session, runner) = {
            let mut sessions = self.sessions.write();
            if sessions
                .values()
                .any(|s| s.chat == chat && !s.state().is_terminal())
            {
                return Err(CreationError::ChatBusy(chat.to_string()));
            }

            let id = loop {
                let candidate = short_id();
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            };

            let (session, runner) = session::new_session(
                id.clone(),
                chat,
                source,
                playable,
                profile,
                &self.settings,
                self.launcher.clone(),
                self.platform.clone(),
                self.metrics.clone(),
            );
            sessions.insert(id, session.clone());
            (session, runner)
        };

        self.metrics
            .stream_starts
            .with_label_values(&[session.profile.id, session.source.kind.as_str()])
            .inc();
        info!(
            session = %session.id,
            chat = %session.chat,
            source = %session.source.kind,
            profile = session.profile.id,
            copy = session.profile.is_copy(),
            "Stream session created"
        );

        let task = tokio::spawn(runner.run());
        let watched = session.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(session = %watched.id, "Supervision task panicked");
                    watched.mark_crashed("supervision task panicked");
                }
            }
        });

        Ok(session.view())
    }

    pub fn get(&self, id: &str) -> Result<SessionView, NotFoundError> {
        self.sessions
            .read()
            .get(id)
            .map(|s| s.view())
            .ok_or_else(|| NotFoundError(id.to_string()))
    }

    /// 按创建时间排序的快照
    pub fn list(&self, active_only: bool) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self
            .sessions
            .read()
            .values()
            .map(|s| s.view())
            .filter(|v| !active_only || !v.state.is_terminal())
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        views
    }

    /// 发起停止并立即返回，完成情况通过 `get` 观察
    pub fn stop(&self, id: &str) -> Result<SessionState, NotFoundError> {
        let session = self
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| NotFoundError(id.to_string()))?;
        Ok(session.request_stop())
    }

    /// 停止全部会话并等待它们进入终止状态，超时后放弃等待
    pub async fn stop_all(&self, wait: Duration) {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut pending = Vec::new();
        for s in &sessions {
            if !s.request_stop().is_terminal() {
                pending.push(s.subscribe());
            }
        }
        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), "Waiting for sessions to stop");
        let all = async {
            for mut rx in pending {
                let _ = rx.wait_for(|s| s.state.is_terminal()).await;
            }
        };
        if tokio::time::timeout(wait, all).await.is_err() {
            warn!("Some sessions did not stop within {:?}", wait);
        }
    }

    /// 移除结束超过 `retention` 的会话，返回移除数量
    pub fn reap(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| {
            let status = s.status();
            match (status.state.is_terminal(), status.stopped_at) {
                // 时钟回拨时 to_std 失败，保留
                (true, Some(at)) => (now - at).to_std().map_or(true, |age| age < retention),
                _ => true,
            }
        });
        before - sessions.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| !s.state().is_terminal())
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn platform_connected(&self) -> bool {
        self.platform.is_connected()
    }

    fn pick_profile(&self, requested: Option<&str>) -> TranscodeProfile {
        match requested.map(str::trim).filter(|p| !p.is_empty()) {
            Some(name) => profile::resolve(name),
            None => profile::resolve(&self.default_profile),
        }
    }

    fn is_chat_busy(&self, chat: &ChatTarget) -> bool {
        self.sessions
            .read()
            .values()
            .any(|s| &s.chat == chat && !s.state().is_terminal())
    }
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    pub registry: SessionRegistry,
    pub metrics: Arc<Metrics>,
}

pub type SharedState = Arc<AppState>;

/// 后台回收任务：定期清理已结束且超过保留期的会话
pub async fn start_reaper(state: SharedState) {
    let mut interval =
        tokio::time::interval(Duration::from_millis(state.config.server.reap_interval_ms));
    let retention = Duration::from_secs(state.config.server.session_retention_sec);

    loop {
        interval.tick().await;
        let removed = state.registry.reap(retention);
        if removed > 0 {
            debug!(removed, remaining = state.registry.total_count(), "Reaped finished sessions");
        }
    }
}
