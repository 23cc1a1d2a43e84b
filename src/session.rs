//! 单个推流会话的状态机与监管任务
//!
//! `Pending → Connecting → Streaming → Reconnecting → {Streaming, Failed}`，
//! 任意非终止状态都可经 `Stopping` 进入 `Stopped`。
//!
//! 状态由 `watch` 通道持有，每次迁移在同一次 `send_if_modified` 内完成，
//! 读者看到的永远是完整的一次迁移。只有监管任务会操作进程和通话句柄。

use crate::metrics::Metrics;
use crate::platform::{CallEvent, CallHandle, CallPlatform};
use crate::profile::TranscodeProfile;
use crate::reconnect::{ReconnectPolicy, ReconnectSnapshot, ReconnectState};
use crate::source::{ChatTarget, SourceDescriptor};
use crate::supervisor::{ExitEvent, Launcher, ProcessSupervisor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Connecting,
    Streaming,
    Reconnecting,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, to),
            (Pending, Connecting | Failed | Stopping)
                | (Connecting, Streaming | Reconnecting | Failed | Stopping)
                | (Streaming, Reconnecting | Failed | Stopping)
                | (Reconnecting, Streaming | Reconnecting | Failed | Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话的可观察状态
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub reconnect: ReconnectSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub pid: Option<u32>,
}

impl SessionStatus {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            state: SessionState::Pending,
            reconnect: ReconnectSnapshot::default(),
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
            last_error: None,
            error_count: 0,
            pid: None,
        }
    }
}

/// 对外返回的会话快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub chat: String,
    pub source_url: String,
    pub source_type: String,
    pub profile: String,
    pub state: SessionState,
    pub reconnect_attempts: u32,
    pub next_delay_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub bytes_streamed: u64,
}

/// 会话监管相关的参数，启动时从配置构建一次
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub policy: ReconnectPolicy,
    pub reconnect_enabled: bool,
    /// 单次连接 (进程健康 + 通话加入) 的时间预算，与重连总预算无关
    pub connect_timeout: Duration,
    pub liveness_timeout: Duration,
    pub terminate_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            reconnect_enabled: true,
            connect_timeout: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(5),
        }
    }
}

/// 注册表中保存的会话：不可变身份 + 共享状态 + 停止信号
pub struct StreamSession {
    pub id: String,
    pub chat: ChatTarget,
    pub source: SourceDescriptor,
    pub profile: TranscodeProfile,
    status: watch::Sender<SessionStatus>,
    stop: CancellationToken,
    bytes_streamed: Arc<AtomicU64>,
}

impl StreamSession {
    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// 在一次加锁内生成一致的快照
    pub fn view(&self) -> SessionView {
        let s = self.status.borrow();
        let duration = s
            .started_at
            .map(|start| {
                let end = s.stopped_at.unwrap_or_else(Utc::now);
                (end - start).num_milliseconds().max(0) as f64 / 1000.0
            })
            .unwrap_or(0.0);

        SessionView {
            id: self.id.clone(),
            chat: self.chat.to_string(),
            source_url: self.source.uri.clone(),
            source_type: self.source.kind.to_string(),
            profile: self.profile.id.to_string(),
            state: s.state,
            reconnect_attempts: s.reconnect.attempt,
            next_delay_secs: s.reconnect.next_delay_secs,
            created_at: s.created_at,
            updated_at: s.updated_at,
            started_at: s.started_at,
            stopped_at: s.stopped_at,
            duration_seconds: duration,
            last_error: s.last_error.clone(),
            error_count: s.error_count,
            bytes_streamed: self.bytes_streamed.load(Ordering::Relaxed),
        }
    }

    /// 请求停止。已终止或正在停止时为空操作；真正的清理由监管任务完成。
    pub fn request_stop(&self) -> SessionState {
        if self.transition(SessionState::Stopping, |_| {}) {
            info!(session = %self.id, "Stop requested");
        }
        self.stop.cancel();
        self.state()
    }

    /// 迁移状态并在同一次更新内修改附带字段；非法迁移返回 false
    fn transition(&self, to: SessionState, apply: impl FnOnce(&mut SessionStatus)) -> bool {
        self.status.send_if_modified(|s| {
            if !s.state.can_transition_to(to) {
                return false;
            }
            s.state = to;
            s.updated_at = Utc::now();
            apply(s);
            true
        })
    }

    /// 监管任务异常退出时由注册表调用
    pub(crate) fn mark_crashed(&self, reason: &str) {
        self.status.send_if_modified(|s| {
            if s.state.is_terminal() {
                return false;
            }
            let now = Utc::now();
            s.state = SessionState::Failed;
            s.updated_at = now;
            s.stopped_at = Some(now);
            s.last_error = Some(reason.to_string());
            s.error_count += 1;
            s.pid = None;
            true
        });
        self.stop.cancel();
    }
}

/// 创建会话及其监管任务 (任务尚未启动)
#[allow(clippy::too_many_arguments)]
pub fn new_session(
    id: String,
    chat: ChatTarget,
    source: SourceDescriptor,
    playable_uri: String,
    profile: TranscodeProfile,
    settings: &SessionSettings,
    launcher: Arc<dyn Launcher>,
    platform: Arc<dyn CallPlatform>,
    metrics: Arc<Metrics>,
) -> (Arc<StreamSession>, SessionRunner) {
    let supervisor = ProcessSupervisor::new(
        launcher,
        settings.liveness_timeout,
        settings.terminate_grace,
    );
    let (status, _) = watch::channel(SessionStatus::new());
    let session = Arc::new(StreamSession {
        id,
        chat,
        source,
        profile,
        status,
        stop: CancellationToken::new(),
        bytes_streamed: supervisor.byte_counter(),
    });

    let runner = SessionRunner {
        session: session.clone(),
        playable_uri,
        platform,
        supervisor,
        call: None,
        settings: settings.clone(),
        reconnect: ReconnectState::default(),
        metrics,
    };
    (session, runner)
}

/// 失败分类，用作错误指标的标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    ProcessFailure,
    ConnectionDropped,
    ConnectTimeout,
}

impl FailureKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessFailure => "process_failure",
            Self::ConnectionDropped => "connection_dropped",
            Self::ConnectTimeout => "connect_timeout",
        }
    }
}

/// 打断当前阶段的原因
enum Interrupt {
    Failed(FailureKind, String),
    /// 重连总时间预算在连接过程中耗尽
    Exhausted(String),
    Cancelled,
}

enum Next {
    Retry,
    Stop,
    Done,
}

/// 会话监管任务，独占进程监管者与通话句柄
pub struct SessionRunner {
    session: Arc<StreamSession>,
    playable_uri: String,
    platform: Arc<dyn CallPlatform>,
    supervisor: ProcessSupervisor,
    call: Option<CallHandle>,
    settings: SessionSettings,
    reconnect: ReconnectState,
    metrics: Arc<Metrics>,
}

impl SessionRunner {
    /// 运行直到会话进入 Stopped 或 Failed
    pub async fn run(mut self) {
        let id = self.session.id.clone();
        info!(session = %id, chat = %self.session.chat, source = %self.session.source.kind,
            profile = self.session.profile.id, "Session supervision started");

        if url::Url::parse(&self.playable_uri).is_err() {
            let reason = format!("source is not playable: {}", self.playable_uri);
            if !self.fail(reason) {
                self.finish_stop().await;
            }
            return;
        }

        if !self.session.transition(SessionState::Connecting, |_| {}) {
            self.finish_stop().await;
            return;
        }

        loop {
            let interrupt = match self.connect().await {
                Ok(exit) => {
                    if !self.enter_streaming() {
                        break;
                    }
                    self.watch(exit).await
                }
                Err(interrupt) => interrupt,
            };

            let (kind, reason) = match interrupt {
                Interrupt::Cancelled => break,
                Interrupt::Failed(kind, reason) => (kind, reason),
                Interrupt::Exhausted(reason) => {
                    self.teardown().await;
                    self.record_error(FailureKind::ConnectTimeout);
                    error!(session = %id, "Reconnect timeout reached while connecting");
                    match self.fail_or_stop(reason) {
                        Next::Done => return,
                        _ => break,
                    }
                }
            };

            self.teardown().await;
            match self.schedule_retry(kind, reason).await {
                Next::Retry => continue,
                Next::Stop => break,
                Next::Done => return,
            }
        }

        self.finish_stop().await;
    }

    /// 加入通话并启动转码，等待两路就绪信号
    ///
    /// 重连中时，截止时间取单次连接超时与重连总预算中较早的一个。
    async fn connect(&mut self) -> Result<oneshot::Receiver<ExitEvent>, Interrupt> {
        let attempt_deadline = Instant::now() + self.settings.connect_timeout;
        let budget_deadline = self
            .reconnect
            .first_disconnect_at
            .map(|first| first + self.settings.policy.timeout);
        let (deadline, budget_bound) = match budget_deadline {
            Some(budget) if budget <= attempt_deadline => (budget, true),
            _ => (attempt_deadline, false),
        };
        let budget = self.settings.policy.timeout;
        let timed_out = move |kind: FailureKind, what: String| {
            if budget_bound {
                Interrupt::Exhausted(budget_exceeded(budget, &what))
            } else {
                Interrupt::Failed(kind, what)
            }
        };
        let id = &self.session.id;

        let joined = tokio::select! {
            biased;
            _ = self.session.stop.cancelled() => return Err(Interrupt::Cancelled),
            r = tokio::time::timeout_at(deadline, self.platform.join_call(&self.session.chat)) => r,
        };
        let call = match joined {
            Ok(Ok(call)) => call,
            Ok(Err(e)) => {
                let reason = format!("join failed: {}", e);
                return Err(Interrupt::Failed(FailureKind::ConnectionDropped, reason));
            }
            Err(_) => {
                let reason = "join timed out".to_string();
                return Err(timed_out(FailureKind::ConnectTimeout, reason));
            }
        };
        let sink = call.media.clone();
        let call = self.call.insert(call);

        let signals = self
            .supervisor
            .start(self.session.source.kind, &self.playable_uri, &self.session.profile, sink)
            .map_err(|e| Interrupt::Failed(FailureKind::ProcessFailure, e.to_string()))?;
        let pid = signals.pid;
        self.session.status.send_modify(|s| s.pid = pid);

        let mut healthy = signals.healthy;
        let mut exit = signals.exit;
        let (mut is_healthy, mut healthy_closed, mut is_joined) = (false, false, false);

        while !(is_healthy && is_joined) {
            tokio::select! {
                biased;
                _ = self.session.stop.cancelled() => return Err(Interrupt::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    let missing = match (is_healthy, is_joined) {
                        (false, false) => "transcoder output and call join",
                        (false, true) => "transcoder output",
                        _ => "call join",
                    };
                    let reason = format!("connect timed out waiting for {}", missing);
                    return Err(timed_out(FailureKind::ConnectTimeout, reason));
                }
                ev = &mut exit => {
                    return Err(Interrupt::Failed(FailureKind::ProcessFailure, exit_reason(ev)));
                }
                r = &mut healthy, if !is_healthy && !healthy_closed => match r {
                    Ok(()) => is_healthy = true,
                    // 进程没有输出就退出了，退出事件随后到达
                    Err(_) => healthy_closed = true,
                },
                ev = call.events.recv(), if !is_joined => match ev {
                    Some(CallEvent::Joined) => is_joined = true,
                    other => return Err(call_interrupt(other)),
                },
            }
        }

        debug!(session = %id, pid = ?pid, "Transcoder healthy and call joined");
        Ok(exit)
    }

    /// Streaming 期间等待进程退出或通话掉线
    async fn watch(&mut self, mut exit: oneshot::Receiver<ExitEvent>) -> Interrupt {
        let Some(call) = self.call.as_mut() else {
            let reason = "call handle missing".to_string();
            return Interrupt::Failed(FailureKind::ConnectionDropped, reason);
        };

        loop {
            tokio::select! {
                biased;
                _ = self.session.stop.cancelled() => return Interrupt::Cancelled,
                ev = &mut exit => {
                    return Interrupt::Failed(FailureKind::ProcessFailure, exit_reason(ev));
                }
                ev = call.events.recv() => match ev {
                    Some(CallEvent::Joined) => continue,
                    other => return call_interrupt(other),
                },
            }
        }
    }

    fn enter_streaming(&mut self) -> bool {
        let was_reconnecting = self.reconnect.attempt > 0;
        let entered = self.session.transition(SessionState::Streaming, |s| {
            s.started_at.get_or_insert_with(Utc::now);
            s.reconnect = ReconnectSnapshot::default();
        });
        if entered {
            self.reconnect.reset();
            if was_reconnecting {
                info!(session = %self.session.id, "Reconnection successful");
            } else {
                info!(session = %self.session.id, "Stream is live");
            }
        }
        entered
    }

    /// 根据重连策略决定重试、失败或停止
    async fn schedule_retry(&mut self, kind: FailureKind, reason: String) -> Next {
        let id = self.session.id.clone();
        let now = Instant::now();
        self.record_error(kind);

        if !self.settings.reconnect_enabled {
            warn!(session = %id, "Reconnection disabled, failing session: {}", reason);
            return self.fail_or_stop(reason);
        }

        let policy = &self.settings.policy;
        if policy.is_exhausted(&self.reconnect, now) {
            let why = if self.reconnect.attempt >= policy.max_attempts {
                format!(
                    "reconnect attempts exhausted after {} attempts (last error: {})",
                    self.reconnect.attempt, reason
                )
            } else {
                budget_exceeded(policy.timeout, &reason)
            };
            error!(
                session = %id,
                attempts = self.reconnect.attempt,
                "Reconnection failed after all attempts"
            );
            return self.fail_or_stop(why);
        }

        let delay = self.reconnect.record_disconnect(policy, now);
        let snapshot = self.reconnect.snapshot();
        let entered = self.session.transition(SessionState::Reconnecting, |s| {
            s.reconnect = snapshot;
            s.last_error = Some(reason.clone());
            s.error_count += 1;
        });
        if !entered {
            return Next::Stop;
        }
        self.metrics.reconnection_attempts.inc();

        warn!(
            session = %id,
            "Stream interrupted ({}). Retry {}/{}. Backing off for {:?}.",
            reason, snapshot.attempt, policy.max_attempts, delay
        );

        tokio::select! {
            biased;
            _ = self.session.stop.cancelled() => return Next::Stop,
            _ = tokio::time::sleep(delay) => {}
        }

        if self.reconnect.elapsed(Instant::now()) >= self.settings.policy.timeout {
            let why = budget_exceeded(self.settings.policy.timeout, &reason);
            return self.fail_or_stop(why);
        }

        info!(session = %id, attempt = snapshot.attempt, "Reconnection attempt");
        Next::Retry
    }

    fn record_error(&self, kind: FailureKind) {
        self.metrics.stream_errors.with_label_values(&[kind.as_str()]).inc();
    }

    fn fail_or_stop(&mut self, reason: String) -> Next {
        if self.fail(reason) {
            Next::Done
        } else {
            Next::Stop
        }
    }

    /// 进入 Failed；若停止请求已先到达则返回 false
    fn fail(&mut self, reason: String) -> bool {
        let failed = self.session.transition(SessionState::Failed, |s| {
            s.stopped_at = Some(Utc::now());
            s.last_error = Some(reason.clone());
            s.error_count += 1;
            s.pid = None;
        });
        if failed {
            error!(session = %self.session.id, "Session failed: {}", reason);
            self.metrics.stream_stops.with_label_values(&["failed"]).inc();
        }
        failed
    }

    /// 结束进程并离开通话
    async fn teardown(&mut self) {
        if self.supervisor.is_live() {
            self.supervisor.terminate().await;
            debug!(
                session = %self.session.id,
                spawns = self.supervisor.spawn_count(),
                "Transcoder released"
            );
        }
        if let Some(call) = self.call.take() {
            let leave = self.platform.leave_call(call);
            if tokio::time::timeout(self.settings.terminate_grace, leave).await.is_err() {
                warn!(session = %self.session.id, "Leaving call timed out");
            }
        }
        self.session.status.send_modify(|s| s.pid = None);
    }

    async fn finish_stop(&mut self) {
        self.teardown().await;
        self.session.transition(SessionState::Stopping, |_| {});
        if self.session.transition(SessionState::Stopped, |s| {
            s.stopped_at = Some(Utc::now());
        }) {
            self.metrics.stream_stops.with_label_values(&["manual"]).inc();
            info!(session = %self.session.id, "Stream stopped.");
        }
    }
}

fn exit_reason(ev: Result<ExitEvent, oneshot::error::RecvError>) -> String {
    match ev {
        Ok(ev) => ev.to_string(),
        Err(_) => "transcoder monitor lost".to_string(),
    }
}

fn budget_exceeded(timeout: Duration, last_error: &str) -> String {
    format!(
        "reconnect timeout of {}s exceeded (last error: {})",
        timeout.as_secs(),
        last_error
    )
}

fn call_interrupt(ev: Option<CallEvent>) -> Interrupt {
    let reason = match ev {
        Some(CallEvent::Dropped(r)) => format!("call dropped: {}", r),
        Some(CallEvent::Error(e)) => format!("call error: {}", e),
        Some(CallEvent::Joined) => "unexpected join event".to_string(),
        None => "call event stream closed".to_string(),
    };
    Interrupt::Failed(FailureKind::ConnectionDropped, reason)
}
