use crate::error::ProcessError;
use crate::profile::TranscodeProfile;
use crate::source::SourceKind;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 64 * 1024;

/// 构建转码子进程命令的接缝。stdio 由 supervisor 统一设置。
pub trait Launcher: Send + Sync {
    fn command(&self, kind: SourceKind, source_uri: &str, profile: &TranscodeProfile) -> Command;
}

/// FFmpeg 启动器：输入参数按源类型区分，编码参数来自画质预设，MPEG-TS 输出到 stdout
pub struct FfmpegLauncher {
    binary: String,
    threads: u32,
}

impl FfmpegLauncher {
    pub fn new(binary: impl Into<String>, threads: u32) -> Self {
        Self {
            binary: binary.into(),
            threads,
        }
    }

    pub fn args(
        &self,
        kind: SourceKind,
        source_uri: &str,
        profile: &TranscodeProfile,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-y".into(),
            "-loglevel".into(),
            "warning".into(),
            "-threads".into(),
            self.threads.to_string(),
        ];

        // 网络流断线重连参数
        match kind {
            SourceKind::Hls => args.extend(
                [
                    "-reconnect",
                    "1",
                    "-reconnect_streamed",
                    "1",
                    "-reconnect_delay_max",
                    "5",
                ]
                .map(String::from),
            ),
            SourceKind::Rtmp => args.extend(["-rtmp_live", "live"].map(String::from)),
            SourceKind::Youtube => {}
        }

        args.extend(
            [
                "-analyzeduration",
                "5000000",
                "-probesize",
                "5000000",
                "-fflags",
                "+genpts+discardcorrupt",
                "-i",
            ]
            .map(String::from),
        );
        args.push(source_uri.to_string());

        args.extend(profile.video_args());
        args.extend(profile.audio_args());
        args.extend(["-f", "mpegts", "-flush_packets", "1", "pipe:1"].map(String::from));
        args
    }
}

impl Launcher for FfmpegLauncher {
    fn command(&self, kind: SourceKind, source_uri: &str, profile: &TranscodeProfile) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(kind, source_uri, profile));
        cmd
    }
}

/// 进程退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// 进程自行退出
    Exited,
    /// 超过心跳时间没有任何输出，被强制结束
    Stalled,
    /// 由 terminate 结束
    Terminated,
}

/// 一次进程生命周期只产生一次的退出事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub code: Option<i32>,
    pub abnormal: bool,
    pub reason: ExitReason,
    /// stderr 最后一行
    pub detail: Option<String>,
}

impl fmt::Display for ExitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            ExitReason::Stalled => write!(f, "transcoder stalled (no output)")?,
            ExitReason::Terminated => write!(f, "transcoder terminated")?,
            ExitReason::Exited => match self.code {
                Some(code) => write!(f, "transcoder exited with code {}", code)?,
                None => write!(f, "transcoder killed by signal")?,
            },
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// start 返回给会话控制循环的事件接收端
#[derive(Debug)]
pub struct ProcessSignals {
    pub pid: Option<u32>,
    /// 首次产生输出时触发
    pub healthy: oneshot::Receiver<()>,
    pub exit: oneshot::Receiver<ExitEvent>,
}

struct LiveProcess {
    pid: Option<u32>,
    stop: CancellationToken,
    monitor: JoinHandle<()>,
}

/// 单个会话的转码进程监管者。同一时刻最多持有一个存活进程。
pub struct ProcessSupervisor {
    launcher: Arc<dyn Launcher>,
    liveness_timeout: Duration,
    grace: Duration,
    live: Option<LiveProcess>,
    bytes_out: Arc<AtomicU64>,
    spawn_count: u64,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn Launcher>, liveness_timeout: Duration, grace: Duration) -> Self {
        Self {
            launcher,
            liveness_timeout,
            grace,
            live: None,
            bytes_out: Arc::new(AtomicU64::new(0)),
            spawn_count: 0,
        }
    }

    /// 启动转码进程，输出块推送到 `sink`
    ///
    /// # 错误处理
    /// - 上一个句柄还未 terminate 时拒绝启动
    /// - 子进程启动失败时返回错误
    pub fn start(
        &mut self,
        kind: SourceKind,
        source_uri: &str,
        profile: &TranscodeProfile,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<ProcessSignals, ProcessError> {
        if let Some(live) = &self.live {
            return Err(ProcessError::AlreadyRunning(live.pid));
        }

        let mut cmd = self.launcher.command(kind, source_uri, profile);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn transcoder process: {}", e);
            e
        })?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("transcoder stdout not captured"))?;
        let stderr = child.stderr.take();

        let stop = CancellationToken::new();
        let (healthy_tx, healthy) = oneshot::channel();
        let (exit_tx, exit) = oneshot::channel();

        let monitor = Monitor {
            child,
            stdout,
            stderr,
            sink,
            stop: stop.clone(),
            liveness_timeout: self.liveness_timeout,
            grace: self.grace,
            bytes_out: self.bytes_out.clone(),
        };
        let monitor = tokio::spawn(monitor.run(healthy_tx, exit_tx));

        self.spawn_count += 1;
        self.live = Some(LiveProcess { pid, stop, monitor });
        info!(pid = ?pid, "Transcoder started");

        Ok(ProcessSignals { pid, healthy, exit })
    }

    /// 结束当前进程 (幂等)。返回时保证进程已被回收。
    pub async fn terminate(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        live.stop.cancel();
        if let Err(e) = live.monitor.await {
            // 监控任务异常时子进程随句柄 drop 被 kill
            error!(pid = ?live.pid, "Transcoder monitor task failed: {}", e);
        }
        debug!(pid = ?live.pid, "Transcoder handle released");
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// 累计输出字节数计数器 (跨进程生命周期共享)
    pub fn byte_counter(&self) -> Arc<AtomicU64> {
        self.bytes_out.clone()
    }

    pub fn spawn_count(&self) -> u64 {
        self.spawn_count
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.stop.cancel();
        }
    }
}

/// 监控任务持有子进程：转发 stdout、检测心跳、上报退出
struct Monitor {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    sink: mpsc::Sender<Bytes>,
    stop: CancellationToken,
    liveness_timeout: Duration,
    grace: Duration,
    bytes_out: Arc<AtomicU64>,
}

enum Outcome {
    Terminate,
    Stalled,
    Eof,
}

impl Monitor {
    async fn run(mut self, healthy_tx: oneshot::Sender<()>, exit_tx: oneshot::Sender<ExitEvent>) {
        let pid = self.child.id();
        let tail = Arc::new(Mutex::new(None::<String>));
        let stderr_task = self.stderr.take().map(|s| spawn_stderr_reader(s, pid, tail.clone()));

        let mut healthy_tx = Some(healthy_tx);
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        let outcome = loop {
            buf.reserve(READ_CHUNK);
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break Outcome::Terminate,
                read = tokio::time::timeout(
                    self.liveness_timeout,
                    self.stdout.read_buf(&mut buf),
                ) => {
                    match read {
                        Err(_) => break Outcome::Stalled,
                        Ok(Ok(0)) => break Outcome::Eof,
                        Ok(Ok(n)) => {
                            self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                            if let Some(tx) = healthy_tx.take() {
                                let _ = tx.send(());
                            }
                            let chunk = buf.split().freeze();
                            tokio::select! {
                                biased;
                                _ = self.stop.cancelled() => break Outcome::Terminate,
                                // 发布端已关闭时丢弃数据，继续以输出作为心跳
                                _ = self.sink.send(chunk) => {}
                            }
                        }
                        Ok(Err(e)) => {
                            warn!(pid = ?pid, "Transcoder stdout read error: {}", e);
                            break Outcome::Eof;
                        }
                    }
                }
            }
        };

        let (reason, status) = match outcome {
            Outcome::Terminate => (ExitReason::Terminated, self.shutdown().await),
            Outcome::Stalled => {
                warn!(
                    pid = ?pid,
                    timeout = ?self.liveness_timeout,
                    "Transcoder produced no output, killing"
                );
                (ExitReason::Stalled, self.shutdown().await)
            }
            Outcome::Eof => {
                // stdout 已关闭，进程应当随即退出
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => (ExitReason::Terminated, self.shutdown().await),
                    status = self.child.wait() => (ExitReason::Exited, status.ok()),
                    _ = tokio::time::sleep(self.liveness_timeout) => {
                        (ExitReason::Stalled, self.shutdown().await)
                    }
                }
            }
        };

        if let Some(task) = stderr_task {
            let _ = tokio::time::timeout(Duration::from_millis(200), task).await;
        }

        let code = status.and_then(|s| s.code());
        let abnormal = match reason {
            ExitReason::Exited => !status.map(|s| s.success()).unwrap_or(false),
            ExitReason::Stalled => true,
            ExitReason::Terminated => false,
        };
        let event = ExitEvent {
            code,
            abnormal,
            reason,
            detail: tail.lock().take(),
        };

        match reason {
            ExitReason::Terminated => info!(pid = ?pid, "Transcoder stopped."),
            _ => warn!(pid = ?pid, "Transcoder exited: {}", event),
        }
        let _ = exit_tx.send(event);
    }

    /// 先 SIGTERM，宽限期后 SIGKILL
    async fn shutdown(&mut self) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        request_exit(&mut self.child);
        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                warn!(
                    pid = ?self.child.id(),
                    grace = ?self.grace,
                    "Transcoder ignored SIGTERM, killing"
                );
                let _ = self.child.kill().await;
                self.child.wait().await.ok()
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, "SIGTERM failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.start_kill();
}

fn spawn_stderr_reader(
    stderr: ChildStderr,
    pid: Option<u32>,
    tail: Arc<Mutex<Option<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            debug!(pid = ?pid, "transcoder: {}", line);
            *tail.lock() = Some(line.to_string());
        }
    })
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::profile;
    use tokio::time::timeout;

    /// 用 /bin/sh 脚本代替转码器
    pub(crate) struct ShellLauncher(pub String);

    impl Launcher for ShellLauncher {
        fn command(&self, _kind: SourceKind, _uri: &str, _profile: &TranscodeProfile) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.0);
            cmd
        }
    }

    pub(crate) const TICKING: &str = "while true; do echo tick; sleep 0.05; done";

    fn supervisor(script: &str, liveness_ms: u64) -> ProcessSupervisor {
        ProcessSupervisor::new(
            Arc::new(ShellLauncher(script.to_string())),
            Duration::from_millis(liveness_ms),
            Duration::from_millis(300),
        )
    }

    fn start(sup: &mut ProcessSupervisor) -> (ProcessSignals, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(4);
        let signals = sup
            .start(SourceKind::Hls, "https://example.com/a.m3u8", &profile::AUTO, tx)
            .unwrap();
        (signals, rx)
    }

    #[tokio::test]
    async fn rejects_second_start_while_live() {
        let mut sup = supervisor(TICKING, 2000);
        let (signals, mut rx) = start(&mut sup);

        timeout(Duration::from_secs(2), signals.healthy).await.unwrap().unwrap();
        assert!(rx.recv().await.is_some());

        let (tx, _rx2) = mpsc::channel(4);
        let err = sup
            .start(SourceKind::Hls, "https://example.com/a.m3u8", &profile::AUTO, tx)
            .unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyRunning(_)));

        sup.terminate().await;
        assert!(!sup.is_live());
        let exit = signals.exit.await.unwrap();
        assert_eq!(exit.reason, ExitReason::Terminated);
        assert!(!exit.abnormal);

        // terminate 之后可以再次启动
        let (again, _rx3) = start(&mut sup);
        assert!(again.pid.is_some());
        sup.terminate().await;
        assert_eq!(sup.spawn_count(), 2);
        assert!(sup.byte_counter().load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn reports_abnormal_exit_code() {
        let mut sup = supervisor("echo boom >&2; echo data; exit 3", 2000);
        let (signals, _rx) = start(&mut sup);

        let exit = timeout(Duration::from_secs(2), signals.exit).await.unwrap().unwrap();
        assert_eq!(exit.reason, ExitReason::Exited);
        assert_eq!(exit.code, Some(3));
        assert!(exit.abnormal);
        assert_eq!(exit.detail.as_deref(), Some("boom"));

        // 进程已退出但句柄仍在，必须先 terminate
        assert!(sup.is_live());
        sup.terminate().await;
        assert!(!sup.is_live());
    }

    #[tokio::test]
    async fn silent_process_is_treated_as_stalled() {
        let mut sup = supervisor("echo once; sleep 10", 200);
        let (signals, _rx) = start(&mut sup);

        let exit = timeout(Duration::from_secs(3), signals.exit).await.unwrap().unwrap();
        assert_eq!(exit.reason, ExitReason::Stalled);
        assert!(exit.abnormal);
        sup.terminate().await;
    }

    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let mut sup = supervisor("trap '' TERM; while true; do echo x; sleep 0.05; done", 2000);
        let (signals, _rx) = start(&mut sup);
        timeout(Duration::from_secs(2), signals.healthy).await.unwrap().unwrap();

        timeout(Duration::from_secs(3), sup.terminate()).await.unwrap();
        assert!(!sup.is_live());
        let exit = signals.exit.await.unwrap();
        assert_eq!(exit.reason, ExitReason::Terminated);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let mut sup = supervisor(TICKING, 2000);
        sup.terminate().await;
        let (_signals, _rx) = start(&mut sup);
        sup.terminate().await;
        sup.terminate().await;
        assert!(!sup.is_live());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_handle() {
        struct Missing;
        impl Launcher for Missing {
            fn command(&self, _: SourceKind, _: &str, _: &TranscodeProfile) -> Command {
                Command::new("/nonexistent/transcoder-binary")
            }
        }
        let mut sup = ProcessSupervisor::new(
            Arc::new(Missing),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let (tx, _rx) = mpsc::channel(1);
        let err = sup
            .start(SourceKind::Rtmp, "rtmp://x/live", &profile::AUTO, tx)
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn(_)));
        assert!(!sup.is_live());
    }

    #[test]
    fn ffmpeg_args_follow_source_kind_and_profile() {
        let launcher = FfmpegLauncher::new("ffmpeg", 2);

        let hls = launcher.args(SourceKind::Hls, "https://a/x.m3u8", &profile::resolve("720p"));
        let joined = hls.join(" ");
        assert!(joined.starts_with("-hide_banner -y -loglevel warning -threads 2 -reconnect 1"));
        assert!(joined.contains("-i https://a/x.m3u8 -c:v libx264"));
        assert!(joined.contains("scale=1280:720"));
        assert!(joined.ends_with("-f mpegts -flush_packets 1 pipe:1"));

        let rtmp = launcher.args(SourceKind::Rtmp, "rtmp://a/live", &profile::AUTO).join(" ");
        assert!(rtmp.contains("-rtmp_live live"));
        assert!(!rtmp.contains("-reconnect"));
        assert!(rtmp.contains("-c:v copy -c:a copy"));
    }
}
