use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::platform::LoopbackPlatform;
use crate::profile;
use crate::session::{SessionState, SessionView};
use crate::source::YtDlpResolver;
use crate::state::{self, AppState, CreateRequest, SessionRegistry, SharedState};
use crate::supervisor::FfmpegLauncher;
use crate::web;
use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// ChatCast - 把直播源推到群组语音 / 视频通话
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// 以 JSON 输出日志
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

pub const DEFAULT_CONFIG: &str = "chatcast.yaml";

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 在前台推一路流，Ctrl-C 停止
    Stream {
        /// 目标聊天：数字 ID、@username 或 t.me 链接
        chat: String,
        /// 源地址：HLS / RTMP / YouTube
        source: String,
        /// 画质预设 (auto, 480p, 720p, 1080p)
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// 启动 HTTP API 服务
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// 查询运行中服务的会话列表
    Sessions {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
        /// 服务地址
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api: String,
        /// 只显示未结束的会话
        #[arg(long)]
        active_only: bool,
    },
    /// 检查转码器 / 解析器是否可用并打印生效配置
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// 按配置组装注册表和共享状态
pub fn build_state(config: AppConfig) -> anyhow::Result<SharedState> {
    let metrics = Arc::new(Metrics::new().context("registering metrics")?);
    let launcher = Arc::new(FfmpegLauncher::new(
        config.transcoder.binary.clone(),
        config.transcoder.threads,
    ));
    let resolver = Arc::new(YtDlpResolver::new(
        config.transcoder.resolver_binary.clone(),
        Duration::from_secs(config.transcoder.resolve_timeout_sec),
    ));
    // 真实的平台桥接不在本 crate 内，默认使用本地回环
    let platform = Arc::new(LoopbackPlatform::new());

    let registry = SessionRegistry::new(
        config.session_settings(),
        config.session.default_profile.clone(),
        launcher,
        resolver,
        platform,
        metrics.clone(),
    );
    Ok(Arc::new(AppState {
        config,
        registry,
        metrics,
    }))
}

fn warn_unknown_profile(name: Option<&str>) {
    if let Some(name) = name {
        if !profile::is_known(name) {
            warn!("Unknown profile '{}', falling back to auto", name);
        }
    }
}

/// 前台推流：打印每次状态变化，直到会话结束或收到 Ctrl-C
pub async fn run_stream(
    config: AppConfig,
    chat: String,
    source: String,
    profile: Option<String>,
) -> anyhow::Result<()> {
    warn_unknown_profile(profile.as_deref());
    let grace = Duration::from_millis(config.session.terminate_grace_ms) * 2;
    let state = build_state(config)?;

    let view = state
        .registry
        .create(CreateRequest {
            chat,
            source,
            profile,
        })
        .await?;
    println!(
        "Session {} created: {} -> {} [{}]",
        view.id, view.source_url, view.chat, view.profile
    );

    let mut last = view.state;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let final_view = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("Stopping...");
                state.registry.stop_all(grace).await;
                break state.registry.get(&view.id)?;
            }
            _ = ticker.tick() => {
                let current = state.registry.get(&view.id)?;
                if current.state != last {
                    print_transition(&current);
                    last = current.state;
                }
                if current.state.is_terminal() {
                    break current;
                }
            }
        }
    };

    match final_view.state {
        SessionState::Failed => bail!(
            "stream failed: {}",
            final_view.last_error.unwrap_or_else(|| "unknown error".to_string())
        ),
        _ => {
            println!(
                "Stream stopped after {:.1}s, {} bytes sent",
                final_view.duration_seconds, final_view.bytes_streamed
            );
            Ok(())
        }
    }
}

fn print_transition(view: &SessionView) {
    match view.state {
        SessionState::Reconnecting => println!(
            "[{}] reconnecting (attempt {}, next in {:.1}s): {}",
            view.id,
            view.reconnect_attempts,
            view.next_delay_secs.unwrap_or(0.0),
            view.last_error.as_deref().unwrap_or("-")
        ),
        SessionState::Failed => println!(
            "[{}] failed: {}",
            view.id,
            view.last_error.as_deref().unwrap_or("-")
        ),
        other => println!("[{}] {}", view.id, other),
    }
}

/// 启动 HTTP 服务，Ctrl-C 时先停止全部会话再退出
pub async fn run_serve(
    mut config: AppConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if host.is_some() || port.is_some() {
        let (cfg_host, cfg_port) = config.server.listen.rsplit_once(':').ok_or_else(|| {
            anyhow!("server.listen must be host:port, got {}", config.server.listen)
        })?;
        let host = host.unwrap_or_else(|| cfg_host.to_string());
        let port = port.map(|p| p.to_string()).unwrap_or_else(|| cfg_port.to_string());
        config.server.listen = format!("{}:{}", host, port);
    }

    let grace = Duration::from_millis(config.session.terminate_grace_ms) * 2;
    let listen = config.server.listen.clone();
    let state = build_state(config)?;

    // 启动后台回收任务
    tokio::spawn(state::start_reaper(state.clone()));

    let app = web::router(state.clone());
    info!("Listening on {}", listen);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    state.registry.stop_all(grace).await;
    info!("All sessions stopped. Bye.");
    Ok(())
}

#[derive(serde::Deserialize)]
struct ListResponse {
    streams: Vec<SessionView>,
}

/// 通过 HTTP API 查询会话
pub async fn run_sessions(
    api: &str,
    format: OutputFormat,
    active_only: bool,
) -> anyhow::Result<()> {
    let url = format!(
        "{}/api/streams?active_only={}",
        api.trim_end_matches('/'),
        active_only
    );
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("requesting {}", url))?
        .error_for_status()?;
    let list: ListResponse = response.json().await.context("decoding session list")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&list.streams)?),
        OutputFormat::Table => print!("{}", render_table(&list.streams)),
    }
    Ok(())
}

fn render_table(sessions: &[SessionView]) -> String {
    if sessions.is_empty() {
        return "No sessions.\n".to_string();
    }
    let mut out = format!(
        "{:<10} {:<24} {:<8} {:<8} {:<13} {:>8} {:>10}  {}\n",
        "ID", "CHAT", "SOURCE", "PROFILE", "STATE", "RETRIES", "UPTIME", "LAST ERROR"
    );
    for s in sessions {
        out.push_str(&format!(
            "{:<10} {:<24} {:<8} {:<8} {:<13} {:>8} {:>9.0}s  {}\n",
            s.id,
            truncate(&s.chat, 24),
            s.source_type,
            s.profile,
            s.state.as_str(),
            s.reconnect_attempts,
            s.duration_seconds,
            s.last_error.as_deref().unwrap_or("-"),
        ));
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

/// 检查外部依赖是否可用并打印生效的配置
pub async fn run_check(config: &AppConfig) -> anyhow::Result<()> {
    let transcoder = binary_version(&config.transcoder.binary, "-version").await;
    let resolver = binary_version(&config.transcoder.resolver_binary, "--version").await;

    println!("transcoder ({}): {}", config.transcoder.binary, describe(&transcoder));
    println!("resolver ({}): {}", config.transcoder.resolver_binary, describe(&resolver));
    println!(
        "profiles: {}",
        profile::all()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("---\n{}", serde_yaml::to_string(config)?);

    if let Err(e) = transcoder {
        bail!("transcoder unavailable: {}", e);
    }
    Ok(())
}

fn describe(result: &anyhow::Result<String>) -> String {
    match result {
        Ok(version) => format!("ok ({})", version),
        Err(e) => format!("unavailable ({})", e),
    }
}

/// 运行 `<binary> <flag>`，返回输出的第一行
async fn binary_version(binary: &str, flag: &str) -> anyhow::Result<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(10),
        Command::new(binary)
            .arg(flag)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| anyhow!("timed out"))??;

    if !output.status.success() {
        bail!("exited with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn view(id: &str, state: SessionState) -> SessionView {
        let now = Utc::now();
        SessionView {
            id: id.to_string(),
            chat: "@a_very_long_channel_name_indeed".to_string(),
            source_url: "https://cdn.example.com/a.m3u8".to_string(),
            source_type: "hls".to_string(),
            profile: "720p".to_string(),
            state,
            reconnect_attempts: 2,
            next_delay_secs: Some(10.0),
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            stopped_at: None,
            duration_seconds: 42.0,
            last_error: None,
            error_count: 0,
            bytes_streamed: 0,
        }
    }

    #[test]
    fn parses_subcommands_and_global_flags() {
        let args = Args::try_parse_from([
            "chatcast",
            "stream",
            "@my_channel",
            "rtmp://x/live",
            "--profile",
            "720p",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        match args.command {
            Commands::Stream { chat, profile, .. } => {
                assert_eq!(chat, "@my_channel");
                assert_eq!(profile.as_deref(), Some("720p"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let args = Args::try_parse_from(["chatcast", "sessions", "--format", "json"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::Sessions { format: OutputFormat::Json, .. }
        ));
    }

    #[test]
    fn table_lists_each_session() {
        let text = render_table(&[view("ab12cd34", SessionState::Reconnecting)]);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].contains("ab12cd34"));
        assert!(lines[1].contains("reconnecting"));
        assert!(lines[1].contains("…"));
        assert_eq!(render_table(&[]), "No sessions.\n");
    }

    #[test]
    fn builds_state_from_defaults() {
        let state = build_state(AppConfig::default()).unwrap();
        assert_eq!(state.registry.total_count(), 0);
        assert!(state.registry.platform_connected());
    }
}
