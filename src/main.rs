mod cli;
mod config;
mod error;
mod logging;
mod metrics;
mod platform;
mod profile;
mod reconnect;
mod session;
mod source;
mod state;
mod supervisor;
mod web;

use clap::Parser;
use cli::{Args, Commands};
use config::AppConfig;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件；未显式指定且默认文件不存在时使用内置默认值
    let explicit = args.config.is_some();
    let path = args.config.as_deref().unwrap_or(cli::DEFAULT_CONFIG);
    let config = AppConfig::load_or_default(path, explicit)?;

    // 初始化日志系统，命令行参数优先于配置文件
    let level = args.log_level.as_deref().unwrap_or(&config.log.level);
    logging::init(level, args.json_logs || config.log.json)?;
    info!("ChatCast {} initialized.", env!("CARGO_PKG_VERSION"));

    match args.command {
        Commands::Stream {
            chat,
            source,
            profile,
        } => cli::run_stream(config, chat, source, profile).await,
        Commands::Serve { host, port } => cli::run_serve(config, host, port).await,
        Commands::Sessions {
            format,
            api,
            active_only,
        } => cli::run_sessions(&api, format, active_only).await,
        Commands::Check => cli::run_check(&config).await,
    }
}
