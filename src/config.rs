use crate::reconnect::ReconnectPolicy;
use crate::session::SessionSettings;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub transcoder: TranscoderConfig,
    pub reconnect: ReconnectConfig,
    pub session: SessionConfig,
    pub log: LogConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// 终止会话回收检查间隔
    pub reap_interval_ms: u64,
    /// 终止状态的会话保留多久 (用于列表展示)
    pub session_retention_sec: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            reap_interval_ms: 5000,
            session_retention_sec: 600,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TranscoderConfig {
    pub binary: String,
    pub threads: u32,
    /// YouTube 源解析器
    pub resolver_binary: String,
    pub resolve_timeout_sec: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            threads: 2,
            resolver_binary: "yt-dlp".to_string(),
            resolve_timeout_sec: 30,
        }
    }
}

/// 故障重试策略
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// 初始退避时间 (秒)
    pub min_delay_sec: u64,
    /// 最大退避时间 (秒)
    pub max_delay_sec: u64,
    /// 最大重试次数
    pub max_attempts: u32,
    /// 从首次断线起的总预算 (秒)
    pub timeout_sec: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay_sec: 5,
            max_delay_sec: 30,
            max_attempts: 10,
            timeout_sec: 90,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub default_profile: String,
    /// 单次连接超时 (秒)，与重连总预算分开
    pub connect_timeout_sec: u64,
    /// 转码进程无输出多久视为卡死 (秒)
    pub liveness_timeout_sec: u64,
    /// SIGTERM 到 SIGKILL 的宽限期 (毫秒)
    pub terminate_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_profile: "auto".to_string(),
            connect_timeout_sec: 15,
            liveness_timeout_sec: 10,
            terminate_grace_ms: 5000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// 默认路径的配置文件不存在时使用内置默认值；显式指定的文件必须可读
    pub fn load_or_default<P: AsRef<Path>>(path: P, explicit: bool) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let r = &self.reconnect;
        if r.min_delay_sec > r.max_delay_sec {
            bail!(
                "reconnect.min_delay_sec ({}) must not exceed reconnect.max_delay_sec ({})",
                r.min_delay_sec,
                r.max_delay_sec
            );
        }
        if r.max_attempts == 0 {
            bail!("reconnect.max_attempts must be at least 1");
        }
        if r.timeout_sec == 0 {
            bail!("reconnect.timeout_sec must be non-zero");
        }
        let s = &self.session;
        if s.connect_timeout_sec == 0 || s.liveness_timeout_sec == 0 || s.terminate_grace_ms == 0 {
            bail!("session timeouts must be non-zero");
        }
        if self.server.reap_interval_ms == 0 {
            bail!("server.reap_interval_ms must be non-zero");
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            min_delay: Duration::from_secs(self.reconnect.min_delay_sec),
            max_delay: Duration::from_secs(self.reconnect.max_delay_sec),
            max_attempts: self.reconnect.max_attempts,
            timeout: Duration::from_secs(self.reconnect.timeout_sec),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            policy: self.reconnect_policy(),
            reconnect_enabled: self.reconnect.enabled,
            connect_timeout: Duration::from_secs(self.session.connect_timeout_sec),
            liveness_timeout: Duration::from_secs(self.session.liveness_timeout_sec),
            terminate_grace: Duration::from_millis(self.session.terminate_grace_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.server.listen, "0.0.0.0:8080");
        assert_eq!(cfg.transcoder.binary, "ffmpeg");
        assert_eq!(cfg.session.default_profile, "auto");
        assert_eq!(cfg.reconnect_policy(), ReconnectPolicy::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = r#"
reconnect:
  max_attempts: 3
  min_delay_sec: 1
session:
  default_profile: "720p"
log:
  json: true
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.reconnect.max_attempts, 3);
        assert_eq!(cfg.reconnect.max_delay_sec, 30);
        assert_eq!(cfg.reconnect.timeout_sec, 90);
        assert_eq!(cfg.session.default_profile, "720p");
        assert!(cfg.log.json);
        assert_eq!(cfg.log.level, "info");

        let settings = cfg.session_settings();
        assert_eq!(settings.policy.min_delay, Duration::from_secs(1));
        assert_eq!(settings.connect_timeout, Duration::from_secs(15));
        assert_eq!(settings.terminate_grace, Duration::from_millis(5000));
    }

    #[test]
    fn rejects_inverted_delays_and_zero_attempts() {
        let mut cfg = AppConfig::default();
        cfg.reconnect.min_delay_sec = 60;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.reconnect.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_default_file_falls_back_but_explicit_file_must_exist() {
        let path = std::env::temp_dir().join("chatcast-does-not-exist.yaml");
        assert!(AppConfig::load_or_default(&path, false).is_ok());
        assert!(AppConfig::load_or_default(&path, true).is_err());
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("chatcast-cfg-{}.yaml", std::process::id()));
        std::fs::write(&path, "server:\n  listen: \"127.0.0.1:9000\"\n").unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.server.listen, "127.0.0.1:9000");
    }
}
