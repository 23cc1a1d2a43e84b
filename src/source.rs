//! 源地址分类、目标聊天校验以及 YouTube 源解析

use crate::error::{CreationError, ResolveError};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Hls,
    Rtmp,
    Youtube,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hls => "hls",
            Self::Rtmp => "rtmp",
            Self::Youtube => "youtube",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调用方提供的源，创建时分类一次，此后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub uri: String,
}

impl SourceDescriptor {
    /// 按协议和主机名分类
    ///
    /// - `youtube.com` / `youtu.be` => youtube
    /// - `rtmp://` / `rtmps://` => rtmp
    /// - 其余 http(s) 地址 (含 .m3u8 / .m3u / `/hls/`) => hls
    pub fn classify(raw: &str) -> Result<Self, CreationError> {
        let raw = raw.trim();
        let url = Url::parse(raw)
            .map_err(|e| CreationError::InvalidSource(format!("{}: {}", raw, e)))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| CreationError::InvalidSource(format!("{}: missing host", raw)))?
            .to_ascii_lowercase();

        let kind = match url.scheme() {
            "rtmp" | "rtmps" => SourceKind::Rtmp,
            "http" | "https" if is_youtube_host(&host) => SourceKind::Youtube,
            "http" | "https" => SourceKind::Hls,
            other => {
                return Err(CreationError::InvalidSource(format!(
                    "{}: unsupported scheme '{}'",
                    raw, other
                )))
            }
        };

        Ok(Self {
            kind,
            uri: raw.to_string(),
        })
    }

    pub fn needs_resolution(&self) -> bool {
        self.kind == SourceKind::Youtube
    }
}

fn is_youtube_host(host: &str) -> bool {
    host == "youtu.be"
        || host == "youtube.com"
        || host.ends_with(".youtube.com")
}

/// 目标聊天：数字 ID、`@username` 或 t.me 链接
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ChatTarget(String);

impl ChatTarget {
    pub fn parse(raw: &str) -> Result<Self, CreationError> {
        let raw = raw.trim();
        let invalid = || CreationError::InvalidChat(raw.to_string());

        if raw.is_empty() {
            return Err(invalid());
        }

        if raw.parse::<i64>().is_ok() {
            return Ok(Self(raw.to_string()));
        }

        if let Some(name) = raw.strip_prefix('@') {
            let valid = (5..=32).contains(&name.len())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            return if valid { Ok(Self(raw.to_string())) } else { Err(invalid()) };
        }

        // 邀请链接 / 公开链接
        let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            format!("https://{}", raw)
        };
        match Url::parse(&with_scheme) {
            Ok(url)
                if matches!(url.host_str(), Some("t.me") | Some("telegram.me"))
                    && url.path().len() > 1 =>
            {
                Ok(Self(raw.to_string()))
            }
            _ => Err(invalid()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 源解析协作方：把观看页地址解析为可直接播放的地址
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, watch_uri: &str) -> Result<String, ResolveError>;
}

/// 基于 yt-dlp 的解析器
pub struct YtDlpResolver {
    binary: String,
    timeout: Duration,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SourceResolver for YtDlpResolver {
    async fn resolve(&self, watch_uri: &str) -> Result<String, ResolveError> {
        info!(url = %watch_uri, "Resolving YouTube source");

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--get-url")
            .arg("-f")
            .arg("best[ext=mp4]/best")
            .arg("--no-playlist")
            .arg(watch_uri)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ResolveError::Timeout(self.timeout.as_secs()))??;

        if !output.status.success() {
            return Err(ResolveError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let playable = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or(ResolveError::Empty)?;

        debug!(url = %watch_uri, "Resolved to playable URL");
        Ok(playable.to_string())
    }
}

/// 把描述符变成可交给转码器的地址；只有 youtube 需要解析
pub async fn playable_uri(
    source: &SourceDescriptor,
    resolver: &dyn SourceResolver,
) -> Result<String, CreationError> {
    if source.needs_resolution() {
        Ok(resolver.resolve(&source.uri).await?)
    } else {
        Ok(source.uri.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_scheme_and_host() {
        let cases = [
            ("https://cdn.example.com/live/index.m3u8", SourceKind::Hls),
            ("http://example.com/hls/stream", SourceKind::Hls),
            ("https://example.com/list.m3u", SourceKind::Hls),
            ("rtmp://ingest.example.com/live/key", SourceKind::Rtmp),
            ("rtmps://ingest.example.com/live/key", SourceKind::Rtmp),
            ("https://www.youtube.com/watch?v=abc", SourceKind::Youtube),
            ("https://youtu.be/abc", SourceKind::Youtube),
            ("https://m.youtube.com/live/abc", SourceKind::Youtube),
        ];
        for (uri, kind) in cases {
            assert_eq!(SourceDescriptor::classify(uri).unwrap().kind, kind, "{}", uri);
        }
    }

    #[test]
    fn rejects_malformed_sources() {
        for uri in ["", "not a url", "ftp://example.com/x", "file:///tmp/a.ts"] {
            assert!(
                matches!(
                    SourceDescriptor::classify(uri),
                    Err(CreationError::InvalidSource(_))
                ),
                "{}",
                uri
            );
        }
    }

    #[test]
    fn lookalike_hosts_are_not_youtube() {
        let d = SourceDescriptor::classify("https://notyoutube.com/watch?v=1").unwrap();
        assert_eq!(d.kind, SourceKind::Hls);
    }

    #[test]
    fn chat_target_forms() {
        let valid = [
            "-1001234567890",
            "42",
            "@my_channel",
            "t.me/+AbCdEf",
            "https://t.me/joinchat/xyz",
        ];
        for ok in valid {
            assert!(ChatTarget::parse(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "@abc", "@has space", "https://example.com/x", "t.me/"] {
            assert!(ChatTarget::parse(bad).is_err(), "{}", bad);
        }
    }

    struct FixedResolver(Result<&'static str, ()>);

    #[async_trait]
    impl SourceResolver for FixedResolver {
        async fn resolve(&self, _watch_uri: &str) -> Result<String, ResolveError> {
            self.0.map(str::to_string).map_err(|_| ResolveError::Empty)
        }
    }

    #[tokio::test]
    async fn only_youtube_goes_through_resolver() {
        let hls = SourceDescriptor::classify("https://a.example/x.m3u8").unwrap();
        let failing = FixedResolver(Err(()));
        assert_eq!(playable_uri(&hls, &failing).await.unwrap(), hls.uri);

        let yt = SourceDescriptor::classify("https://youtu.be/abc").unwrap();
        let ok = FixedResolver(Ok("https://googlevideo.example/play"));
        assert_eq!(
            playable_uri(&yt, &ok).await.unwrap(),
            "https://googlevideo.example/play"
        );
        assert!(matches!(
            playable_uri(&yt, &failing).await,
            Err(CreationError::Resolution(_))
        ));
    }
}
