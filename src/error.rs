//! 错误类型定义
//!
//! 瞬时故障 (进程崩溃、通话掉线) 在会话状态机内部消化，不会出现在这里；
//! 这里只列出需要返回给调用方的错误。

use thiserror::Error;

/// 创建会话时的同步校验错误，出现时会话不会被注册
#[derive(Debug, Error)]
pub enum CreationError {
    /// 目标聊天格式不合法
    #[error("Invalid chat target: {0}")]
    InvalidChat(String),

    /// 源地址格式不合法
    #[error("Invalid source URI: {0}")]
    InvalidSource(String),

    /// 源解析失败 (YouTube)
    #[error("Source resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    /// 该聊天已有未结束的会话
    #[error("Chat {0} already has an active stream")]
    ChatBusy(String),
}

impl CreationError {
    /// 错误种类名，用于 API 响应和指标标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidChat(_) => "InvalidChat",
            Self::InvalidSource(_) => "InvalidSource",
            Self::Resolution(_) => "ResolutionFailed",
            Self::ChatBusy(_) => "ChatBusy",
        }
    }
}

/// 会话 ID 不存在
#[derive(Debug, Error)]
#[error("Stream not found: {0}")]
pub struct NotFoundError(pub String);

/// ProcessSupervisor 错误
#[derive(Debug, Error)]
pub enum ProcessError {
    /// 上一个进程句柄尚未终止
    #[error("A transcoder process is already live for this session (pid {0:?})")]
    AlreadyRunning(Option<u32>),

    /// 子进程启动失败
    #[error("Failed to spawn transcoder: {0}")]
    Spawn(#[from] std::io::Error),
}

/// 加入通话失败
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Permission denied joining call in {0}")]
    PermissionDenied(String),

    #[error("Join failed: {0}")]
    Failed(String),
}

/// 源解析器错误
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("resolver exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("resolver returned no playable URL")]
    Empty,

    #[error("resolver timed out after {0}s")]
    Timeout(u64),

    #[error("resolver could not be started: {0}")]
    Io(#[from] std::io::Error),
}
