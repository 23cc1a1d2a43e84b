//! 通话平台协作方边界
//!
//! 平台鉴权和加入通话的协议不在本 crate 范围内，这里只定义会话需要的能力：
//! 加入 / 离开通话、订阅通话事件、把转码输出推给发布端。

use crate::error::JoinError;
use crate::source::ChatTarget;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// 通话事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// 已成功加入通话
    Joined,
    /// 通话或连接掉线
    Dropped(String),
    /// 平台侧错误
    Error(String),
}

/// 一次加入通话得到的句柄，由会话独占
pub struct CallHandle {
    pub chat: ChatTarget,
    /// 平台推送的事件流
    pub events: mpsc::Receiver<CallEvent>,
    /// 发布端：转码输出写到这里
    pub media: mpsc::Sender<Bytes>,
}

#[async_trait]
pub trait CallPlatform: Send + Sync + 'static {
    async fn join_call(&self, chat: &ChatTarget) -> Result<CallHandle, JoinError>;

    async fn leave_call(&self, handle: CallHandle);

    /// 平台客户端是否已连接 (用于健康检查)
    fn is_connected(&self) -> bool {
        true
    }
}

/// 本地回环平台：立即接受通话并丢弃媒体数据，只统计字节数。
/// 没有接入真实平台桥接时用于试运行。
#[derive(Default)]
pub struct LoopbackPlatform {
    bytes_received: Arc<AtomicU64>,
}

impl LoopbackPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CallPlatform for LoopbackPlatform {
    async fn join_call(&self, chat: &ChatTarget) -> Result<CallHandle, JoinError> {
        let (event_tx, events) = mpsc::channel(8);
        let (media, mut media_rx) = mpsc::channel::<Bytes>(64);
        let _ = event_tx.try_send(CallEvent::Joined);

        let counter = self.bytes_received.clone();
        let chat_name = chat.to_string();
        tokio::spawn(async move {
            while let Some(chunk) = media_rx.recv().await {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            // 事件发送端随任务一起释放
            drop(event_tx);
            debug!(chat = %chat_name, "Loopback media sink closed");
        });

        info!(chat = %chat, "Loopback call joined");
        let handle = CallHandle {
            chat: chat.clone(),
            events,
            media,
        };
        Ok(handle)
    }

    async fn leave_call(&self, handle: CallHandle) {
        info!(chat = %handle.chat, "Loopback call left");
    }
}
