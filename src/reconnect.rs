//! 重连策略 (纯计算，无 I/O)

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// 故障重试策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// 初始退避时间
    pub min_delay: Duration,
    /// 最大退避时间
    pub max_delay: Duration,
    /// 最大重试次数
    pub max_attempts: u32,
    /// 从首次断线起算的总重连时间预算
    pub timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            timeout: Duration::from_secs(90),
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次重试前的等待时间 (attempt 从 1 开始)：
    /// `min(max_delay, min_delay * 2^(attempt-1))`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        2u32.checked_pow(exp)
            .and_then(|m| self.min_delay.checked_mul(m))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn next_delay(&self, state: &ReconnectState) -> Duration {
        self.delay_for_attempt(state.attempt)
    }

    /// 次数或时间预算任一耗尽即视为放弃
    pub fn is_exhausted(&self, state: &ReconnectState, now: Instant) -> bool {
        state.attempt >= self.max_attempts || state.elapsed(now) >= self.timeout
    }
}

/// 每个会话自己持有的可变重连状态
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// 当前重试次数
    pub attempt: u32,
    /// 自上次进入 Streaming 后的首次断线时间
    pub first_disconnect_at: Option<Instant>,
    /// 下一次重试前的等待时间
    pub next_delay: Option<Duration>,
}

impl ReconnectState {
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.first_disconnect_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    /// 记录一次断线：计数加一，必要时启动计时，并计算下一次等待时间
    pub fn record_disconnect(&mut self, policy: &ReconnectPolicy, now: Instant) -> Duration {
        self.attempt += 1;
        self.first_disconnect_at.get_or_insert(now);
        let delay = policy.next_delay(self);
        self.next_delay = Some(delay);
        delay
    }

    /// 回到稳定的 Streaming 状态时清零
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> ReconnectSnapshot {
        ReconnectSnapshot {
            attempt: self.attempt,
            next_delay_secs: self.next_delay.map(|d| d.as_secs_f64()),
        }
    }
}

/// 对外展示用的重连状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReconnectSnapshot {
    pub attempt: u32,
    pub next_delay_secs: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min: u64, max: u64, attempts: u32, timeout: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            min_delay: Duration::from_secs(min),
            max_delay: Duration::from_secs(max),
            max_attempts: attempts,
            timeout: Duration::from_secs(timeout),
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy(5, 30, 10, 90);
        let delays: Vec<u64> = (1..=10).map(|a| p.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30, 30, 30, 30, 30, 30]);
    }

    #[test]
    fn backoff_does_not_overflow_on_huge_attempts() {
        let p = policy(5, 30, 10, 90);
        assert_eq!(p.delay_for_attempt(200), Duration::from_secs(30));
        assert_eq!(p.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn record_disconnect_tracks_attempt_and_delay() {
        let p = policy(5, 30, 10, 90);
        let mut s = ReconnectState::default();
        let now = Instant::now();

        assert_eq!(s.record_disconnect(&p, now), Duration::from_secs(5));
        assert_eq!(s.attempt, 1);
        assert_eq!(s.first_disconnect_at, Some(now));

        let later = now + Duration::from_secs(7);
        assert_eq!(s.record_disconnect(&p, later), Duration::from_secs(10));
        assert_eq!(s.attempt, 2);
        // 计时从首次断线开始，不随后续断线重置
        assert_eq!(s.first_disconnect_at, Some(now));
        assert_eq!(s.elapsed(later), Duration::from_secs(7));

        s.reset();
        assert_eq!(s.attempt, 0);
        assert!(s.first_disconnect_at.is_none());
        assert!(s.next_delay.is_none());
    }

    #[test]
    fn exhaustion_by_attempt_count() {
        let p = policy(5, 30, 3, 90);
        let now = Instant::now();
        let mut s = ReconnectState::default();
        for _ in 0..2 {
            s.record_disconnect(&p, now);
        }
        assert!(!p.is_exhausted(&s, now));
        s.record_disconnect(&p, now);
        assert!(p.is_exhausted(&s, now));
    }

    #[test]
    fn exhaustion_by_timeout() {
        let p = policy(5, 30, 10, 90);
        let now = Instant::now();
        let mut s = ReconnectState::default();
        s.record_disconnect(&p, now);
        assert!(!p.is_exhausted(&s, now + Duration::from_secs(89)));
        assert!(p.is_exhausted(&s, now + Duration::from_secs(90)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_runs_on_the_runtime_clock() {
        let p = policy(5, 30, 10, 90);
        let mut s = ReconnectState::default();
        s.record_disconnect(&p, Instant::now());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(s.elapsed(Instant::now()), Duration::from_secs(60));
        assert!(!p.is_exhausted(&s, Instant::now()));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(p.is_exhausted(&s, Instant::now()));
    }

    #[test]
    fn fresh_state_is_not_exhausted() {
        let p = ReconnectPolicy::default();
        assert!(!p.is_exhausted(&ReconnectState::default(), Instant::now()));
    }
}
