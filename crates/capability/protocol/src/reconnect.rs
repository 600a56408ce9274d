//! 断线重连退避

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// 退避策略：delay = min(max_delay, base * 2^attempt)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_delay: Duration) -> Self {
        Self {
            max_delay,
            ..Self::default()
        }
    }

    /// `attempt` 为本次重试前的连续失败次数
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// 单设备的连续失败计数（不设上限，连接成功后归零）
#[derive(Debug, Default)]
pub struct ReconnectState {
    attempts: AtomicU32,
}

impl ReconnectState {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 记录一次失败，返回记录前的计数
    pub fn record_failure(&self) -> u32 {
        self.attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)))
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_monotonic_and_capped() {
        let policy = ReconnectPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..80 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous, "attempt {attempt}");
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
    }

    #[test]
    fn state_resets_to_base_delay() {
        let policy = ReconnectPolicy::default();
        let state = ReconnectState::default();
        assert_eq!(state.record_failure(), 0);
        assert_eq!(state.record_failure(), 1);
        assert_eq!(policy.delay_for(state.attempts()), Duration::from_secs(4));
        state.reset();
        assert_eq!(policy.delay_for(state.attempts()), Duration::from_secs(1));
    }
}
