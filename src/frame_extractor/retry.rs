use log::{debug, warn};
use std::fmt::Display;
use std::time::Duration;

/// 错误是否值得重试
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// 统一的重试策略：最大尝试次数 + 指数退避
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 包含首次尝试
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            multiplier: 2,
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// 不退避，测试用
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            multiplier: 1,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn no_retry() -> Self {
        Self::immediate(1)
    }

    /// 第 `attempt` 次失败（从 1 开始）之后的等待时间
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn should_retry<E: Retryable>(&self, error: &E, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts.max(1)
    }

    /// 执行 `op`，可重试错误按策略退避重来；不可重试错误立即返回
    pub fn run<T, E, F>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("🔁 {} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        "⚠️ {} failed (attempt {}/{}): {}, retrying in {:?}",
                        label, attempt, self.max_attempts, e, delay
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
