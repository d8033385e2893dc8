//! 重试退避策略计算
//!
//! 纯函数：给定重试次数与策略，计算下一次可见前需要等待的时长。
//! 不涉及任何 I/O 或共享状态。

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 退避策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// 固定间隔
    Fixed { delay_ms: u64 },
    /// 线性增长: initial + attempt * step，不超过 max
    Linear {
        initial_ms: u64,
        step_ms: u64,
        max_delay_ms: u64,
    },
    /// 指数增长: initial * factor^(attempt-1)，不超过 max
    Exponential {
        initial_ms: u64,
        factor: f64,
        max_delay_ms: u64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            initial_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffStrategy {
    /// 计算第 `attempt` 次重试前的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffStrategy::Linear {
                initial_ms,
                step_ms,
                max_delay_ms,
            } => {
                let grown = step_ms
                    .saturating_mul(attempt as u64)
                    .saturating_add(*initial_ms);
                Duration::from_millis(grown.min(*max_delay_ms))
            }
            BackoffStrategy::Exponential {
                initial_ms,
                factor,
                max_delay_ms,
            } => {
                let exponent = attempt.max(1) - 1;
                let raw = *initial_ms as f64 * factor.powi(exponent.min(i32::MAX as u32) as i32);
                let capped = if raw.is_finite() {
                    raw.min(*max_delay_ms as f64).max(0.0)
                } else {
                    *max_delay_ms as f64
                };
                Duration::from_millis(capped as u64)
            }
        }
    }

    /// 策略允许的最大延迟
    pub fn max_delay(&self) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffStrategy::Linear { max_delay_ms, .. }
            | BackoffStrategy::Exponential { max_delay_ms, .. } => {
                Duration::from_millis(*max_delay_ms)
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            BackoffStrategy::Fixed { .. } => Ok(()),
            BackoffStrategy::Linear {
                initial_ms,
                max_delay_ms,
                ..
            } => {
                if initial_ms > max_delay_ms {
                    return Err("线性退避的初始延迟不能大于最大延迟".to_string());
                }
                Ok(())
            }
            BackoffStrategy::Exponential {
                initial_ms,
                factor,
                max_delay_ms,
            } => {
                if !factor.is_finite() || *factor < 1.0 {
                    return Err(format!("指数退避倍数必须不小于1.0，当前值: {factor}"));
                }
                if initial_ms > max_delay_ms {
                    return Err("指数退避的初始延迟不能大于最大延迟".to_string());
                }
                Ok(())
            }
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(flatten)]
    pub backoff: BackoffStrategy,
    /// 随机抖动比例 (0.0 - 1.0)，只会向下抖动
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffStrategy::default(),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff: BackoffStrategy) -> Self {
        Self {
            backoff,
            jitter_factor: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// 不带抖动的确定性延迟
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// 带抖动的延迟，结果落在 `[d * (1 - jitter), d]` 区间
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let jitter = self.jitter_factor.min(1.0) * rand::random::<f64>();
        base.mul_f64(1.0 - jitter)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "抖动比例必须在0.0到1.0之间，当前值: {}",
                self.jitter_factor
            ));
        }
        self.backoff.validate()
    }
}
