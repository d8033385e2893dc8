use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use taskq_core::{Result, SchedulerError};

/// CRON表达式解析和调度工具
///
/// 支持 6/7 段（含秒）表达式；经典的 5 段表达式会补上秒字段 `0`。
/// 所有时间按 UTC 计算。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> Result<Self> {
        let expression = Self::normalize(cron_expr)?;
        let schedule = Schedule::from_str(&expression).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression,
            schedule,
        })
    }

    fn normalize(cron_expr: &str) -> Result<String> {
        let fields: Vec<&str> = cron_expr.split_whitespace().collect();
        match fields.len() {
            5 => Ok(format!("0 {}", fields.join(" "))),
            6 | 7 => Ok(fields.join(" ")),
            n => Err(SchedulerError::InvalidCron {
                expr: cron_expr.to_string(),
                message: format!("需要5到7个字段，实际为{n}个"),
            }),
        }
    }

    /// 规范化后的表达式
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 获取严格晚于 `from` 的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_expression_gets_seconds() {
        let scheduler = CronScheduler::new("30 2 * * *").unwrap();
        assert_eq!(scheduler.expression(), "0 30 2 * * *");

        let from = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = scheduler.next_execution_time(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 2, 30, 0).unwrap());
    }

    #[test]
    fn test_next_time_is_strictly_after() {
        let scheduler = CronScheduler::new("0 0 9 * * *").unwrap();
        let exactly_nine = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let next = scheduler.next_execution_time(exactly_nine).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in ["", "invalid", "* *", "0 0 0 32 * *", "1 2 3 4 5 6 7 8"] {
            let err = CronScheduler::new(expr).unwrap_err();
            assert!(matches!(err, SchedulerError::InvalidCron { .. }), "{expr}");
        }
        assert!(CronScheduler::new("0 */5 * * * *").is_ok());
        assert!(CronScheduler::new("0 0 9-17 * * Mon-Fri").is_ok());
    }
}
