use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use jobflow_errors::{JobflowError, JobflowResult};

/// 秒级精度的CRON表达式，注册时严格解析
#[derive(Debug, Clone)]
pub struct CronExpression {
    expression: String,
    schedule: Schedule,
}

impl CronExpression {
    /// 解析6字段(秒级)CRON表达式，非法表达式立即报错
    pub fn parse(expression: &str) -> JobflowResult<Self> {
        let schedule =
            Schedule::from_str(expression).map_err(|e| JobflowError::InvalidCron {
                expr: expression.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 在给定时区内计算after之后的下一次触发时刻，归一化为UTC
    pub fn next_in_zone(&self, after: DateTime<Utc>, zone: Tz) -> Option<DateTime<Utc>> {
        let zoned = after.with_timezone(&zone);
        self.schedule
            .after(&zoned)
            .next()
            .map(|next| next.with_timezone(&Utc))
    }

    /// after之后的若干次触发时刻
    pub fn upcoming(&self, after: DateTime<Utc>, zone: Tz, count: usize) -> Vec<DateTime<Utc>> {
        let zoned = after.with_timezone(&zone);
        self.schedule
            .after(&zoned)
            .take(count)
            .map(|next| next.with_timezone(&Utc))
            .collect()
    }
}

/// 常用CRON表达式的便捷构造
pub struct Cron;

impl Cron {
    /// 每分钟第0秒
    pub fn minutely() -> String {
        "0 * * * * *".to_string()
    }

    /// 每小时整点
    pub fn hourly() -> String {
        "0 0 * * * *".to_string()
    }

    /// 每天零点
    pub fn daily() -> String {
        "0 0 0 * * *".to_string()
    }

    /// 每天指定时刻
    pub fn daily_at(hour: u8, minute: u8) -> String {
        format!("0 {minute} {hour} * * *")
    }

    /// 每周一零点
    pub fn weekly() -> String {
        "0 0 0 * * Mon".to_string()
    }

    /// 每月一号零点
    pub fn monthly() -> String {
        "0 0 0 1 * *".to_string()
    }

    /// 每年一月一号零点
    pub fn yearly() -> String {
        "0 0 0 1 1 *".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_convenience_expressions_parse() {
        for expr in [
            Cron::minutely(),
            Cron::hourly(),
            Cron::daily(),
            Cron::daily_at(8, 30),
            Cron::weekly(),
            Cron::monthly(),
            Cron::yearly(),
        ] {
            assert!(CronExpression::parse(&expr).is_ok(), "failed: {expr}");
        }
    }

    #[test]
    fn test_parse_rejects_malformed_expressions() {
        for expr in ["", "* * *", "61 * * * * *", "0 * * * * FOO"] {
            let err = CronExpression::parse(expr).expect_err("must reject");
            assert!(matches!(err, JobflowError::InvalidCron { .. }), "{expr}");
        }
    }

    #[test]
    fn test_minutely_fires_on_the_minute() {
        let cron = CronExpression::parse(&Cron::minutely()).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 15).unwrap();
        let next = cron.next_in_zone(after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 10, 31, 0).unwrap());
    }

    #[test]
    fn test_daily_at_respects_the_zone() {
        let cron = CronExpression::parse(&Cron::daily_at(8, 0)).unwrap();
        let zone: Tz = "Europe/Brussels".parse().unwrap();
        // 夏令时期间布鲁塞尔为UTC+2
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let next = cron.next_in_zone(after, zone).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_upcoming_is_strictly_increasing() {
        let cron = CronExpression::parse(&Cron::minutely()).unwrap();
        let times = cron.upcoming(Utc::now(), chrono_tz::UTC, 3);
        assert_eq!(times.len(), 3);
        assert!(times[0] < times[1] && times[1] < times[2]);
        assert_eq!(times[1] - times[0], Duration::seconds(60));
    }
}
