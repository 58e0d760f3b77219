use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use ring::digest;
use serde::{Deserialize, Serialize};

use jobflow_errors::{JobflowError, JobflowResult};

use super::descriptor::JobDescriptor;
use crate::cron::CronExpression;

/// 周期任务定义，由CRON表达式驱动物化出具体的SCHEDULED任务
///
/// id由用户提供，重复注册相同id会覆盖旧定义。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJob {
    pub id: String,
    pub descriptor: JobDescriptor,
    pub cron_expression: String,
    pub zone_id: String,
    pub created_at: DateTime<Utc>,
}

impl RecurringJob {
    /// 创建定义，CRON表达式与时区在注册时严格校验
    pub fn new(
        id: Option<String>,
        descriptor: JobDescriptor,
        cron_expression: &str,
        zone_id: &str,
    ) -> JobflowResult<Self> {
        CronExpression::parse(cron_expression)?;
        parse_zone(zone_id)?;
        let id = id.unwrap_or_else(|| Self::default_id(&descriptor, cron_expression));
        Ok(Self {
            id,
            descriptor,
            cron_expression: cron_expression.to_string(),
            zone_id: zone_id.to_string(),
            created_at: Utc::now(),
        })
    }

    /// 默认id：描述符与CRON表达式的稳定摘要，跨进程一致
    pub fn default_id(descriptor: &JobDescriptor, cron_expression: &str) -> String {
        let mut input = Vec::new();
        input.extend_from_slice(descriptor.class_name.as_bytes());
        input.push(0);
        input.extend_from_slice(descriptor.method_name.as_bytes());
        input.push(0);
        for parameter in &descriptor.parameters {
            input.extend_from_slice(parameter.type_name.as_bytes());
            input.push(0);
            input.extend_from_slice(parameter.value.to_string().as_bytes());
            input.push(0);
        }
        input.extend_from_slice(cron_expression.as_bytes());

        let hash = digest::digest(&digest::SHA256, &input);
        URL_SAFE_NO_PAD.encode(&hash.as_ref()[..16])
    }

    /// 在定义的时区内求下一次触发时刻，结果归一化为UTC
    pub fn next_run(&self, after: DateTime<Utc>) -> JobflowResult<Option<DateTime<Utc>>> {
        let zone = parse_zone(&self.zone_id)?;
        let cron = CronExpression::parse(&self.cron_expression)?;
        Ok(cron.next_in_zone(after, zone))
    }
}

fn parse_zone(zone_id: &str) -> JobflowResult<Tz> {
    zone_id
        .parse::<Tz>()
        .map_err(|_| JobflowError::InvalidTimeZone {
            zone: zone_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::Cron;

    fn a_descriptor() -> JobDescriptor {
        JobDescriptor::new("com.example.TestService", "do_work")
    }

    #[test]
    fn test_default_id_is_stable() {
        let a = RecurringJob::default_id(&a_descriptor(), &Cron::minutely());
        let b = RecurringJob::default_id(&a_descriptor(), &Cron::minutely());
        assert_eq!(a, b);

        let c = RecurringJob::default_id(&a_descriptor(), &Cron::hourly());
        assert_ne!(a, c);
    }

    #[test]
    fn test_new_rejects_invalid_cron() {
        let err = RecurringJob::new(None, a_descriptor(), "not a cron", "UTC")
            .expect_err("must reject");
        assert!(matches!(err, JobflowError::InvalidCron { .. }));
    }

    #[test]
    fn test_new_rejects_unknown_zone() {
        let err = RecurringJob::new(None, a_descriptor(), &Cron::minutely(), "Mars/Olympus")
            .expect_err("must reject");
        assert!(matches!(err, JobflowError::InvalidTimeZone { .. }));
    }

    #[test]
    fn test_next_run_is_in_the_future_and_utc() {
        let recurring =
            RecurringJob::new(None, a_descriptor(), &Cron::minutely(), "Europe/Brussels").unwrap();
        let now = Utc::now();
        let next = recurring.next_run(now).unwrap().unwrap();
        assert!(next > now);
        assert!(next <= now + chrono::Duration::seconds(61));
    }
}
