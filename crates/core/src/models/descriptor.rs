use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use jobflow_errors::JobflowResult;

/// JobContext参数槽的类型名，运行时注入而非反序列化
pub const JOB_CONTEXT_PARAMETER: &str = "jobflow::JobContext";

/// 序列化后的调用参数，类型名加上对象映射器产出的值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub type_name: String,
    pub value: serde_json::Value,
}

impl JobParameter {
    pub fn new<T: Serialize>(type_name: impl Into<String>, value: &T) -> JobflowResult<Self> {
        Ok(Self {
            type_name: type_name.into(),
            value: serde_json::to_value(value)?,
        })
    }

    pub fn job_context() -> Self {
        Self {
            type_name: JOB_CONTEXT_PARAMETER.to_string(),
            value: serde_json::Value::Null,
        }
    }

    pub fn is_job_context(&self) -> bool {
        self.type_name == JOB_CONTEXT_PARAMETER
    }

    pub fn deserialize_as<T: DeserializeOwned>(&self) -> JobflowResult<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// 可序列化的调用引用：目标类型全限定名、方法名与有序参数
///
/// 等价性是纯结构性的，同一调用入队两次会得到两个不同id的任务。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub class_name: String,
    pub method_name: String,
    pub parameter_types: Vec<String>,
    pub parameters: Vec<JobParameter>,
}

impl JobDescriptor {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            parameter_types: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// 追加一个参数，参数类型名与参数值保持同序
    pub fn with_parameter<T: Serialize>(
        mut self,
        type_name: impl Into<String>,
        value: &T,
    ) -> JobflowResult<Self> {
        let parameter = JobParameter::new(type_name, value)?;
        self.parameter_types.push(parameter.type_name.clone());
        self.parameters.push(parameter);
        Ok(self)
    }

    /// 追加JobContext参数槽
    pub fn with_job_context(mut self) -> Self {
        let parameter = JobParameter::job_context();
        self.parameter_types.push(parameter.type_name.clone());
        self.parameters.push(parameter);
        self
    }

    /// 日志与监控用的可读名称
    pub fn readable_name(&self) -> String {
        format!(
            "{}.{}({})",
            self.class_name,
            self.method_name,
            self.parameter_types.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;
    use uuid::Uuid;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Work {
        count: i32,
        label: String,
        uuid: Uuid,
    }

    #[test]
    fn test_descriptor_equality_is_structural() {
        let a = JobDescriptor::new("com.example.TestService", "do_work")
            .with_parameter("i32", &5)
            .unwrap();
        let b = JobDescriptor::new("com.example.TestService", "do_work")
            .with_parameter("i32", &5)
            .unwrap();
        let c = JobDescriptor::new("com.example.TestService", "do_work")
            .with_parameter("i32", &6)
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_temporal_parameter_round_trip() {
        let now: DateTime<Utc> = Utc::now();
        let descriptor = JobDescriptor::new("com.example.TestService", "do_work_at")
            .with_parameter("chrono::DateTime<Utc>", &now)
            .unwrap();

        let restored: DateTime<Utc> = descriptor.parameters[0].deserialize_as().unwrap();
        assert_eq!(restored, now);
    }

    #[test]
    fn test_identifier_and_path_parameters_round_trip() {
        let uuid = Uuid::new_v4();
        let path = PathBuf::from("/tmp/jobflow/example.log");
        let descriptor = JobDescriptor::new("com.example.TestService", "do_work_with_path")
            .with_parameter("uuid::Uuid", &uuid)
            .unwrap()
            .with_parameter("std::path::PathBuf", &path)
            .unwrap();

        let restored_uuid: Uuid = descriptor.parameters[0].deserialize_as().unwrap();
        let restored_path: PathBuf = descriptor.parameters[1].deserialize_as().unwrap();
        assert_eq!(restored_uuid, uuid);
        assert_eq!(restored_path, path);
    }

    #[test]
    fn test_user_value_object_round_trip() {
        let work = Work {
            count: 2,
            label: "some string".to_string(),
            uuid: Uuid::new_v4(),
        };
        let descriptor = JobDescriptor::new("com.example.TestService", "do_work")
            .with_parameter("com.example.Work", &work)
            .unwrap();

        let serialized = serde_json::to_string(&descriptor).unwrap();
        let deserialized: JobDescriptor = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, descriptor);

        let restored: Work = deserialized.parameters[0].deserialize_as().unwrap();
        assert_eq!(restored, work);
    }

    #[test]
    fn test_job_context_slot_is_recognized() {
        let descriptor = JobDescriptor::new("com.example.TestService", "do_work")
            .with_parameter("i32", &5)
            .unwrap()
            .with_job_context();

        assert!(!descriptor.parameters[0].is_job_context());
        assert!(descriptor.parameters[1].is_job_context());
        assert_eq!(descriptor.parameter_types[1], JOB_CONTEXT_PARAMETER);
    }
}
