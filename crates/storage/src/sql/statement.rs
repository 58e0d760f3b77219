use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use jobflow_errors::{JobflowError, JobflowResult};

use super::dialect::Dialect;

/// A value bound into a prepared statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(value as i64)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<Uuid> for SqlValue {
    fn from(value: Uuid) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<Option<DateTime<Utc>>> for SqlValue {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        match value {
            Some(ts) => SqlValue::Timestamp(ts),
            None => SqlValue::Null,
        }
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Boolean(value)
    }
}

/// A statement with `:name` parameters resolved to positional values.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSql {
    pub sql: String,
    pub values: Vec<SqlValue>,
}

/// Fluent statement builder with named parameters of the form `:name`.
///
/// Named parameters are parsed into positional ones while single- and
/// double-quoted literals are left untouched. The reserved name
/// `previousVersion` binds the optimistic-concurrency predicate set via
/// [`Sql::with_previous_version`]; any other unknown name fails loudly.
#[derive(Debug, Default)]
pub struct Sql {
    params: HashMap<String, SqlValue>,
    previous_version: Option<i32>,
    suffix: &'static str,
}

impl Sql {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<SqlValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn with_previous_version(mut self, previous_version: i32) -> Self {
        self.previous_version = Some(previous_version);
        self
    }

    /// Request limit/offset paging; the dialect supplies the suffix.
    pub fn with_limit_and_offset(
        mut self,
        dialect: &dyn Dialect,
        limit: i64,
        offset: i64,
    ) -> Self {
        self.suffix = dialect.limit_and_offset();
        self.with("limit", limit).with("offset", offset)
    }

    pub fn select(&self, statement: &str) -> JobflowResult<PreparedSql> {
        self.parse(&format!("select {statement}{}", self.suffix))
    }

    pub fn select_count(&self, statement: &str) -> JobflowResult<PreparedSql> {
        self.parse(&format!("select count(*) {statement}"))
    }

    pub fn insert(&self, statement: &str) -> JobflowResult<PreparedSql> {
        self.parse(&format!("insert {statement}"))
    }

    pub fn update(&self, statement: &str) -> JobflowResult<PreparedSql> {
        self.parse(&format!("update {statement}"))
    }

    pub fn delete(&self, statement: &str) -> JobflowResult<PreparedSql> {
        self.parse(&format!("delete {statement}"))
    }

    // Character scanner rather than a regex: parameter-like strings inside
    // quoted literals must not be rewritten.
    fn parse(&self, query: &str) -> JobflowResult<PreparedSql> {
        let chars: Vec<char> = query.chars().collect();
        let mut parsed = String::with_capacity(query.len());
        let mut values = Vec::new();
        let mut in_single_quote = false;
        let mut in_double_quote = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if in_single_quote {
                if c == '\'' {
                    in_single_quote = false;
                }
            } else if in_double_quote {
                if c == '"' {
                    in_double_quote = false;
                }
            } else if c == '\'' {
                in_single_quote = true;
            } else if c == '"' {
                in_double_quote = true;
            } else if c == ':'
                && i + 1 < chars.len()
                && is_identifier_start(chars[i + 1])
                && !parsed.ends_with(':')
            {
                let mut j = i + 1;
                while j < chars.len() && is_identifier_part(chars[j]) {
                    j += 1;
                }
                let name: String = chars[i + 1..j].iter().collect();
                values.push(self.resolve(&name)?);
                parsed.push('?');
                i = j;
                continue;
            }
            parsed.push(c);
            i += 1;
        }

        Ok(PreparedSql {
            sql: parsed,
            values,
        })
    }

    fn resolve(&self, name: &str) -> JobflowResult<SqlValue> {
        if let Some(value) = self.params.get(name) {
            return Ok(value.clone());
        }
        if name == "previousVersion" {
            if let Some(previous_version) = self.previous_version {
                return Ok(SqlValue::Integer(previous_version as i64));
            }
        }
        Err(JobflowError::storage_error(format!(
            "parameter {name} is not known"
        )))
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_identifier_part(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
