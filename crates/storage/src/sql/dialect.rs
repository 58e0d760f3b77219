/// SQL dialect hook: only paging differs between the supported engines.
pub trait Dialect: Send + Sync {
    /// Suffix appended to a select when limit/offset paging is requested.
    /// The suffix uses the reserved `:limit` and `:offset` parameter names.
    fn limit_and_offset(&self) -> &'static str;
}

pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn limit_and_offset(&self) -> &'static str {
        " LIMIT :limit OFFSET :offset"
    }
}

pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn limit_and_offset(&self) -> &'static str {
        " OFFSET :offset ROWS FETCH NEXT :limit ROWS ONLY"
    }
}
