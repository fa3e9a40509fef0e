// restoretool/src/restore/column_types.rs
use std::collections::HashMap;

use tracing::warn;

use super::session::SqlSession;
use crate::errors::DbFailure;

/// Scalar SQL types the encoder distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    Text,
    SmallInt,
    Integer,
    BigInt,
    Numeric,
    Real,
    DoublePrecision,
    Boolean,
    Uuid,
    Json,
    Jsonb,
    Date,
    Timestamp,
    TimestampTz,
    Bytea,
    Other(String),
}

impl SqlType {
    /// Maps an `information_schema.columns.data_type` value.
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "character varying" | "varchar" | "character" | "char" | "bpchar" => {
                SqlType::Text
            }
            "smallint" => SqlType::SmallInt,
            "integer" => SqlType::Integer,
            "bigint" => SqlType::BigInt,
            "numeric" | "decimal" => SqlType::Numeric,
            "real" => SqlType::Real,
            "double precision" => SqlType::DoublePrecision,
            "boolean" => SqlType::Boolean,
            "uuid" => SqlType::Uuid,
            "json" => SqlType::Json,
            "jsonb" => SqlType::Jsonb,
            "date" => SqlType::Date,
            "timestamp without time zone" | "timestamp" => SqlType::Timestamp,
            "timestamp with time zone" | "timestamptz" => SqlType::TimestampTz,
            "bytea" => SqlType::Bytea,
            other => SqlType::Other(other.to_string()),
        }
    }

    /// Element type of an array column from its `udt_name` (`_int4` and so on).
    /// Unknown element types fall back to text.
    pub fn from_array_udt(udt_name: &str) -> Self {
        match udt_name.trim_start_matches('_') {
            "text" | "varchar" | "bpchar" => SqlType::Text,
            "int2" => SqlType::SmallInt,
            "int4" => SqlType::Integer,
            "int8" => SqlType::BigInt,
            "bool" => SqlType::Boolean,
            "uuid" => SqlType::Uuid,
            "numeric" => SqlType::Numeric,
            "float4" => SqlType::Real,
            "float8" => SqlType::DoublePrecision,
            "json" => SqlType::Json,
            "jsonb" => SqlType::Jsonb,
            "date" => SqlType::Date,
            "timestamp" => SqlType::Timestamp,
            "timestamptz" => SqlType::TimestampTz,
            _ => SqlType::Text,
        }
    }

    /// Name usable in a cast.
    pub fn sql_name(&self) -> &str {
        match self {
            SqlType::Text => "text",
            SqlType::SmallInt => "smallint",
            SqlType::Integer => "integer",
            SqlType::BigInt => "bigint",
            SqlType::Numeric => "numeric",
            SqlType::Real => "real",
            SqlType::DoublePrecision => "double precision",
            SqlType::Boolean => "boolean",
            SqlType::Uuid => "uuid",
            SqlType::Json => "json",
            SqlType::Jsonb => "jsonb",
            SqlType::Date => "date",
            SqlType::Timestamp => "timestamp",
            SqlType::TimestampTz => "timestamptz",
            SqlType::Bytea => "bytea",
            SqlType::Other(name) => name,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, SqlType::SmallInt | SqlType::Integer | SqlType::BigInt)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer()
            || matches!(self, SqlType::Numeric | SqlType::Real | SqlType::DoublePrecision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Scalar(SqlType),
    ArrayOf(SqlType),
    Jsonb,
}

impl ColumnType {
    pub fn from_catalog(data_type: &str, udt_name: &str) -> Self {
        if data_type.eq_ignore_ascii_case("ARRAY") {
            return ColumnType::ArrayOf(SqlType::from_array_udt(udt_name));
        }
        match SqlType::from_data_type(data_type) {
            SqlType::Jsonb => ColumnType::Jsonb,
            other => ColumnType::Scalar(other),
        }
    }
}

/// Declared column types of one table. Empty when the table is unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnTypeMap {
    columns: HashMap<String, ColumnType>,
}

impl ColumnTypeMap {
    pub fn get(&self, column: &str) -> Option<&ColumnType> {
        self.columns.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl FromIterator<(String, ColumnType)> for ColumnTypeMap {
    fn from_iter<I: IntoIterator<Item = (String, ColumnType)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

const COLUMN_QUERY: &str = "SELECT column_name::text, data_type::text, udt_name::text \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2 \
     ORDER BY ordinal_position";

pub async fn resolve_column_types<S: SqlSession + ?Sized>(
    session: &mut S,
    schema: &str,
    table: &str,
) -> Result<ColumnTypeMap, DbFailure> {
    let rows = session.query_text(COLUMN_QUERY, &[schema, table]).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let mut cells = row.into_iter();
            let name = cells.next().flatten()?;
            let data_type = cells.next().flatten().unwrap_or_default();
            let udt_name = cells.next().flatten().unwrap_or_default();
            Some((name, ColumnType::from_catalog(&data_type, &udt_name)))
        })
        .collect())
}

/// Per-restore cache so each table's types are looked up once.
#[derive(Debug, Default)]
pub struct ColumnTypeCache {
    schema: String,
    tables: HashMap<String, ColumnTypeMap>,
}

impl ColumnTypeCache {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            tables: HashMap::new(),
        }
    }

    /// A lookup failure is logged and cached as an empty map, which sends
    /// every value of that table through untyped encoding.
    pub async fn resolve<S: SqlSession + ?Sized>(&mut self, session: &mut S, table: &str) -> &ColumnTypeMap {
        if !self.tables.contains_key(table) {
            let resolved = match resolve_column_types(session, &self.schema, table).await {
                Ok(map) => map,
                Err(e) => {
                    warn!(table = %table, error = %e, "Could not read column types; values will be encoded untyped");
                    ColumnTypeMap::default()
                }
            };
            self.tables.insert(table.to_string(), resolved);
        }
        self.tables.entry(table.to_string()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::testing::FakeDatabase;

    #[test]
    fn test_catalog_mapping() {
        assert_eq!(ColumnType::from_catalog("ARRAY", "_int8"), ColumnType::ArrayOf(SqlType::BigInt));
        assert_eq!(ColumnType::from_catalog("ARRAY", "_varchar"), ColumnType::ArrayOf(SqlType::Text));
        assert_eq!(ColumnType::from_catalog("ARRAY", "_mood"), ColumnType::ArrayOf(SqlType::Text));
        assert_eq!(ColumnType::from_catalog("jsonb", "jsonb"), ColumnType::Jsonb);
        assert_eq!(
            ColumnType::from_catalog("character varying", "varchar"),
            ColumnType::Scalar(SqlType::Text)
        );
        assert_eq!(
            ColumnType::from_catalog("timestamp with time zone", "timestamptz"),
            ColumnType::Scalar(SqlType::TimestampTz)
        );
        assert_eq!(
            ColumnType::from_catalog("timestamp without time zone", "timestamp"),
            ColumnType::Scalar(SqlType::Timestamp)
        );
        assert_eq!(
            ColumnType::from_catalog("USER-DEFINED", "mood"),
            ColumnType::Scalar(SqlType::Other("user-defined".to_string()))
        );
    }

    #[tokio::test]
    async fn test_cache_queries_once_per_table() -> anyhow::Result<()> {
        let db = FakeDatabase::new();
        db.with_table("users", &[("id", "uuid", "uuid"), ("tags", "ARRAY", "_text")]);
        let mut session = db.session();
        let mut cache = ColumnTypeCache::new("public");

        let types = cache.resolve(&mut session, "users").await.clone();
        assert!(types.contains("id"));
        assert!(types.contains("tags"));
        assert_eq!(types.get("tags"), Some(&ColumnType::ArrayOf(SqlType::Text)));
        cache.resolve(&mut session, "users").await;

        assert_eq!(db.queries().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_failure_yields_empty_map() {
        let db = FakeDatabase::new();
        db.fail_on("information_schema.columns", None, "permission denied for schema");
        let mut session = db.session();
        let mut cache = ColumnTypeCache::new("public");
        assert!(cache.resolve(&mut session, "users").await.is_empty());
    }
}
