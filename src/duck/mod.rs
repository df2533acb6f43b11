// src/duck/mod.rs

use crate::error::{EtlError, Result};
use crate::store::{ColumnDef, RelationName, RelationalStore, SqlType, Value};
use chrono::{Duration, NaiveDate};
use duckdb::types::{ToSqlOutput, Value as DuckValue};
use duckdb::{appender_params_from_iter, params, Connection, ToSql};
use std::path::Path;
use tracing::{debug, trace};

const DEFAULT_SCHEMA: &str = "main";

/// DuckDB-backed relational store, either on disk or in memory.
pub struct DuckStore {
    conn: Connection,
}

impl DuckStore {
    /// Open a DuckDB database on disk at `path`, creating the file if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| EtlError::Connectivity(format!("{}: {}", path.display(), e)))?;
        debug!(db = %path.display(), "opened duckdb");
        Ok(Self { conn })
    }

    /// Open a DuckDB in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EtlError::Connectivity(e.to_string()))?;
        Ok(Self { conn })
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(match self {
            Value::Null => DuckValue::Null,
            Value::Int(v) => DuckValue::BigInt(*v),
            Value::Float(v) => DuckValue::Double(*v),
            Value::Text(s) => DuckValue::Text(s.clone()),
            // DuckDB casts ISO text into DATE columns on append.
            Value::Date(d) => DuckValue::Text(d.format("%Y-%m-%d").to_string()),
        }))
    }
}

fn from_duck(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Int(b as i64),
        DuckValue::TinyInt(v) => Value::Int(v as i64),
        DuckValue::SmallInt(v) => Value::Int(v as i64),
        DuckValue::Int(v) => Value::Int(v as i64),
        DuckValue::BigInt(v) => Value::Int(v),
        DuckValue::HugeInt(v) => Value::Int(v as i64),
        DuckValue::UTinyInt(v) => Value::Int(v as i64),
        DuckValue::USmallInt(v) => Value::Int(v as i64),
        DuckValue::UInt(v) => Value::Int(v as i64),
        DuckValue::UBigInt(v) => Value::Int(v as i64),
        DuckValue::Float(v) => Value::Float(v as f64),
        DuckValue::Double(v) => Value::Float(v),
        DuckValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or(Value::Null),
        DuckValue::Text(s) => Value::Text(s),
        DuckValue::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(Duration::days(days as i64)))
            .map(Value::Date)
            .unwrap_or(Value::Null),
        other => Value::Text(format!("{:?}", other)),
    }
}

impl RelationalStore for DuckStore {
    fn ping(&self) -> Result<()> {
        let one: i64 = self
            .conn
            .query_row("SELECT 1", [], |r| r.get(0))
            .map_err(|e| EtlError::Connectivity(e.to_string()))?;
        if one != 1 {
            return Err(EtlError::Connectivity("unexpected ping result".into()));
        }
        Ok(())
    }

    fn execute(&self, statement: &str) -> Result<usize> {
        trace!(sql = statement, "execute");
        Ok(self.conn.execute(statement, [])?)
    }

    fn execute_batch(&self, statements: &str) -> Result<()> {
        trace!(sql = statements, "execute_batch");
        Ok(self.conn.execute_batch(statements)?)
    }

    /// Insert rows via the Appender in chunks, flushing after each one.
    fn bulk_insert(
        &self,
        relation: &RelationName,
        rows: &[Vec<Value>],
        chunk_size: usize,
    ) -> Result<usize> {
        let schema = relation.schema.as_deref().unwrap_or(DEFAULT_SCHEMA);
        let mut appender = self.conn.appender_to_db(&relation.name, schema)?;
        for (idx, chunk) in rows.chunks(chunk_size.max(1)).enumerate() {
            for row in chunk {
                appender.append_row(appender_params_from_iter(row.iter()))?;
            }
            appender.flush()?;
            trace!(relation = %relation, chunk = idx, rows = chunk.len(), "flushed chunk");
        }
        Ok(rows.len())
    }

    fn relation_exists(&self, relation: &RelationName) -> Result<bool> {
        let schema = relation.schema.as_deref().unwrap_or(DEFAULT_SCHEMA);
        let n: i64 = self.conn.query_row(
            "SELECT count(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
            params![schema, relation.name],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    fn describe(&self, relation: &RelationName) -> Result<Option<Vec<ColumnDef>>> {
        let schema = relation.schema.as_deref().unwrap_or(DEFAULT_SCHEMA);
        let mut stmt = self.conn.prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
        )?;
        let rows = stmt
            .query_map(params![schema, relation.name], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;

        if rows.is_empty() {
            return Ok(None);
        }
        let cols = rows
            .into_iter()
            .map(|(name, data_type)| ColumnDef {
                // unknown catalog types compare as text
                ty: SqlType::from_catalog(&data_type).unwrap_or(SqlType::Text),
                name,
                primary_key: false,
            })
            .collect();
        Ok(Some(cols))
    }

    fn query(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
        trace!(sql, "query");
        let mut stmt = self.conn.prepare(sql)?;
        let mut cursor = stmt.query([])?;
        // column metadata is only available once the statement has run
        let column_count = cursor.as_ref().map_or(0, |s| s.column_count());
        let mut out = Vec::new();
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                let v: DuckValue = row.get(idx)?;
                values.push(from_duck(v));
            }
            out.push(values);
        }
        Ok(out)
    }
}
