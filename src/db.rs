use std::path::Path;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::blob::{parse_ndjson, BlobStore};
use crate::error::StoreError;
use crate::listing::{AggregateRow, NormalizedListing};

/// Column stamped on every staging row with the run that loaded it.
pub const RUN_ID_COLUMN: &str = "_run_id";
const LOADS_TABLE: &str = "_loads";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    CreateIfNeeded,
    CreateNever,
}

/// One blob → table transfer. Rows are always appended and the schema is
/// autodetected from the blob.
#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    pub source_blob: &'a str,
    pub table: &'a str,
    pub run_id: &'a str,
    pub create: CreateDisposition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub rows: usize,
    pub created: bool,
    /// The run id was already loaded into this table; nothing was written.
    pub replayed: bool,
}

/// Analytical tables fed from blobs.
pub trait TableStore {
    fn append_load(
        &self,
        blobs: &dyn BlobStore,
        request: &LoadRequest<'_>,
    ) -> Result<LoadReport, StoreError>;

    /// Atomically swap `table`'s contents for the result of `query`. Returns the row count.
    fn replace_table_from_query(&self, table: &str, query: &str) -> Result<usize, StoreError>;

    fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    /// Row count recorded for `run_id` if that run was already loaded into `table`.
    fn loaded_rows(&self, table: &str, run_id: &str) -> Result<Option<usize>, StoreError>;
}

// ── Schema inference ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Real,
    Integer,
    Boolean,
    /// Only nulls seen so far; takes any value.
    Any,
}

impl ColumnType {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => ColumnType::Any,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Integer,
            Value::Number(_) => ColumnType::Real,
            Value::String(_) | Value::Array(_) | Value::Object(_) => ColumnType::Text,
        }
    }

    fn merge(self, other: Self) -> Option<Self> {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Any, x) | (x, Any) => Some(x),
            (Integer, Real) | (Real, Integer) => Some(Real),
            _ => None,
        }
    }

    /// Whether a column declared as `self` can take incoming values of type `incoming`.
    fn accepts(self, incoming: Self) -> bool {
        self == incoming
            || self == ColumnType::Any
            || incoming == ColumnType::Any
            || (self == ColumnType::Real && incoming == ColumnType::Integer)
    }

    fn sql(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Real => "REAL",
            ColumnType::Integer => "INTEGER",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Any => "",
        }
    }

    fn from_decl(decl: &str) -> Self {
        match decl.trim().to_ascii_uppercase().as_str() {
            "" => ColumnType::Any,
            "REAL" | "FLOAT" | "DOUBLE" | "NUM" => ColumnType::Real,
            "INTEGER" | "INT" => ColumnType::Integer,
            "BOOLEAN" => ColumnType::Boolean,
            _ => ColumnType::Text,
        }
    }
}

/// Field name and type, in first-seen order across all records.
pub fn infer_schema(
    table: &str,
    records: &[Map<String, Value>],
) -> Result<Vec<(String, ColumnType)>, StoreError> {
    let mut schema: Vec<(String, ColumnType)> = Vec::new();
    for (i, record) in records.iter().enumerate() {
        for (field, value) in record {
            let incoming = ColumnType::of(value);
            match schema.iter_mut().find(|(name, _)| name == field) {
                Some((_, ty)) => {
                    *ty = ty.merge(incoming).ok_or_else(|| StoreError::SchemaDrift {
                        table: table.to_string(),
                        detail: format!(
                            "field `{}` is {:?} on record {} but {:?} earlier",
                            field,
                            incoming,
                            i + 1,
                            ty
                        ),
                    })?;
                }
                None => schema.push((field.clone(), incoming)),
            }
        }
    }
    Ok(schema)
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn to_sql(value: Option<&Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

// ── SQLite store ──

pub struct SqliteTableStore {
    conn: Connection,
}

impl SqliteTableStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {loads} (
                run_id     TEXT NOT NULL,
                table_name TEXT NOT NULL,
                blob_name  TEXT NOT NULL,
                row_count  INTEGER NOT NULL,
                loaded_at  TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (run_id, table_name)
            );
            ",
            loads = LOADS_TABLE
        ))?;
        Ok(Self { conn })
    }

    pub fn columns(&self, table: &str) -> Result<Vec<(String, ColumnType)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let cols = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let decl: String = row.get(2)?;
                Ok((name, ColumnType::from_decl(&decl)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cols)
    }

    /// Staging rows as listings, in insertion order.
    pub fn fetch_staging(&self, table: &str) -> Result<Vec<NormalizedListing>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT location, price, area, date FROM {} ORDER BY rowid",
            quote(table)
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(NormalizedListing {
                    location: row.get(0)?,
                    price: row.get(1)?,
                    area: row.get(2)?,
                    date: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn fetch_aggregates(
        &self,
        table: &str,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateRow>, StoreError> {
        let sql = format!(
            "SELECT location, avg_price, max_price, min_price, most_common_area
             FROM {} ORDER BY location{}",
            quote(table),
            match limit {
                Some(n) => format!(" LIMIT {}", n),
                None => String::new(),
            }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AggregateRow {
                    location: row.get(0)?,
                    avg_price: row.get(1)?,
                    max_price: row.get(2)?,
                    min_price: row.get(3)?,
                    most_common_area: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_rows(&self, table: &str) -> Result<usize, StoreError> {
        if !self.table_exists(table)? {
            return Ok(0);
        }
        let n: usize = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(table)),
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn count_loads(&self, table: &str) -> Result<usize, StoreError> {
        let n: usize = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE table_name = ?1", LOADS_TABLE),
            params![table],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    fn check_drift(
        &self,
        table: &str,
        existing: &[(String, ColumnType)],
        incoming: &[(String, ColumnType)],
    ) -> Result<(), StoreError> {
        for (field, ty) in incoming {
            match existing.iter().find(|(name, _)| name == field) {
                Some((_, declared)) if !declared.accepts(*ty) => {
                    return Err(StoreError::SchemaDrift {
                        table: table.to_string(),
                        detail: format!(
                            "field `{}` is {:?}, table column is {:?}",
                            field, ty, declared
                        ),
                    });
                }
                Some(_) => {}
                None if *ty == ColumnType::Any => {}
                None => {
                    return Err(StoreError::SchemaDrift {
                        table: table.to_string(),
                        detail: format!("new field `{}` not in table", field),
                    });
                }
            }
        }
        Ok(())
    }
}

impl TableStore for SqliteTableStore {
    fn append_load(
        &self,
        blobs: &dyn BlobStore,
        request: &LoadRequest<'_>,
    ) -> Result<LoadReport, StoreError> {
        let table = request.table;
        let records = parse_ndjson(&blobs.read(request.source_blob)?)?;
        let schema = infer_schema(table, &records)?;

        let tx = self.conn.unchecked_transaction()?;

        if let Some(rows) = self.loaded_rows(table, request.run_id)? {
            warn!(run_id = request.run_id, table, rows, "run already loaded, skipping");
            return Ok(LoadReport {
                rows,
                created: false,
                replayed: true,
            });
        }

        let mut created = false;
        let existing = self.columns(table)?;
        let columns: Vec<(String, ColumnType)> = if existing.is_empty() {
            if request.create == CreateDisposition::CreateNever {
                return Err(StoreError::MissingTable(table.to_string()));
            }
            if schema.is_empty() {
                // Nothing to infer a schema from; leave the table to a later load.
                Vec::new()
            } else {
                let run_col = format!("{} TEXT NOT NULL", quote(RUN_ID_COLUMN));
                let defs: Vec<String> = std::iter::once(run_col)
                    .chain(schema.iter().map(|(name, ty)| {
                        format!("{} {}", quote(name), ty.sql())
                            .trim_end()
                            .to_string()
                    }))
                    .collect();
                tx.execute(
                    &format!("CREATE TABLE {} ({})", quote(table), defs.join(", ")),
                    [],
                )?;
                created = true;
                info!(table, columns = schema.len(), "created table from blob schema");
                schema.clone()
            }
        } else {
            self.check_drift(table, &existing, &schema)?;
            schema
                .iter()
                .filter(|(name, _)| existing.iter().any(|(e, _)| e == name))
                .cloned()
                .collect()
        };

        if !records.is_empty() && !columns.is_empty() {
            let names: Vec<String> = std::iter::once(quote(RUN_ID_COLUMN))
                .chain(columns.iter().map(|(n, _)| quote(n)))
                .collect();
            let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(table),
                names.join(", "),
                placeholders.join(", ")
            ))?;
            for record in &records {
                let run = SqlValue::Text(request.run_id.to_string());
                let values: Vec<SqlValue> = std::iter::once(run)
                    .chain(columns.iter().map(|(n, _)| to_sql(record.get(n))))
                    .collect();
                stmt.execute(rusqlite::params_from_iter(values))?;
            }
        }

        tx.execute(
            &format!(
                "INSERT INTO {} (run_id, table_name, blob_name, row_count) VALUES (?1, ?2, ?3, ?4)",
                LOADS_TABLE
            ),
            params![request.run_id, table, request.source_blob, records.len()],
        )?;
        tx.commit()?;

        Ok(LoadReport {
            rows: records.len(),
            created,
            replayed: false,
        })
    }

    fn replace_table_from_query(&self, table: &str, query: &str) -> Result<usize, StoreError> {
        let next = quote(&format!("{}__next", table));
        let target = quote(table);

        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {next};
             CREATE TABLE {next} AS {query};
             DROP TABLE IF EXISTS {target};
             ALTER TABLE {next} RENAME TO {target};"
        ))?;
        let rows: usize =
            tx.query_row(&format!("SELECT COUNT(*) FROM {}", target), [], |r| r.get(0))?;
        tx.commit()?;
        Ok(rows)
    }

    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    fn loaded_rows(&self, table: &str, run_id: &str) -> Result<Option<usize>, StoreError> {
        let rows = self
            .conn
            .query_row(
                &format!(
                    "SELECT row_count FROM {} WHERE run_id = ?1 AND table_name = ?2",
                    LOADS_TABLE
                ),
                params![run_id, table],
                |r| r.get(0),
            )
            .optional()?;
        Ok(rows)
    }
}

// ── Tests ──
