//! Read-only SQL queries against a SQLite database.
//!
//! Every call opens its own read-only connection on a blocking worker, so
//! a slow query never stalls the server's event loop and no statement can
//! write, whatever it says.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mcp::{
    ArgKind, ArgumentSchema, Arguments, PeerInfo, ResourceDescriptor, ToolDefinition, ToolFailure,
    ToolService,
};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{CapabilityError, Result};

pub const SCHEMA_URI: &str = "database://schema";
pub const DEFAULT_MAX_ROWS: usize = 1000;

const NO_DATA: &str = "The query returned no data.";

/// Rows returned by one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    /// More rows matched than `max_rows`.
    pub truncated: bool,
    /// Plain-text table for display.
    pub table: String,
}

/// Tool service exposing `query_database`.
#[derive(Debug, Clone)]
pub struct SqlServer {
    database: PathBuf,
    max_rows: usize,
}

impl SqlServer {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    pub async fn query(&self, sql: String) -> Result<QueryOutput> {
        let database = self.database.clone();
        let max_rows = self.max_rows;
        tokio::task::spawn_blocking(move || run_query(&database, &sql, max_rows)).await?
    }

    pub async fn schema(&self) -> Result<String> {
        let database = self.database.clone();
        tokio::task::spawn_blocking(move || describe_schema(&database)).await?
    }
}

fn open_read_only(database: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    Ok(Connection::open_with_flags(database, flags)?)
}

fn run_query(database: &Path, sql: &str, max_rows: usize) -> Result<QueryOutput> {
    let conn = open_read_only(database)?;
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(CapabilityError::InvalidInput(
            "only read-only statements (SELECT, read-only PRAGMA, EXPLAIN) are allowed".to_string(),
        ));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = Vec::new();
    let mut truncated = false;

    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        if rows.len() == max_rows {
            truncated = true;
            break;
        }
        let mut object = Map::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            object.insert(column.clone(), to_json(row.get_ref(index)?));
        }
        rows.push(object);
    }

    debug!(rows = rows.len(), truncated, "query finished");
    let table = render_table(&columns, &rows);
    Ok(QueryOutput {
        row_count: rows.len(),
        columns,
        rows,
        truncated,
        table,
    })
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::from(n),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `a | b` header, dashed separator, one line per row, then a record count.
fn render_table(columns: &[String], rows: &[Map<String, Value>]) -> String {
    if rows.is_empty() {
        return NO_DATA.to_string();
    }

    let header = columns.join(" | ");
    let mut out = String::new();
    out.push_str(&header);
    out.push('\n');
    out.push_str(&"-".repeat(header.chars().count()));
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| row.get(c).map_or_else(|| "N/A".to_string(), display))
            .collect();
        out.push('\n');
        out.push_str(&cells.join(" | "));
    }
    let _ = write!(out, "\nTotal {} records", rows.len());
    out
}

fn describe_schema(database: &Path) -> Result<String> {
    let conn = open_read_only(database)?;
    let mut tables = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = tables
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if names.is_empty() {
        return Ok("The database has no tables.".to_string());
    }

    let mut columns = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let mut out = String::new();
    for table in &names {
        let _ = writeln!(out, "Table: {table}");
        let mut rows = columns.query([table])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let not_null: bool = row.get(2)?;
            let default: Option<String> = row.get(3)?;
            let pk: i64 = row.get(4)?;

            let _ = write!(out, "  - {name} ({kind})");
            if pk > 0 {
                out.push_str(" PRIMARY KEY");
            }
            if not_null {
                out.push_str(" NOT NULL");
            }
            if let Some(default) = default {
                let _ = write!(out, " DEFAULT {default}");
            }
            out.push('\n');
        }
    }
    Ok(out)
}

impl ToolService for SqlServer {
    fn info(&self) -> PeerInfo {
        PeerInfo {
            name: "sql".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "query_database",
            description: "Run a read-only SQL query (SELECT) against the sales database and \
                          return the rows. Read the database://schema resource for tables \
                          and columns.",
            schema: ArgumentSchema::new().required(
                "query",
                ArgKind::String,
                "SQL statement, e.g. SELECT Region, SUM(Total_Price) FROM sales GROUP BY Region",
            ),
        }]
    }

    async fn call(&self, _tool: &str, arguments: Arguments) -> std::result::Result<Value, ToolFailure> {
        let sql = arguments.str("query").unwrap_or_default().trim();
        if sql.is_empty() {
            return Err(ToolFailure::invalid_arguments("query must not be empty"));
        }

        let output = self.query(sql.to_string()).await.map_err(|e| match e {
            // A write attempt is a refused execution, not a malformed argument.
            CapabilityError::InvalidInput(message) => ToolFailure::capability(message),
            other => other.into(),
        })?;
        serde_json::to_value(output).map_err(|e| ToolFailure::capability(e.to_string()))
    }

    fn resources(&self) -> Vec<ResourceDescriptor> {
        vec![ResourceDescriptor {
            uri: SCHEMA_URI.to_string(),
            name: "Database schema".to_string(),
            description: Some("Tables and columns of the queried database".to_string()),
            mime_type: Some("text/plain".to_string()),
        }]
    }

    async fn read_resource(&self, uri: &str) -> std::result::Result<String, ToolFailure> {
        if uri != SCHEMA_URI {
            return Err(ToolFailure::invalid_arguments(format!("unknown resource: {uri}")));
        }
        Ok(self.schema().await?)
    }
}
