//! Read-only SQLite query tool.
//!
//! Model-provided SQL is executed verbatim: this tool is an intentional
//! data-query interface, and safety comes from the read-only open mode, the
//! exact-path whitelist and the row cap, not from restricting statements.

use crate::error::ToolError;
use crate::policy::paths;
use crate::tools::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

pub struct SqlQueryTool;

#[derive(Deserialize)]
struct SqlQueryArgs {
    db_path: String,
    query: String,
}

#[async_trait]
impl Tool for SqlQueryTool {
    fn name(&self) -> &str {
        "sql_query"
    }

    fn description(&self) -> &str {
        "Run a read-only SQL query against an allow-listed SQLite database"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "db_path": {
                    "type": "string",
                    "description": "Absolute path of the SQLite database"
                },
                "query": {
                    "type": "string",
                    "description": "The SQL statement to execute"
                }
            },
            "required": ["db_path", "query"]
        })
    }

    fn permissions(&self) -> &[&str] {
        &["data.sqlite"]
    }

    async fn run(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let args: SqlQueryArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let decision = ctx.policy.check_sqlite(args.db_path.as_ref());
        if !decision.is_allow() {
            return Err(ToolError::Denied(decision.reason));
        }
        let canonical = paths::canonicalize_lenient(args.db_path.as_ref())
            .map_err(ToolError::InvalidArguments)?;
        if !canonical.exists() {
            return Err(ToolError::Sql(format!(
                "database '{}' does not exist",
                canonical.display()
            )));
        }

        let max_rows = ctx.manifest.tool_config(self.name()).max_rows;
        let tables = referenced_tables(&args.query);
        let query = args.query;
        let result = tokio::task::spawn_blocking(move || run_query(&canonical, &query, max_rows))
            .await
            .map_err(|e| ToolError::Sql(format!("sqlite worker failed: {}", e)))??;

        Ok(ToolOutput::json(json!({
            "columns": result.columns,
            "rows": result.rows,
            "truncated": result.truncated,
        }))
        .with_tables(tables))
    }
}

struct QueryResult {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    truncated: bool,
}

fn run_query(path: &Path, query: &str, max_rows: usize) -> Result<QueryResult, ToolError> {
    let uri = format!("file:{}?mode=ro", path.display());
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let mut stmt = conn.prepare(query)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let column_count = columns.len();

    let mut rows = stmt.query([])?;
    let mut out: Vec<Vec<Value>> = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if out.len() == max_rows {
            // One probe row past the cap tells us the result kept going.
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(column_value(row.get_ref(i)?));
        }
        out.push(values);
    }

    Ok(QueryResult {
        columns,
        rows: out,
        truncated,
    })
}

fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}

/// Table names following FROM/JOIN keywords, for the response trace. A
/// token scan, not a SQL parser: subqueries and CTE names come through as
/// whatever identifier follows the keyword.
fn referenced_tables(query: &str) -> Vec<String> {
    let mut tables = Vec::new();
    let mut tokens = query
        .split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')')
        .filter(|t| !t.is_empty());
    let mut expect_table = false;
    while let Some(token) = tokens.next() {
        if expect_table {
            let name = token.trim_matches(|c| c == '"' || c == '`' || c == ';' || c == '\'');
            if !name.is_empty()
                && !name.eq_ignore_ascii_case("select")
                && name.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
            {
                let name = name.to_string();
                if !tables.contains(&name) {
                    tables.push(name);
                }
            }
            expect_table = false;
        }
        if token.eq_ignore_ascii_case("from") || token.eq_ignore_ascii_case("join") {
            expect_table = true;
        }
    }
    tables
}
