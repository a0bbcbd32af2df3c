//! LanceDB connection and housekeeping helpers.
use anyhow::Result;
use arrow_array::RecordBatchIterator;
use lancedb::{connect, Connection};
use std::sync::Arc;

use kbsearch_core::types::SearchFilter;

use crate::schema::{labels_key, path_key};

pub async fn open_db(uri: &str) -> Result<Connection> {
	Ok(connect(uri).execute().await?)
}

pub async fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
	Ok(conn.table_names().execute().await?.iter().any(|n| n == name))
}

pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<arrow_schema::Schema>) -> Result<()> {
	if table_exists(conn, name).await? {
		return Ok(());
	}
	// create empty table with 0 rows
	let iter = RecordBatchIterator::new(vec![].into_iter(), schema.clone());
	conn.create_table(name, Box::new(iter)).execute().await?;
	Ok(())
}

pub fn quote(value: &str) -> String {
	format!("'{}'", value.replace('\'', "''"))
}

fn like_literal(value: &str) -> String {
	value.replace('\'', "''").replace('%', "\\%").replace('_', "\\_")
}

/// SQL predicate for a search filter, `None` when the filter is empty.
pub fn filter_sql(filter: &SearchFilter) -> Option<String> {
	let mut clauses = Vec::new();
	if let Some(space) = &filter.space {
		clauses.push(format!("space_key = {}", quote(&space.to_lowercase())));
	}
	if !filter.path_prefix.is_empty() {
		clauses.push(format!("path_key LIKE '{}%'", like_literal(&path_key(&filter.path_prefix))));
	}
	for label in &filter.labels {
		clauses.push(format!("labels_key LIKE '%{}%'", like_literal(&labels_key(&[label]))));
	}
	if clauses.is_empty() { None } else { Some(clauses.join(" AND ")) }
}
