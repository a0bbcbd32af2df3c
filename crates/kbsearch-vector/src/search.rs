use anyhow::{anyhow, Result};
use arrow_array::{Array, Float32Array, Int64Array, RecordBatch, StringArray};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use std::ops::RangeInclusive;

use kbsearch_core::traits::{ChunkStore, DenseIndex};
use kbsearch_core::types::{Channel, Chunk, ChunkMetadata, SearchFilter, SearchHit};

use crate::schema::{build_chunk_schema, CHUNKS_TABLE};
use crate::table::{ensure_table, filter_sql, open_db, quote};
use crate::writer::LanceChunkWriter;

/// Dense channel and chunk store over a single LanceDB table.
pub struct LanceChunkIndex {
	db: Connection,
	table_name: String,
	dim: usize,
}

impl LanceChunkIndex {
	pub async fn open(uri: &str, dim: usize) -> Result<Self> {
		Self::open_table(uri, CHUNKS_TABLE, dim).await
	}

	pub async fn open_table(uri: &str, table_name: &str, dim: usize) -> Result<Self> {
		let db = open_db(uri).await?;
		ensure_table(&db, table_name, build_chunk_schema(i32::try_from(dim)?)).await?;
		Ok(Self { db, table_name: table_name.to_string(), dim })
	}

	pub fn writer(&self) -> Result<LanceChunkWriter> {
		LanceChunkWriter::new(self.db.clone(), &self.table_name, self.dim)
	}

	// Opened per call so rows added through a writer are visible.
	async fn table(&self) -> Result<Table> {
		Ok(self.db.open_table(&self.table_name).execute().await?)
	}

	pub async fn count(&self) -> Result<usize> {
		Ok(self.table().await?.count_rows(None).await?)
	}

	async fn query_chunks(&self, predicate: &str) -> Result<Vec<Chunk>> {
		let mut stream = self.table().await?.query().only_if(predicate).execute().await?;
		let mut out = Vec::new();
		while let Some(batch) = stream.try_next().await? {
			out.extend(batch_to_chunks(&batch)?);
		}
		Ok(out)
	}
}

fn str_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
	batch.column_by_name(name).and_then(|c| c.as_any().downcast_ref::<StringArray>()).ok_or_else(|| anyhow!("column '{name}' missing"))
}

fn i64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
	batch.column_by_name(name).and_then(|c| c.as_any().downcast_ref::<Int64Array>()).ok_or_else(|| anyhow!("column '{name}' missing"))
}

fn batch_to_chunks(batch: &RecordBatch) -> Result<Vec<Chunk>> {
	let ids = str_col(batch, "id")?;
	let docs = str_col(batch, "document_id")?;
	let spaces = str_col(batch, "space")?;
	let paths = str_col(batch, "path_json")?;
	let labels = str_col(batch, "labels_json")?;
	let page_types = str_col(batch, "page_type")?;
	let positions = i64_col(batch, "position")?;
	let tokens = i64_col(batch, "token_count")?;
	let texts = str_col(batch, "text")?;
	let mut out = Vec::with_capacity(batch.num_rows());
	for i in 0..batch.num_rows() {
		out.push(Chunk {
			id: ids.value(i).to_string(),
			document_id: docs.value(i).to_string(),
			space: spaces.value(i).to_string(),
			path: serde_json::from_str(paths.value(i))?,
			position: u32::try_from(positions.value(i))?,
			text: texts.value(i).to_string(),
			token_count: u32::try_from(tokens.value(i))?,
			metadata: ChunkMetadata {
				labels: serde_json::from_str(labels.value(i))?,
				page_type: (!page_types.is_null(i)).then(|| page_types.value(i).to_string()),
			},
		});
	}
	Ok(out)
}

#[async_trait]
impl DenseIndex for LanceChunkIndex {
	fn dim(&self) -> usize {
		self.dim
	}

	async fn search(&self, vector: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
		if k == 0 {
			return Ok(vec![]);
		}
		let mut query = self.table().await?.vector_search(vector.to_vec())?.distance_type(DistanceType::Cosine).limit(k);
		if let Some(sql) = filter_sql(filter) {
			query = query.only_if(sql);
		}
		let mut results = query.execute().await?;
		let mut hits = Vec::new();
		while let Some(batch) = results.try_next().await? {
			let ids = str_col(&batch, "id")?;
			let distances = batch.column_by_name("_distance").and_then(|c| c.as_any().downcast_ref::<Float32Array>());
			for i in 0..batch.num_rows() {
				// Cosine distance; higher score is closer.
				let score = distances.map_or(0.0, |d| 1.0 - d.value(i));
				hits.push(SearchHit { id: ids.value(i).to_string(), score, source: Channel::Dense });
			}
		}
		hits.sort_by(|a, b| b.score.total_cmp(&a.score));
		hits.truncate(k);
		Ok(hits)
	}
}

#[async_trait]
impl ChunkStore for LanceChunkIndex {
	async fn get(&self, id: &str) -> Result<Option<Chunk>> {
		Ok(self.query_chunks(&format!("id = {}", quote(id))).await?.into_iter().next())
	}

	async fn get_neighbors(&self, document_id: &str, positions: RangeInclusive<u32>) -> Result<Vec<Chunk>> {
		let predicate = format!(
			"document_id = {} AND position >= {} AND position <= {}",
			quote(document_id),
			positions.start(),
			positions.end()
		);
		let mut chunks = self.query_chunks(&predicate).await?;
		chunks.sort_by_key(|c| c.position);
		Ok(chunks)
	}
}
