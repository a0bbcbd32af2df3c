use anyhow::{bail, Result};
use arrow_array::{FixedSizeListArray, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use indicatif::{ProgressBar, ProgressStyle};
use lancedb::Connection;
use std::sync::Arc;

use kbsearch_core::types::Chunk;

use crate::schema::{build_chunk_schema, labels_key, path_key};
use crate::table::table_exists;

const BATCH_SIZE: usize = 1000;

pub struct LanceChunkWriter {
	db: Connection,
	table_name: String,
	dim: i32,
	progress: bool,
}

impl LanceChunkWriter {
	pub fn new(db: Connection, table_name: &str, dim: usize) -> Result<Self> {
		Ok(Self { db, table_name: table_name.to_string(), dim: i32::try_from(dim)?, progress: false })
	}

	/// Show a terminal progress bar while writing.
	pub fn with_progress(mut self) -> Self {
		self.progress = true;
		self
	}

	pub async fn insert(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<usize> {
		if chunks.is_empty() {
			return Ok(0);
		}
		if chunks.len() != embeddings.len() {
			bail!("{} chunks but {} embeddings", chunks.len(), embeddings.len());
		}
		let pb = if self.progress { ProgressBar::new(chunks.len() as u64) } else { ProgressBar::hidden() };
		pb.set_style(ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%)")?.progress_chars("#>-"));
		for (batch_chunks, batch_vecs) in chunks.chunks(BATCH_SIZE).zip(embeddings.chunks(BATCH_SIZE)) {
			self.insert_batch(batch_chunks, batch_vecs).await?;
			pb.inc(batch_chunks.len() as u64);
		}
		pb.finish_and_clear();
		tracing::info!(table = %self.table_name, count = chunks.len(), "chunks written to LanceDB");
		Ok(chunks.len())
	}

	async fn insert_batch(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<()> {
		let record_batch = self.to_record_batch(chunks, embeddings)?;
		let schema = record_batch.schema();
		let reader = Box::new(RecordBatchIterator::new(vec![Ok(record_batch)].into_iter(), schema));
		if table_exists(&self.db, &self.table_name).await? {
			self.db.open_table(&self.table_name).execute().await?.add(reader).execute().await?;
		} else {
			self.db.create_table(&self.table_name, reader).execute().await?;
		}
		Ok(())
	}

	fn to_record_batch(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<RecordBatch> {
		let expected = usize::try_from(self.dim)?;
		if let Some(bad) = embeddings.iter().find(|v| v.len() != expected) {
			return Err(kbsearch_core::Error::DimensionMismatch { expected, actual: bad.len() }.into());
		}
		let mut path_json = Vec::with_capacity(chunks.len());
		let mut labels_json = Vec::with_capacity(chunks.len());
		for c in chunks {
			path_json.push(serde_json::to_string(&c.path)?);
			labels_json.push(serde_json::to_string(&c.metadata.labels)?);
		}
		let vectors = embeddings.iter().map(|v| Some(v.iter().map(|&x| Some(x)).collect::<Vec<_>>()));
		let record_batch = RecordBatch::try_new(build_chunk_schema(self.dim), vec![
			Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.id.as_str()))),
			Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.document_id.as_str()))),
			Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.space.as_str()))),
			Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.space.to_lowercase()))),
			Arc::new(StringArray::from(path_json)),
			Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| path_key(&c.path)))),
			Arc::new(StringArray::from(labels_json)),
			Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| labels_key(&c.metadata.labels)))),
			Arc::new(chunks.iter().map(|c| c.metadata.page_type.as_deref()).collect::<StringArray>()),
			Arc::new(Int64Array::from_iter_values(chunks.iter().map(|c| i64::from(c.position)))),
			Arc::new(Int64Array::from_iter_values(chunks.iter().map(|c| i64::from(c.token_count)))),
			Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.text.as_str()))),
			Arc::new(FixedSizeListArray::from_iter_primitive::<arrow_array::types::Float32Type, _, _>(vectors, self.dim)),
		])?;
		Ok(record_batch)
	}
}
