use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

pub const CHUNKS_TABLE: &str = "chunks";

/// Chunk table layout. `*_key` columns hold lowercased, delimiter-wrapped
/// copies used only by SQL filters.
pub fn build_chunk_schema(dim: i32) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("id", DataType::Utf8, false),
		Field::new("document_id", DataType::Utf8, false),
		Field::new("space", DataType::Utf8, false),
		Field::new("space_key", DataType::Utf8, false),
		Field::new("path_json", DataType::Utf8, false),
		Field::new("path_key", DataType::Utf8, false),
		Field::new("labels_json", DataType::Utf8, false),
		Field::new("labels_key", DataType::Utf8, false),
		Field::new("page_type", DataType::Utf8, true),
		Field::new("position", DataType::Int64, false),
		Field::new("token_count", DataType::Int64, false),
		Field::new("text", DataType::Utf8, false),
		Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim), true),
	]))
}

/// `"a > b > "`: every prefix of the path is a string prefix of the key.
pub fn path_key<S: AsRef<str>>(path: &[S]) -> String {
	path.iter().map(|p| format!("{} > ", p.as_ref().to_lowercase())).collect()
}

/// `"|x|y|"` so a single label matches with `LIKE '%|x|%'`.
pub fn labels_key<S: AsRef<str>>(labels: &[S]) -> String {
	let mut key = String::from("|");
	for l in labels {
		key.push_str(&l.as_ref().to_lowercase());
		key.push('|');
	}
	key
}
