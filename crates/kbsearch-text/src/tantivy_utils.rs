use tantivy::schema::{Facet, FacetOptions, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, STORED, STRING};
use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, StopWordFilter, TextAnalyzer};
use tantivy::Index;

use kbsearch_core::text::STOP_WORDS;

pub const TOKENIZER: &str = "text_with_stopwords";

pub fn build_schema() -> Schema {
	let mut schema_builder = Schema::builder();
	schema_builder.add_text_field("id", STRING | STORED);
	schema_builder.add_text_field("document_id", STRING | STORED);
	// Lowercased keys used for exact-match filtering.
	schema_builder.add_text_field("space", STRING);
	schema_builder.add_text_field("label", STRING);
	let text_field_indexing = TextFieldIndexing::default().set_tokenizer(TOKENIZER).set_index_option(IndexRecordOption::WithFreqsAndPositions);
	let text_options = TextOptions::default().set_indexing_options(text_field_indexing);
	schema_builder.add_text_field("text", text_options);
	// Section titles; facet terms include every ancestor so a prefix is a single term.
	schema_builder.add_facet_field("section", FacetOptions::default());
	schema_builder.add_facet_field("space_facet", FacetOptions::default());
	schema_builder.build()
}

pub fn register_tokenizer(index: &Index) {
	let tokenizer = TextAnalyzer::builder(SimpleTokenizer::default())
		.filter(LowerCaser)
		.filter(StopWordFilter::remove(STOP_WORDS.iter().map(|s| (*s).to_string())))
		.build();
	index.tokenizers().register(TOKENIZER, tokenizer);
}

/// Facet for a section path, lowercased so prefix filters are case-insensitive.
pub fn section_facet<S: AsRef<str>>(path: &[S]) -> Facet {
	let lowered: Vec<String> = path.iter().map(|p| p.as_ref().to_lowercase()).collect();
	Facet::from_path(lowered)
}
