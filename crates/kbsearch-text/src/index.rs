use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tantivy::collector::{FacetCollector, TopDocs};
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{Facet, Field, IndexRecordOption, Value};
use tantivy::{doc, Index, IndexReader, ReloadPolicy, TantivyDocument, Term};

use kbsearch_core::traits::LexicalIndex;
use kbsearch_core::types::{Channel, Chunk, SearchFilter, SearchHit};

use crate::tantivy_utils::{build_schema, register_tokenizer, section_facet};

pub struct TantivyLexicalIndex {
	index: Index,
	reader: IndexReader,
	id_field: Field,
	document_id_field: Field,
	space_field: Field,
	label_field: Field,
	text_field: Field,
	section_field: Field,
	space_facet_field: Field,
}

impl TantivyLexicalIndex {
	/// Create a fresh index in `index_dir`, replacing whatever was there.
	pub fn create(index_dir: &Path) -> Result<Self> {
		if index_dir.exists() { std::fs::remove_dir_all(index_dir)?; }
		std::fs::create_dir_all(index_dir)?;
		let index = Index::create_in_dir(index_dir, build_schema())?;
		Self::from_index(index)
	}

	pub fn open(index_dir: &Path) -> Result<Self> {
		Self::from_index(Index::open_in_dir(index_dir)?)
	}

	pub fn in_memory() -> Result<Self> {
		Self::from_index(Index::create_in_ram(build_schema()))
	}

	fn from_index(index: Index) -> Result<Self> {
		register_tokenizer(&index);
		let reader = index.reader_builder().reload_policy(ReloadPolicy::OnCommitWithDelay).try_into()?;
		let schema = index.schema();
		Ok(Self {
			id_field: schema.get_field("id")?,
			document_id_field: schema.get_field("document_id")?,
			space_field: schema.get_field("space")?,
			label_field: schema.get_field("label")?,
			text_field: schema.get_field("text")?,
			section_field: schema.get_field("section")?,
			space_facet_field: schema.get_field("space_facet")?,
			index,
			reader,
		})
	}

	pub fn index(&self, chunks: &[Chunk]) -> Result<usize> {
		let mut index_writer: tantivy::IndexWriter = self.index.writer(50_000_000)?;
		for c in chunks {
			let mut doc = doc!(
				self.id_field => c.id.clone(),
				self.document_id_field => c.document_id.clone(),
				self.space_field => c.space.to_lowercase(),
				self.text_field => c.text.clone(),
				self.space_facet_field => Facet::from_path([c.space.as_str()]),
			);
			if !c.path.is_empty() {
				doc.add_facet(self.section_field, section_facet(&c.path));
			}
			for label in &c.metadata.labels {
				doc.add_text(self.label_field, label.to_lowercase());
			}
			index_writer.add_document(doc)?;
		}
		index_writer.commit()?;
		self.reader.reload()?;
		tracing::debug!(count = chunks.len(), "lexical index committed");
		Ok(chunks.len())
	}

	pub fn num_docs(&self) -> u64 {
		self.reader.searcher().num_docs()
	}

	/// Chunk counts per space, largest first.
	pub fn space_counts(&self) -> Result<Vec<(String, u64)>> {
		let searcher = self.reader.searcher();
		let mut facet_collector = FacetCollector::for_field("space_facet");
		facet_collector.add_facet(Facet::root());
		let facet_counts = searcher.search(&AllQuery, &facet_collector)?;
		let mut spaces: Vec<(String, u64)> = facet_counts
			.get("/")
			.map(|(facet, count)| (facet.to_path().join("/"), count))
			.collect();
		spaces.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
		Ok(spaces)
	}

	fn filtered_query(&self, text: &str, filter: &SearchFilter) -> Box<dyn Query> {
		let qp = QueryParser::for_index(&self.index, vec![self.text_field]);
		// Lenient parsing: stray quotes or operators in user text never fail a search.
		let (text_query, errors) = qp.parse_query_lenient(text);
		if !errors.is_empty() {
			tracing::debug!(errors = errors.len(), "lenient query parse dropped clauses");
		}
		if filter.is_empty() {
			return text_query;
		}
		let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(Occur::Must, text_query)];
		if let Some(space) = &filter.space {
			let term = Term::from_field_text(self.space_field, &space.to_lowercase());
			clauses.push((Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic))));
		}
		if !filter.path_prefix.is_empty() {
			let term = Term::from_facet(self.section_field, &section_facet(&filter.path_prefix));
			clauses.push((Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic))));
		}
		for label in &filter.labels {
			let term = Term::from_field_text(self.label_field, &label.to_lowercase());
			clauses.push((Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic))));
		}
		Box::new(BooleanQuery::new(clauses))
	}

	fn search_sync(&self, text: &str, k: usize, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
		if k == 0 || text.trim().is_empty() { return Ok(vec![]); }
		let searcher = self.reader.searcher();
		let q = self.filtered_query(text, filter);
		let top_docs = searcher.search(&q, &TopDocs::with_limit(k))?;
		let mut hits = Vec::with_capacity(top_docs.len());
		for (score, addr) in top_docs {
			let doc: TantivyDocument = searcher.doc(addr)?;
			let Some(id) = doc.get_first(self.id_field).and_then(|v| v.as_str()) else { continue };
			hits.push(SearchHit { id: id.to_string(), score, source: Channel::Sparse });
		}
		Ok(hits)
	}
}

#[async_trait]
impl LexicalIndex for TantivyLexicalIndex {
	async fn search(&self, text: &str, k: usize, filter: &SearchFilter) -> anyhow::Result<Vec<SearchHit>> {
		self.search_sync(text, k, filter)
	}
}
