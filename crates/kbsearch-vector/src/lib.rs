//! kbsearch-vector
//!
//! LanceDB-backed dense channel and chunk store. One table holds chunk
//! payloads alongside their embeddings, so hydration and neighbour lookups
//! never leave the vector store.

pub mod schema;
pub mod search;
pub mod table;
pub mod writer;

pub use search::LanceChunkIndex;
pub use writer::LanceChunkWriter;
