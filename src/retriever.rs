use crate::error::Result;
use crate::vector_db::{RetrievedNode, VectorDB};
use std::path::Path;
use std::sync::Arc;

/// Wraps the index with a neighbour count fixed at construction.
#[derive(Clone)]
pub struct Retriever {
    vector_db: Arc<VectorDB>,
    top_k: usize,
}

impl Retriever {
    pub fn new(vector_db: VectorDB, top_k: usize) -> Self {
        Retriever {
            vector_db: Arc::new(vector_db),
            top_k,
        }
    }

    pub fn from_storage(dir: impl AsRef<Path>, top_k: usize) -> Result<Self> {
        Ok(Self::new(VectorDB::load(dir)?, top_k))
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn retrieve(&self, query: &str) -> Vec<RetrievedNode> {
        self.vector_db.search_similar(query, self.top_k)
    }
}
