//! Per-session chunk index.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// A retrievable slice of an uploaded document. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub source_document_id: Uuid,
    pub source_name: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub sequence_index: usize,
}

/// Bookkeeping for one uploaded document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub name: String,
    /// Hex SHA-256 of the raw upload.
    pub content_hash: String,
    pub chunk_count: usize,
    pub added_at: DateTime<Utc>,
}

/// Chunks of one session's documents, in insertion order.
///
/// Never shared across sessions. Sessions hold it behind an `Arc` and swap
/// in a new version on upload, so a retrieval in progress keeps reading the
/// version it started with.
#[derive(Debug, Clone)]
pub struct DocumentIndex {
    dimensions: usize,
    chunks: Vec<Arc<Chunk>>,
    documents: Vec<DocumentRecord>,
}

impl DocumentIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            chunks: Vec::new(),
            documents: Vec::new(),
        }
    }

    /// Add a document and its chunks. Chunks whose vector width does not
    /// match the index are rejected with the offending width.
    pub fn insert_document(
        &mut self,
        record: DocumentRecord,
        chunks: Vec<Chunk>,
    ) -> std::result::Result<usize, usize> {
        if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != self.dimensions) {
            return Err(bad.embedding.len());
        }
        let added = chunks.len();
        self.chunks.extend(chunks.into_iter().map(Arc::new));
        self.documents.push(record);
        Ok(added)
    }

    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    pub fn documents(&self) -> &[DocumentRecord] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}
