//! Per-library entity storage.
//!
//! The catalogue shards the global triple-table view by library: each
//! [`LibraryShard`] owns that library's documents, chunks, secondary
//! ordering tables, and current index, and is wrapped in one reader/writer
//! lock by the envelope in [`crate::db`]. Every mutation updates the
//! primary and secondary tables inside the same critical section, so
//! referential invariants hold at every lock release.

use chrono::Utc;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filter::Metadata;
use crate::index::{AnyIndex, IndexPoint};
use crate::model::{Chunk, Document, Library};
use crate::vector::validate_embedding;

// ---------------------------------------------------------------------------
// Index lifecycle
// ---------------------------------------------------------------------------

/// Per-library index state machine:
/// `Empty → Building → Ready → Stale → Building → Ready → …`.
/// Any chunk mutation moves Ready → Stale; a search against Stale or Empty
/// triggers a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Empty,
    Building,
    Ready,
    Stale,
}

// ---------------------------------------------------------------------------
// Shard
// ---------------------------------------------------------------------------

/// Input for a bulk chunk insert, before ids and timestamps are assigned.
#[derive(Debug, Clone)]
pub struct ChunkInput {
    pub text: String,
    pub embedding: Vec<f64>,
    pub metadata: Metadata,
}

/// One library's aggregate state. The shard owns all entity data; the
/// index holds chunk ids only and is dropped/rebuilt whole.
#[derive(Debug)]
pub struct LibraryShard {
    pub library: Library,
    pub documents: HashMap<Uuid, Document>,
    pub chunks: HashMap<Uuid, Chunk>,
    /// Document ids in insertion order (doubles as the by-library
    /// secondary index).
    pub doc_order: Vec<Uuid>,
    /// Per document: chunk ids in insertion order.
    pub chunk_order: HashMap<Uuid, Vec<Uuid>>,
    pub index: Option<AnyIndex>,
    pub index_state: IndexState,
}

impl LibraryShard {
    pub fn new(library: Library) -> Self {
        Self {
            library,
            documents: HashMap::new(),
            chunks: HashMap::new(),
            doc_order: Vec::new(),
            chunk_order: HashMap::new(),
            index: None,
            index_state: IndexState::Empty,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Ready → Stale on any chunk mutation. A library that never built an
    /// index stays Empty; both states trigger a build on the next search.
    pub fn mark_stale(&mut self) {
        self.index_state =
            if self.index.is_some() { IndexState::Stale } else { IndexState::Empty };
        self.library.updated_at = Utc::now();
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    pub fn add_document(&mut self, name: String, metadata: Metadata) -> Document {
        let doc = Document::new(self.library.id, name, metadata);
        self.doc_order.push(doc.id);
        self.chunk_order.insert(doc.id, Vec::new());
        self.documents.insert(doc.id, doc.clone());
        self.library.updated_at = Utc::now();
        doc
    }

    pub fn document(&self, id: Uuid) -> Result<&Document> {
        self.documents
            .get(&id)
            .ok_or_else(|| Error::Internal(format!("document {id} missing from shard")))
    }

    /// Cascading delete: the document and every chunk it owns.
    pub fn remove_document(&mut self, id: Uuid) -> Result<()> {
        if self.documents.remove(&id).is_none() {
            return Err(Error::NotFound(format!("document {id}")));
        }
        self.doc_order.retain(|d| *d != id);
        if let Some(chunk_ids) = self.chunk_order.remove(&id) {
            let had_chunks = !chunk_ids.is_empty();
            for cid in chunk_ids {
                self.chunks.remove(&cid);
            }
            if had_chunks {
                self.mark_stale();
                return Ok(());
            }
        }
        self.library.updated_at = Utc::now();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    /// Bulk insert. Atomic: every chunk is validated against the library
    /// dimension (set here on the first ever insert) before anything is
    /// written, so a failure mutates nothing.
    pub fn add_chunks(&mut self, document_id: Uuid, inputs: Vec<ChunkInput>) -> Result<Vec<Chunk>> {
        if !self.documents.contains_key(&document_id) {
            return Err(Error::NotFound(format!("document {document_id}")));
        }
        if inputs.is_empty() {
            return Err(Error::invalid("chunk batch must not be empty"));
        }

        let mut dimension = self.library.dimension;
        for (i, input) in inputs.iter().enumerate() {
            validate_embedding(&input.embedding)?;
            match dimension {
                None => dimension = Some(input.embedding.len()),
                Some(d) if d != input.embedding.len() => {
                    return Err(Error::Conflict(format!(
                        "chunk {i} has dimension {}, library is fixed at {d}",
                        input.embedding.len()
                    )));
                }
                Some(_) => {}
            }
        }

        self.library.dimension = dimension;
        let order = self
            .chunk_order
            .get_mut(&document_id)
            .ok_or_else(|| Error::Internal(format!("chunk order missing for {document_id}")))?;

        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            let chunk = Chunk::new(
                document_id,
                self.library.id,
                input.text,
                input.embedding,
                input.metadata,
            );
            order.push(chunk.id);
            self.chunks.insert(chunk.id, chunk.clone());
            created.push(chunk);
        }
        self.mark_stale();
        Ok(created)
    }

    pub fn chunk(&self, id: Uuid) -> Result<&Chunk> {
        self.chunks.get(&id).ok_or_else(|| Error::NotFound(format!("chunk {id}")))
    }

    /// Chunks are immutable apart from their metadata map.
    pub fn update_chunk_metadata(&mut self, id: Uuid, metadata: Metadata) -> Result<Chunk> {
        let chunk = self
            .chunks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("chunk {id}")))?;
        chunk.metadata = metadata;
        let updated = chunk.clone();
        self.mark_stale();
        Ok(updated)
    }

    pub fn remove_chunk(&mut self, id: Uuid) -> Result<()> {
        let chunk = self
            .chunks
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("chunk {id}")))?;
        if let Some(order) = self.chunk_order.get_mut(&chunk.document_id) {
            order.retain(|c| *c != id);
        }
        self.mark_stale();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Index feed
    // -----------------------------------------------------------------------

    /// Snapshot of all `(id, vector)` pairs in deterministic insertion
    /// order (documents, then chunks within each). Index builds and the
    /// stable tie-break in result ordering depend on this order.
    pub fn points(&self) -> Vec<IndexPoint> {
        let mut points = Vec::with_capacity(self.chunks.len());
        for doc_id in &self.doc_order {
            if let Some(chunk_ids) = self.chunk_order.get(doc_id) {
                for cid in chunk_ids {
                    if let Some(chunk) = self.chunks.get(cid) {
                        points.push(IndexPoint { id: chunk.id, vector: chunk.embedding.clone() });
                    }
                }
            }
        }
        points
    }

    // -----------------------------------------------------------------------
    // Invariants (exercised by tests; cheap enough to run in debug builds)
    // -----------------------------------------------------------------------

    /// Referential integrity: every chunk resolves through both foreign
    /// keys, both secondary tables agree with the primaries, and every
    /// embedding matches the library dimension.
    pub fn check_invariants(&self) -> Result<()> {
        for doc in self.documents.values() {
            if doc.library_id != self.library.id {
                return Err(Error::Internal(format!(
                    "document {} references foreign library {}",
                    doc.id, doc.library_id
                )));
            }
        }
        for chunk in self.chunks.values() {
            if chunk.library_id != self.library.id {
                return Err(Error::Internal(format!(
                    "chunk {} references foreign library {}",
                    chunk.id, chunk.library_id
                )));
            }
            let doc = self.documents.get(&chunk.document_id).ok_or_else(|| {
                Error::Internal(format!("chunk {} has no parent document", chunk.id))
            })?;
            if doc.library_id != chunk.library_id {
                return Err(Error::Internal(format!(
                    "chunk {} and its document disagree on the library",
                    chunk.id
                )));
            }
            if let Some(d) = self.library.dimension {
                if chunk.embedding.len() != d {
                    return Err(Error::Internal(format!(
                        "chunk {} has dimension {}, library is fixed at {d}",
                        chunk.id,
                        chunk.embedding.len()
                    )));
                }
            }
        }
        if self.doc_order.len() != self.documents.len() {
            return Err(Error::Internal("document order table out of sync".into()));
        }
        let ordered_chunks: usize = self.chunk_order.values().map(Vec::len).sum();
        if ordered_chunks != self.chunks.len() {
            return Err(Error::Internal("chunk order table out of sync".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IndexConfig;

    fn shard() -> LibraryShard {
        let lib = Library::new("lib".into(), String::new(), Metadata::new(), IndexConfig::default());
        LibraryShard::new(lib)
    }

    fn input(embedding: &[f64]) -> ChunkInput {
        ChunkInput { text: "t".into(), embedding: embedding.to_vec(), metadata: Metadata::new() }
    }

    #[test]
    fn first_insert_fixes_the_dimension() {
        let mut s = shard();
        let doc = s.add_document("d".into(), Metadata::new());
        s.add_chunks(doc.id, vec![input(&[1.0, 2.0, 3.0])]).unwrap();
        assert_eq!(s.library.dimension, Some(3));

        let err = s.add_chunks(doc.id, vec![input(&[1.0, 2.0])]).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(s.chunk_count(), 1, "failed batch must not partially insert");
        s.check_invariants().unwrap();
    }

    #[test]
    fn bulk_insert_is_all_or_nothing() {
        let mut s = shard();
        let doc = s.add_document("d".into(), Metadata::new());
        let err = s
            .add_chunks(doc.id, vec![input(&[1.0, 2.0]), input(&[1.0, f64::NAN])])
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert_eq!(s.chunk_count(), 0);
        assert_eq!(s.library.dimension, None, "dimension must not stick from a failed batch");
    }

    #[test]
    fn document_delete_cascades_to_chunks() {
        let mut s = shard();
        let d1 = s.add_document("d1".into(), Metadata::new());
        let d2 = s.add_document("d2".into(), Metadata::new());
        s.add_chunks(d1.id, vec![input(&[1.0]), input(&[2.0])]).unwrap();
        s.add_chunks(d2.id, vec![input(&[3.0])]).unwrap();

        s.remove_document(d1.id).unwrap();
        assert_eq!(s.documents.len(), 1);
        assert_eq!(s.chunk_count(), 1);
        assert!(s.chunks.values().all(|c| c.document_id == d2.id));
        s.check_invariants().unwrap();
    }

    #[test]
    fn chunk_mutations_mark_the_index_stale() {
        let mut s = shard();
        let doc = s.add_document("d".into(), Metadata::new());
        s.add_chunks(doc.id, vec![input(&[1.0])]).unwrap();
        assert_eq!(s.index_state, IndexState::Empty, "no index was ever built");

        // Pretend a build happened.
        s.index = Some(crate::index::AnyIndex::build_from(&IndexConfig::default(), s.points()).unwrap());
        s.index_state = IndexState::Ready;
        let cid = *s.chunk_order[&doc.id].first().unwrap();
        s.update_chunk_metadata(cid, Metadata::new()).unwrap();
        assert_eq!(s.index_state, IndexState::Stale);

        s.index_state = IndexState::Ready;
        s.remove_chunk(cid).unwrap();
        assert_eq!(s.index_state, IndexState::Stale);
    }

    #[test]
    fn points_come_back_in_insertion_order() {
        let mut s = shard();
        let d1 = s.add_document("d1".into(), Metadata::new());
        let d2 = s.add_document("d2".into(), Metadata::new());
        let c1 = s.add_chunks(d1.id, vec![input(&[1.0]), input(&[2.0])]).unwrap();
        let c2 = s.add_chunks(d2.id, vec![input(&[3.0])]).unwrap();
        let c3 = s.add_chunks(d1.id, vec![input(&[4.0])]).unwrap();

        let ids: Vec<Uuid> = s.points().iter().map(|p| p.id).collect();
        assert_eq!(
            ids,
            vec![c1[0].id, c1[1].id, c3[0].id, c2[0].id],
            "document order, then per-document insertion order"
        );
    }

    #[test]
    fn unknown_ids_surface_not_found() {
        let mut s = shard();
        assert!(matches!(s.remove_document(Uuid::new_v4()), Err(Error::NotFound(_))));
        assert!(matches!(s.remove_chunk(Uuid::new_v4()), Err(Error::NotFound(_))));
        assert!(matches!(s.chunk(Uuid::new_v4()), Err(Error::NotFound(_))));
    }
}
