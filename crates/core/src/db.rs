//! The concurrency envelope: every public operation of the engine.
//!
//! Two lock tiers. The catalogue lock protects library membership and is
//! held in write mode only for create/delete, in read mode just long
//! enough to clone a library handle. Each library handle wraps that
//! library's shard (documents, chunks, index, state) in its own
//! reader/writer lock: mutations and index builds take it in write mode,
//! searches in read mode. Lock poisoning means a writer panicked
//! mid-invariant; that brings the process down rather than serving
//! corrupt state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filter::{Filter, Metadata};
use crate::index::{AnyIndex, IndexStats, VectorIndex};
use crate::model::{Chunk, Document, IndexConfig, IndexKind, Library, LshParams};
use crate::store::{ChunkInput, IndexState, LibraryShard};
use crate::vector::validate_embedding;

const POISON: &str = "library lock poisoned";
const CATALOG_POISON: &str = "catalogue lock poisoned";

// ---------------------------------------------------------------------------
// Handles and result types
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LibraryCell {
    shard: RwLock<LibraryShard>,
}

/// One search result, materialized from the chunk table at the result
/// boundary — the index itself only ever saw the chunk id.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub distance: f64,
}

/// Index stats plus entity counts, as served by the stats endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LibraryStats {
    pub library: Library,
    pub documents: usize,
    pub chunks: usize,
    pub index_state: IndexState,
    pub index: Option<IndexStats>,
}

/// Fields accepted by a library update; `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct LibraryUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
    pub index_kind: Option<IndexKind>,
    pub lsh: Option<LshParams>,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// The engine. Cheap to share: clone an `Arc<Database>` per connection.
#[derive(Debug)]
pub struct Database {
    catalog: RwLock<HashMap<Uuid, Arc<LibraryCell>>>,
    defaults: IndexConfig,
    /// Bumped on every mutation; the persistence loop uses it to skip
    /// writes when nothing changed.
    generation: AtomicU64,
}

impl Database {
    pub fn new(defaults: IndexConfig) -> Self {
        Self {
            catalog: RwLock::new(HashMap::new()),
            defaults,
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Catalogue read lock, held only long enough to clone the handle.
    fn cell(&self, library_id: Uuid) -> Result<Arc<LibraryCell>> {
        let catalog = self.catalog.read().expect(CATALOG_POISON);
        catalog
            .get(&library_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("library {library_id}")))
    }

    // -----------------------------------------------------------------------
    // Libraries
    // -----------------------------------------------------------------------

    pub fn create_library(
        &self,
        name: String,
        description: String,
        metadata: Metadata,
        index_kind: Option<IndexKind>,
        lsh: Option<LshParams>,
    ) -> Library {
        let mut config = self.defaults.clone();
        if let Some(kind) = index_kind {
            config.kind = kind;
        }
        if let Some(lsh) = lsh {
            config.lsh = lsh;
        }
        let library = Library::new(name, description, metadata, config);
        let cell = Arc::new(LibraryCell { shard: RwLock::new(LibraryShard::new(library.clone())) });

        let mut catalog = self.catalog.write().expect(CATALOG_POISON);
        catalog.insert(library.id, cell);
        drop(catalog);

        self.touch();
        info!(library = %library.id, name = library.name.as_str(), "created library");
        library
    }

    pub fn list_libraries(&self) -> Vec<Library> {
        let cells: Vec<Arc<LibraryCell>> = {
            let catalog = self.catalog.read().expect(CATALOG_POISON);
            catalog.values().cloned().collect()
        };
        let mut libraries: Vec<Library> = cells
            .iter()
            .map(|c| c.shard.read().expect(POISON).library.clone())
            .collect();
        libraries.sort_by_key(|l| (l.created_at, l.id));
        libraries
    }

    pub fn get_library(&self, id: Uuid) -> Result<Library> {
        let cell = self.cell(id)?;
        let shard = cell.shard.read().expect(POISON);
        Ok(shard.library.clone())
    }

    pub fn update_library(&self, id: Uuid, update: LibraryUpdate) -> Result<Library> {
        let cell = self.cell(id)?;
        let mut shard = cell.shard.write().expect(POISON);
        if let Some(name) = update.name {
            shard.library.name = name;
        }
        if let Some(description) = update.description {
            shard.library.description = description;
        }
        if let Some(metadata) = update.metadata {
            shard.library.metadata = metadata;
        }
        let mut reindex = false;
        if let Some(kind) = update.index_kind {
            reindex = shard.library.index_config.kind != kind;
            shard.library.index_config.kind = kind;
        }
        if let Some(lsh) = update.lsh {
            reindex |= shard.library.index_config.lsh != lsh
                && shard.library.index_config.kind == IndexKind::Lsh;
            shard.library.index_config.lsh = lsh;
        }
        if reindex {
            // The current index no longer matches the configuration.
            shard.index = None;
            shard.index_state = IndexState::Empty;
            shard.library.index_built_at = None;
        }
        shard.library.updated_at = chrono::Utc::now();
        let library = shard.library.clone();
        drop(shard);
        self.touch();
        Ok(library)
    }

    /// Cascading delete: the library, its documents, chunks, and index all
    /// go together once the handle leaves the catalogue.
    pub fn delete_library(&self, id: Uuid) -> Result<()> {
        let mut catalog = self.catalog.write().expect(CATALOG_POISON);
        if catalog.remove(&id).is_none() {
            return Err(Error::NotFound(format!("library {id}")));
        }
        drop(catalog);
        self.touch();
        info!(library = %id, "deleted library");
        Ok(())
    }

    pub fn library_stats(&self, id: Uuid) -> Result<LibraryStats> {
        let cell = self.cell(id)?;
        let shard = cell.shard.read().expect(POISON);
        Ok(LibraryStats {
            library: shard.library.clone(),
            documents: shard.documents.len(),
            chunks: shard.chunk_count(),
            index_state: shard.index_state,
            index: shard.index.as_ref().map(|i| i.stats()),
        })
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    pub fn create_document(&self, library_id: Uuid, name: String, metadata: Metadata) -> Result<Document> {
        let cell = self.cell(library_id)?;
        let mut shard = cell.shard.write().expect(POISON);
        let doc = shard.add_document(name, metadata);
        drop(shard);
        self.touch();
        Ok(doc)
    }

    pub fn list_documents(&self, library_id: Uuid) -> Result<Vec<Document>> {
        let cell = self.cell(library_id)?;
        let shard = cell.shard.read().expect(POISON);
        Ok(shard
            .doc_order
            .iter()
            .filter_map(|id| shard.documents.get(id))
            .cloned()
            .collect())
    }

    pub fn get_document(&self, library_id: Uuid, document_id: Uuid) -> Result<Document> {
        let cell = self.cell(library_id)?;
        let shard = cell.shard.read().expect(POISON);
        shard
            .documents
            .get(&document_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("document {document_id}")))
    }

    pub fn delete_document(&self, library_id: Uuid, document_id: Uuid) -> Result<()> {
        let cell = self.cell(library_id)?;
        let mut shard = cell.shard.write().expect(POISON);
        shard.remove_document(document_id)?;
        drop(shard);
        self.touch();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    pub fn add_chunks(
        &self,
        library_id: Uuid,
        document_id: Uuid,
        inputs: Vec<ChunkInput>,
    ) -> Result<Vec<Chunk>> {
        let cell = self.cell(library_id)?;
        let mut shard = cell.shard.write().expect(POISON);
        let created = shard.add_chunks(document_id, inputs)?;
        drop(shard);
        self.touch();
        debug!(library = %library_id, count = created.len(), "appended chunks");
        Ok(created)
    }

    pub fn get_chunk(&self, library_id: Uuid, chunk_id: Uuid) -> Result<Chunk> {
        let cell = self.cell(library_id)?;
        let shard = cell.shard.read().expect(POISON);
        shard.chunk(chunk_id).cloned()
    }

    pub fn update_chunk_metadata(
        &self,
        library_id: Uuid,
        chunk_id: Uuid,
        metadata: Metadata,
    ) -> Result<Chunk> {
        let cell = self.cell(library_id)?;
        let mut shard = cell.shard.write().expect(POISON);
        let chunk = shard.update_chunk_metadata(chunk_id, metadata)?;
        drop(shard);
        self.touch();
        Ok(chunk)
    }

    pub fn delete_chunk(&self, library_id: Uuid, chunk_id: Uuid) -> Result<()> {
        let cell = self.cell(library_id)?;
        let mut shard = cell.shard.write().expect(POISON);
        shard.remove_chunk(chunk_id)?;
        drop(shard);
        self.touch();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Index lifecycle
    // -----------------------------------------------------------------------

    /// Explicit build. Optionally switches the library's index kind first.
    /// Building an empty library is a precondition failure.
    pub fn build_index(&self, library_id: Uuid, kind: Option<IndexKind>) -> Result<IndexStats> {
        let cell = self.cell(library_id)?;
        let mut shard = cell.shard.write().expect(POISON);
        if shard.chunk_count() == 0 {
            return Err(Error::conflict("cannot index an empty library"));
        }
        if let Some(kind) = kind {
            shard.library.index_config.kind = kind;
        }
        Self::build_locked(&mut shard)?;
        let stats = shard
            .index
            .as_ref()
            .map(|i| i.stats())
            .ok_or_else(|| Error::Internal("index missing after build".into()))?;
        drop(shard);
        self.touch();
        Ok(stats)
    }

    /// Rebuild under an already-held write lock. The exclusive lock is the
    /// build token: concurrent searchers that observed Stale/Empty block on
    /// acquisition and re-check the state once they get in, so exactly one
    /// build runs per library however many searchers raced to it.
    fn build_locked(shard: &mut LibraryShard) -> Result<()> {
        shard.index_state = IndexState::Building;
        let points = shard.points();
        let count = points.len();
        let started = std::time::Instant::now();
        let config = shard.library.index_config.clone();
        let index = match AnyIndex::build_from(&config, points) {
            Ok(index) => index,
            Err(e) => {
                // Failed build leaves the previous index (if any) in place.
                shard.index_state =
                    if shard.index.is_some() { IndexState::Stale } else { IndexState::Empty };
                return Err(e);
            }
        };
        shard.index = Some(index);
        shard.index_state = IndexState::Ready;
        shard.library.index_built_at = Some(chrono::Utc::now());
        info!(
            library = %shard.library.id,
            kind = config.kind.as_str(),
            points = count,
            time_ms = started.elapsed().as_millis() as u64,
            "index built"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// k-NN over one library with optional metadata filtering. Takes a
    /// read lease; lazily (re)builds the index first when it is stale or
    /// absent, coalescing concurrent builders (double-checked under the
    /// write lock).
    pub fn search(
        &self,
        library_id: Uuid,
        query: &[f64],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Err(Error::invalid("k must be at least 1"));
        }
        validate_embedding(query)?;
        if let Some(filter) = filter {
            filter.validate()?;
        }

        let cell = self.cell(library_id)?;
        loop {
            let shard = cell.shard.read().expect(POISON);
            if shard.chunk_count() == 0 {
                return Ok(Vec::new());
            }
            match shard.library.dimension {
                Some(d) if d != query.len() => {
                    return Err(Error::Invalid(format!(
                        "query has dimension {}, library is fixed at {d}",
                        query.len()
                    )));
                }
                _ => {}
            }
            if shard.index_state == IndexState::Ready {
                return Self::search_shard(&shard, query, k, filter);
            }
            drop(shard);

            // Stale or absent: upgrade to write and re-check — another
            // searcher may have built while we waited for the lock.
            let mut shard = cell.shard.write().expect(POISON);
            if shard.index_state != IndexState::Ready && shard.chunk_count() > 0 {
                Self::build_locked(&mut shard)?;
            }
            // Loop back to search under a fresh read lease.
        }
    }

    /// Search against a Ready shard under a read lease.
    fn search_shard(
        shard: &LibraryShard,
        query: &[f64],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchHit>> {
        let index = shard
            .index
            .as_ref()
            .ok_or_else(|| Error::Internal("ready state without an index".into()))?;

        let accept_closure = filter.map(|f| {
            move |id: Uuid| match shard.chunks.get(&id) {
                Some(chunk) => {
                    let doc_meta = shard.documents.get(&chunk.document_id).map(|d| &d.metadata);
                    f.matches(&chunk.metadata, doc_meta)
                }
                None => false,
            }
        });
        let accept: Option<&dyn Fn(Uuid) -> bool> =
            accept_closure.as_ref().map(|c| c as &dyn Fn(Uuid) -> bool);

        let hits = index.search(query, k, accept)?;

        // Strict LSH: a shortfall attributable to the approximation (the
        // library holds at least k chunks and no filter thinned them)
        // surfaces as Degraded rather than silently short results.
        if hits.len() < k
            && filter.is_none()
            && shard.chunk_count() >= k
            && matches!(index, AnyIndex::Lsh(_))
            && shard.library.index_config.lsh.strict
        {
            return Err(Error::Degraded(format!(
                "strict lsh search returned {} of {k} requested results",
                hits.len()
            )));
        }

        hits.into_iter()
            .map(|hit| {
                shard
                    .chunk(hit.chunk_id)
                    .map(|chunk| SearchHit { chunk: chunk.clone(), distance: hit.distance })
            })
            .collect()
    }

    /// Cross-library search: each library is snapshotted independently (no
    /// global consistent cut), then the per-library rankings merge by
    /// distance and truncate to k.
    pub fn multi_search(
        &self,
        library_ids: &[Uuid],
        query: &[f64],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchHit>> {
        if library_ids.is_empty() {
            return Err(Error::invalid("library_ids must not be empty"));
        }
        let mut merged: Vec<SearchHit> = Vec::new();
        for &id in library_ids {
            merged.extend(self.search(id, query, k, filter)?);
        }
        merged.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        merged.truncate(k);
        Ok(merged)
    }

    // -----------------------------------------------------------------------
    // Snapshot support
    // -----------------------------------------------------------------------

    /// Clone the full entity state in dependency order, snapshotting each
    /// library under its own read lease. No lock is held across file I/O —
    /// the caller serializes the returned owned data.
    pub fn export_entities(&self) -> (Vec<Library>, Vec<Document>, Vec<Chunk>) {
        let mut libraries = Vec::new();
        let mut documents = Vec::new();
        let mut chunks = Vec::new();

        let cells: Vec<Arc<LibraryCell>> = {
            let catalog = self.catalog.read().expect(CATALOG_POISON);
            catalog.values().cloned().collect()
        };
        let mut shards: Vec<(Library, Arc<LibraryCell>)> = cells
            .into_iter()
            .map(|c| {
                let lib = c.shard.read().expect(POISON).library.clone();
                (lib, c)
            })
            .collect();
        shards.sort_by_key(|(lib, _)| (lib.created_at, lib.id));

        for (_, cell) in shards {
            let shard = cell.shard.read().expect(POISON);
            libraries.push(shard.library.clone());
            for doc_id in &shard.doc_order {
                if let Some(doc) = shard.documents.get(doc_id) {
                    documents.push(doc.clone());
                }
                if let Some(chunk_ids) = shard.chunk_order.get(doc_id) {
                    chunks.extend(chunk_ids.iter().filter_map(|c| shard.chunks.get(c)).cloned());
                }
            }
        }
        (libraries, documents, chunks)
    }

    /// Rebuild a database from validated snapshot entities. Indexes are not
    /// materialized here; every library comes back Empty and rebuilds on
    /// first search.
    pub(crate) fn from_entities(
        defaults: IndexConfig,
        libraries: Vec<Library>,
        documents: Vec<Document>,
        chunks: Vec<Chunk>,
    ) -> Result<Self> {
        let db = Database::new(defaults);
        {
            let mut catalog = db.catalog.write().expect(CATALOG_POISON);
            for library in libraries {
                // Timestamps and ids come back exactly as saved; only the
                // materialized index is gone, so chunk-bearing libraries
                // start Empty and rebuild on first search.
                let shard = LibraryShard::new(library);
                catalog.insert(shard.library.id, Arc::new(LibraryCell { shard: RwLock::new(shard) }));
            }
            for doc in documents {
                let cell = catalog.get(&doc.library_id).ok_or_else(|| {
                    Error::Io(format!("snapshot document {} references unknown library", doc.id))
                })?;
                let mut shard = cell.shard.write().expect(POISON);
                shard.doc_order.push(doc.id);
                shard.chunk_order.insert(doc.id, Vec::new());
                shard.documents.insert(doc.id, doc);
            }
            for chunk in chunks {
                let cell = catalog.get(&chunk.library_id).ok_or_else(|| {
                    Error::Io(format!("snapshot chunk {} references unknown library", chunk.id))
                })?;
                let mut shard = cell.shard.write().expect(POISON);
                if !shard.documents.contains_key(&chunk.document_id) {
                    return Err(Error::Io(format!(
                        "snapshot chunk {} references unknown document",
                        chunk.id
                    )));
                }
                shard
                    .chunk_order
                    .get_mut(&chunk.document_id)
                    .expect("order entry created with document")
                    .push(chunk.id);
                shard.chunks.insert(chunk.id, chunk);
            }
            for cell in catalog.values() {
                let shard = cell.shard.read().expect(POISON);
                shard.check_invariants().map_err(|e| Error::Io(e.to_string()))?;
            }
        }
        Ok(db)
    }
}
