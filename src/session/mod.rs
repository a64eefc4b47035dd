//! Session store
//!
//! Owns every session's transcript and document index. Each session sits
//! behind its own lock; the map lock is only held to find or replace an
//! entry. A session runs at most one turn at a time ([`TurnGuard`]).

use crate::config::Settings;
use crate::documents::DocumentLoader;
use crate::error::AgentError;
use crate::models::{Turn, UploadedFile};
use crate::retrieval::{Chunk, DocumentIndex, DocumentRecord, Embedder};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

//
// ================= Identity =================
//

/// Opaque session token chosen by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Use the supplied id, or a fresh one when it is missing or blank.
    pub fn resolve(requested: Option<&str>) -> Self {
        match requested.map(str::trim) {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

//
// ================= Session state =================
//

struct Session {
    transcript: Vec<Turn>,
    index: Arc<DocumentIndex>,
    file_count: usize,
    /// Files admitted against the quota but not yet indexed.
    reserved_files: usize,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
}

impl Session {
    fn new(dimensions: usize) -> Self {
        let now = Utc::now();
        Self {
            transcript: Vec::new(),
            index: Arc::new(DocumentIndex::new(dimensions)),
            file_count: 0,
            reserved_files: 0,
            created_at: now,
            last_active_at: now,
        }
    }
}

struct SessionSlot {
    state: Mutex<Session>,
    in_flight: AtomicBool,
    last_touched: std::sync::Mutex<Instant>,
}

impl SessionSlot {
    fn new(dimensions: usize) -> Self {
        Self {
            state: Mutex::new(Session::new(dimensions)),
            in_flight: AtomicBool::new(false),
            last_touched: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_touched.lock() {
            *t = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_touched
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn is_expired(&self, expiry: Duration) -> bool {
        !self.is_busy() && self.idle_for() >= expiry
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub transcript: Vec<Turn>,
    pub file_count: usize,
    pub documents: Vec<DocumentRecord>,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

//
// ================= Turn guard =================
//

/// Marks a session as running a turn until dropped.
pub struct TurnGuard {
    id: SessionId,
    slot: Arc<SessionSlot>,
}

impl TurnGuard {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    pub async fn transcript(&self) -> Vec<Turn> {
        self.slot.state.lock().await.transcript.clone()
    }

    /// Current index version; later uploads do not affect the returned copy.
    pub async fn index(&self) -> Arc<DocumentIndex> {
        Arc::clone(&self.slot.state.lock().await.index)
    }

    pub async fn file_count(&self) -> usize {
        self.slot.state.lock().await.file_count
    }

    /// Append turns in order. If the session was cleared mid-turn they go
    /// to the detached state and are dropped with it.
    pub async fn append_turns(&self, turns: impl IntoIterator<Item = Turn>) {
        let mut session = self.slot.state.lock().await;
        session.transcript.extend(turns);
        session.last_active_at = Utc::now();
        self.slot.touch();
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.slot.touch();
        self.slot.in_flight.store(false, Ordering::Release);
    }
}

//
// ================= Store =================
//

pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    loader: DocumentLoader,
    embedder: Arc<dyn Embedder>,
    max_files: usize,
    expiry: Duration,
}

impl SessionStore {
    pub fn new(
        loader: DocumentLoader,
        embedder: Arc<dyn Embedder>,
        max_files: usize,
        expiry: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            loader,
            embedder,
            max_files,
            expiry,
        }
    }

    pub fn from_settings(settings: &Settings, embedder: Arc<dyn Embedder>) -> Self {
        Self::new(
            DocumentLoader::from_settings(settings),
            embedder,
            settings.max_files_per_session,
            settings.session_expiry,
        )
    }

    pub fn max_files(&self) -> usize {
        self.max_files
    }

    async fn slot(&self, id: &SessionId) -> Arc<SessionSlot> {
        {
            let sessions = self.sessions.read().await;
            if let Some(slot) = sessions.get(id) {
                if !slot.is_expired(self.expiry) {
                    slot.touch();
                    return Arc::clone(slot);
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        // Re-check: another request may have created or refreshed it.
        if let Some(slot) = sessions.get(id) {
            if !slot.is_expired(self.expiry) {
                slot.touch();
                return Arc::clone(slot);
            }
            info!(session_id = %id, "Session expired; starting over");
        } else {
            info!(session_id = %id, "Creating session");
        }

        let slot = Arc::new(SessionSlot::new(self.embedder.dimensions()));
        sessions.insert(id.clone(), Arc::clone(&slot));
        slot
    }

    async fn existing(&self, id: &SessionId) -> Result<Arc<SessionSlot>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::InvalidRequest(format!("unknown session {}", id)))
    }

    /// Resolve a session, creating it (or replacing an expired one).
    pub async fn get_or_create(&self, id: &SessionId) -> SessionSnapshot {
        let slot = self.slot(id).await;
        snapshot_of(id, &slot).await
    }

    /// Claim the session for one turn. Fails if a turn is already running.
    pub async fn begin_turn(&self, id: &SessionId) -> Result<TurnGuard> {
        let slot = self.slot(id).await;
        if slot
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(session_id = %id, "Rejecting request for busy session");
            return Err(AgentError::SessionBusy(id.to_string()));
        }
        Ok(TurnGuard {
            id: id.clone(),
            slot,
        })
    }

    pub async fn append_turn(&self, id: &SessionId, turn: Turn) -> Result<()> {
        let slot = self.existing(id).await?;
        let mut session = slot.state.lock().await;
        session.transcript.push(turn);
        session.last_active_at = Utc::now();
        slot.touch();
        Ok(())
    }

    /// Index uploaded files into a session, creating it if needed.
    /// Returns the number of chunks added.
    pub async fn add_documents(&self, id: &SessionId, files: Vec<UploadedFile>) -> Result<usize> {
        let slot = self.slot(id).await;
        self.add_to_slot(id, &slot, files).await
    }

    /// [`SessionStore::add_documents`] for the session a turn is running on.
    pub async fn attach_documents(&self, guard: &TurnGuard, files: Vec<UploadedFile>) -> Result<usize> {
        self.add_to_slot(&guard.id, &guard.slot, files).await
    }

    async fn add_to_slot(
        &self,
        id: &SessionId,
        slot: &SessionSlot,
        files: Vec<UploadedFile>,
    ) -> Result<usize> {
        if files.is_empty() {
            return Ok(0);
        }
        self.loader.validate_batch(&files)?;

        let requested = files.len();

        // -------------------------------------------------
        // Reserve quota so concurrent uploads cannot overshoot
        // -------------------------------------------------
        {
            let mut session = slot.state.lock().await;
            let current = session.file_count + session.reserved_files;
            if current + requested > self.max_files {
                warn!(
                    session_id = %id,
                    limit = self.max_files,
                    current = session.file_count,
                    requested,
                    "Upload rejected: file quota exceeded"
                );
                return Err(AgentError::QuotaExceeded {
                    limit: self.max_files,
                    current: session.file_count,
                    requested,
                });
            }
            session.reserved_files += requested;
        }

        // -------------------------------------------------
        // Extract, chunk and embed without holding the lock
        // -------------------------------------------------
        let loader = self.loader.clone();
        let embedder = Arc::clone(&self.embedder);
        let prepared = tokio::task::spawn_blocking(move || prepare_documents(&loader, embedder.as_ref(), &files))
            .await
            .map_err(|e| AgentError::Embedding(format!("indexing task failed: {}", e)))
            .and_then(|r| r);

        let mut session = slot.state.lock().await;
        session.reserved_files -= requested;

        let prepared = prepared?;

        // -------------------------------------------------
        // Commit
        // -------------------------------------------------
        // Build the next index version aside; the session only sees it once
        // every document of the batch is in.
        let mut added = 0;
        let mut next = DocumentIndex::clone(&session.index);
        let dimensions = next.dimensions();
        for (record, chunks) in prepared {
            added += next.insert_document(record, chunks).map_err(|width| {
                AgentError::Embedding(format!(
                    "embedding width {} does not match index width {}",
                    width, dimensions
                ))
            })?;
        }
        session.index = Arc::new(next);
        session.file_count += requested;
        session.last_active_at = Utc::now();
        slot.touch();

        info!(
            session_id = %id,
            files = requested,
            chunks = added,
            file_count = session.file_count,
            "Documents indexed"
        );
        Ok(added)
    }

    /// Drop a session's transcript and index. Returns whether it existed.
    pub async fn clear(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(slot) => {
                let mut session = slot.state.lock().await;
                session.transcript.clear();
                session.index = Arc::new(DocumentIndex::new(self.embedder.dimensions()));
                info!(session_id = %id, "Session cleared");
                true
            }
            None => false,
        }
    }

    /// Remove idle sessions. Sessions running a turn are kept.
    pub async fn evict_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, slot| !slot.is_expired(self.expiry));
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, remaining = sessions.len(), "Evicted idle sessions");
        } else {
            debug!(sessions = sessions.len(), "No idle sessions to evict");
        }
        evicted
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        let slot = self.sessions.read().await.get(id).cloned()?;
        Some(snapshot_of(id, &slot).await)
    }

    /// Current index version of a session, if it exists.
    pub async fn index(&self, id: &SessionId) -> Option<Arc<DocumentIndex>> {
        let slot = self.sessions.read().await.get(id).cloned()?;
        let session = slot.state.lock().await;
        Some(Arc::clone(&session.index))
    }
}

async fn snapshot_of(id: &SessionId, slot: &SessionSlot) -> SessionSnapshot {
    let session = slot.state.lock().await;
    SessionSnapshot {
        id: id.clone(),
        transcript: session.transcript.clone(),
        file_count: session.file_count,
        documents: session.index.documents().to_vec(),
        chunk_count: session.index.len(),
        created_at: session.created_at,
        last_active_at: session.last_active_at,
    }
}

/// Load and embed a whole batch; any failure rejects all of it.
fn prepare_documents(
    loader: &DocumentLoader,
    embedder: &dyn Embedder,
    files: &[UploadedFile],
) -> Result<Vec<(DocumentRecord, Vec<Chunk>)>> {
    files
        .iter()
        .map(|file| {
            let loaded = loader.load(file)?;
            let texts: Vec<&str> = loaded.chunks.iter().map(String::as_str).collect();
            let vectors = embedder.embed_batch(&texts)?;

            let id = Uuid::new_v4();
            let chunks: Vec<Chunk> = loaded
                .chunks
                .iter()
                .zip(vectors)
                .enumerate()
                .map(|(sequence_index, (text, embedding))| Chunk {
                    source_document_id: id,
                    source_name: loaded.name.clone(),
                    text: text.clone(),
                    embedding,
                    sequence_index,
                })
                .collect();

            let record = DocumentRecord {
                id,
                name: loaded.name.clone(),
                content_hash: loaded.content_hash.clone(),
                chunk_count: chunks.len(),
                added_at: Utc::now(),
            };
            Ok((record, chunks))
        })
        .collect()
}
