//! Unified `Store` trait, a single async interface for all persistence.
//!
//! Record-level operations only. No transaction spans more than one entity;
//! callers persist turns and files independently.

use async_trait::async_trait;
use uuid::Uuid;

use crate::conversation::{Content, FileEntry, Thread};
use crate::error::DatabaseError;
use crate::persona::Persona;

/// Backend-agnostic store for threads, turn contents, workspace files and personas.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Threads ─────────────────────────────────────────────────────

    /// Insert or replace a thread.
    async fn put_thread(&self, thread: &Thread) -> Result<(), DatabaseError>;

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, DatabaseError>;

    /// All threads, most recently updated first.
    async fn list_threads(&self) -> Result<Vec<Thread>, DatabaseError>;

    /// Delete a thread with its contents.
    async fn delete_thread(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Contents ────────────────────────────────────────────────────

    /// Insert or replace every content of a turn.
    async fn bulk_put_contents(
        &self,
        thread_id: Uuid,
        contents: &[Content],
    ) -> Result<(), DatabaseError>;

    /// Contents of a thread ordered by timestamp.
    async fn list_contents(&self, thread_id: Uuid) -> Result<Vec<Content>, DatabaseError>;

    // ── Files ───────────────────────────────────────────────────────

    /// Insert a file record with its optional binary payload.
    async fn add_file(&self, file: &FileEntry, blob: Option<Vec<u8>>) -> Result<(), DatabaseError>;

    /// Replace a file record, keeping its blob. Fails if the file is unknown.
    async fn update_file(&self, file: &FileEntry) -> Result<(), DatabaseError>;

    async fn get_file(&self, id: Uuid) -> Result<Option<FileEntry>, DatabaseError>;

    async fn get_file_blob(&self, id: Uuid) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// All files ordered by creation time.
    async fn list_files(&self) -> Result<Vec<FileEntry>, DatabaseError>;

    async fn delete_file(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Personas ────────────────────────────────────────────────────

    /// Insert or replace a user-registered persona.
    async fn put_persona(&self, persona: &Persona) -> Result<(), DatabaseError>;

    async fn list_personas(&self) -> Result<Vec<Persona>, DatabaseError>;

    async fn delete_persona(&self, id: &str) -> Result<(), DatabaseError>;
}
