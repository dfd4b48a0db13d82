//! libSQL backend: async `Store` trait implementation.
//!
//! Structured values (thread config, content parts, file entries, persona
//! packages) are stored as JSON text columns. Supports local file and
//! in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::conversation::{Content, FileEntry, Role, Thread};
use crate::error::DatabaseError;
use crate::persona::Persona;
use crate::store::migrations;
use crate::store::traits::Store;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
        Role::Tool => "tool",
    }
}

fn str_to_role(s: &str) -> Role {
    match s {
        "model" => Role::Model,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_blob(b: Option<Vec<u8>>) -> libsql::Value {
    match b {
        Some(b) => libsql::Value::Blob(b),
        None => libsql::Value::Null,
    }
}

/// Column order: id, title, preview, config, updated_at
fn row_to_thread(row: &libsql::Row) -> Result<Thread, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("thread row parse: {e}"));
    let id: String = row.get(0).map_err(read)?;
    let config: String = row.get(3).map_err(read)?;
    let updated_at: String = row.get(4).map_err(read)?;
    Ok(Thread {
        id: parse_uuid(&id, "threads.id")?,
        title: row.get(1).map_err(read)?,
        preview: row.get::<String>(2).unwrap_or_default(),
        config: serde_json::from_str(&config)?,
        updated_at: parse_datetime(&updated_at),
    })
}

/// Column order: id, turn_id, role, parts, timestamp
fn row_to_content(row: &libsql::Row) -> Result<Content, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("content row parse: {e}"));
    let id: String = row.get(0).map_err(read)?;
    let turn_id: String = row.get(1).map_err(read)?;
    let role: String = row.get(2).map_err(read)?;
    let parts: String = row.get(3).map_err(read)?;
    let timestamp: String = row.get(4).map_err(read)?;
    Ok(Content {
        id: parse_uuid(&id, "contents.id")?,
        turn_id: parse_uuid(&turn_id, "contents.turn_id")?,
        role: str_to_role(&role),
        parts: serde_json::from_str(&parts)?,
        timestamp: parse_datetime(&timestamp),
    })
}

const THREAD_COLUMNS: &str = "id, title, preview, config, updated_at";

const CONTENT_COLUMNS: &str = "id, turn_id, role, parts, timestamp";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Threads ─────────────────────────────────────────────────────

    async fn put_thread(&self, thread: &Thread) -> Result<(), DatabaseError> {
        let config = serde_json::to_string(&thread.config)?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO threads (id, title, preview, config, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    thread.id.to_string(),
                    thread.title.clone(),
                    thread.preview.clone(),
                    config,
                    thread.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_thread: {e}")))?;
        debug!(thread_id = %thread.id, "Thread saved");
        Ok(())
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_thread(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_thread: {e}"))),
        }
    }

    async fn list_threads(&self) -> Result<Vec<Thread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM threads ORDER BY updated_at DESC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_threads: {e}")))?;

        let mut threads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            threads.push(row_to_thread(&row)?);
        }
        Ok(threads)
    }

    async fn delete_thread(&self, id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM contents WHERE thread_id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_thread contents: {e}")))?;
        conn.execute("DELETE FROM threads WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_thread: {e}")))?;
        Ok(())
    }

    // ── Contents ────────────────────────────────────────────────────

    async fn bulk_put_contents(
        &self,
        thread_id: Uuid,
        contents: &[Content],
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        for content in contents {
            let parts = serde_json::to_string(&content.parts)?;
            conn.execute(
                "INSERT OR REPLACE INTO contents (id, thread_id, turn_id, role, parts, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    content.id.to_string(),
                    thread_id.to_string(),
                    content.turn_id.to_string(),
                    role_to_str(content.role),
                    parts,
                    content.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("bulk_put_contents: {e}")))?;
        }
        Ok(())
    }

    async fn list_contents(&self, thread_id: Uuid) -> Result<Vec<Content>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONTENT_COLUMNS} FROM contents WHERE thread_id = ?1 ORDER BY timestamp ASC"
                ),
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_contents: {e}")))?;

        let mut contents = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            contents.push(row_to_content(&row)?);
        }
        Ok(contents)
    }

    // ── Files ───────────────────────────────────────────────────────

    async fn add_file(&self, file: &FileEntry, blob: Option<Vec<u8>>) -> Result<(), DatabaseError> {
        let entry = serde_json::to_string(file)?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO files (id, name, category, thread_id, entry, blob, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    file.id.to_string(),
                    file.name.clone(),
                    file.category.to_string(),
                    opt_text(file.thread_id.map(|t| t.to_string())),
                    entry,
                    opt_blob(blob),
                    file.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_file: {e}")))?;
        debug!(file_id = %file.id, name = %file.name, "File saved");
        Ok(())
    }

    async fn update_file(&self, file: &FileEntry) -> Result<(), DatabaseError> {
        let entry = serde_json::to_string(file)?;
        let updated = self
            .conn()
            .execute(
                "UPDATE files SET name = ?1, category = ?2, thread_id = ?3, entry = ?4 WHERE id = ?5",
                params![
                    file.name.clone(),
                    file.category.to_string(),
                    opt_text(file.thread_id.map(|t| t.to_string())),
                    entry,
                    file.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_file: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "file".into(),
                id: file.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<FileEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT entry FROM files WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_file: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let entry: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_file row parse: {e}")))?;
                Ok(Some(serde_json::from_str(&entry)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_file: {e}"))),
        }
    }

    async fn get_file_blob(&self, id: Uuid) -> Result<Option<Vec<u8>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT blob FROM files WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_file_blob: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => match row.get_value(0) {
                Ok(libsql::Value::Blob(bytes)) => Ok(Some(bytes)),
                Ok(_) => Ok(None),
                Err(e) => Err(DatabaseError::Query(format!("get_file_blob row parse: {e}"))),
            },
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_file_blob: {e}"))),
        }
    }

    async fn list_files(&self) -> Result<Vec<FileEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT entry FROM files ORDER BY created_at ASC", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_files: {e}")))?;

        let mut files = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let entry: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("list_files row parse: {e}")))?;
            files.push(serde_json::from_str(&entry)?);
        }
        Ok(files)
    }

    async fn delete_file(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM files WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_file: {e}")))?;
        Ok(())
    }

    // ── Personas ────────────────────────────────────────────────────

    async fn put_persona(&self, persona: &Persona) -> Result<(), DatabaseError> {
        let package = serde_json::to_string(persona)?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO personas (id, name, package, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    persona.id().to_string(),
                    persona.manifest.name.clone(),
                    package,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_persona: {e}")))?;
        Ok(())
    }

    async fn list_personas(&self) -> Result<Vec<Persona>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT package FROM personas ORDER BY id ASC", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_personas: {e}")))?;

        let mut personas = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let package: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("list_personas row parse: {e}")))?;
            personas.push(serde_json::from_str(&package)?);
        }
        Ok(personas)
    }

    async fn delete_persona(&self, id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM personas WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_persona: {e}")))?;
        Ok(())
    }
}
