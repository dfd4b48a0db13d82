//! In-memory `Store`, for tests and embedders that do not need durability.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::conversation::{Content, FileEntry, Thread};
use crate::error::DatabaseError;
use crate::persona::Persona;
use crate::store::traits::Store;

#[derive(Default)]
struct Tables {
    threads: HashMap<Uuid, Thread>,
    /// Content id to (thread id, content).
    contents: HashMap<Uuid, (Uuid, Content)>,
    files: HashMap<Uuid, (FileEntry, Option<Vec<u8>>)>,
    personas: HashMap<String, Persona>,
}

/// Store backed by hash maps behind a lock.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn put_thread(&self, thread: &Thread) -> Result<(), DatabaseError> {
        self.tables
            .write()
            .await
            .threads
            .insert(thread.id, thread.clone());
        Ok(())
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, DatabaseError> {
        Ok(self.tables.read().await.threads.get(&id).cloned())
    }

    async fn list_threads(&self) -> Result<Vec<Thread>, DatabaseError> {
        let mut threads: Vec<Thread> = self.tables.read().await.threads.values().cloned().collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }

    async fn delete_thread(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut tables = self.tables.write().await;
        tables.threads.remove(&id);
        tables.contents.retain(|_, (thread_id, _)| *thread_id != id);
        Ok(())
    }

    async fn bulk_put_contents(
        &self,
        thread_id: Uuid,
        contents: &[Content],
    ) -> Result<(), DatabaseError> {
        let mut tables = self.tables.write().await;
        for content in contents {
            tables
                .contents
                .insert(content.id, (thread_id, content.clone()));
        }
        Ok(())
    }

    async fn list_contents(&self, thread_id: Uuid) -> Result<Vec<Content>, DatabaseError> {
        let mut contents: Vec<Content> = self
            .tables
            .read()
            .await
            .contents
            .values()
            .filter(|(t, _)| *t == thread_id)
            .map(|(_, c)| c.clone())
            .collect();
        contents.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(contents)
    }

    async fn add_file(&self, file: &FileEntry, blob: Option<Vec<u8>>) -> Result<(), DatabaseError> {
        self.tables
            .write()
            .await
            .files
            .insert(file.id, (file.clone(), blob));
        Ok(())
    }

    async fn update_file(&self, file: &FileEntry) -> Result<(), DatabaseError> {
        let mut tables = self.tables.write().await;
        match tables.files.get_mut(&file.id) {
            Some((entry, _)) => {
                *entry = file.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound {
                entity: "file".into(),
                id: file.id.to_string(),
            }),
        }
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<FileEntry>, DatabaseError> {
        Ok(self.tables.read().await.files.get(&id).map(|(f, _)| f.clone()))
    }

    async fn get_file_blob(&self, id: Uuid) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self
            .tables
            .read()
            .await
            .files
            .get(&id)
            .and_then(|(_, blob)| blob.clone()))
    }

    async fn list_files(&self) -> Result<Vec<FileEntry>, DatabaseError> {
        let mut files: Vec<FileEntry> = self
            .tables
            .read()
            .await
            .files
            .values()
            .map(|(f, _)| f.clone())
            .collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(files)
    }

    async fn delete_file(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.tables.write().await.files.remove(&id);
        Ok(())
    }

    async fn put_persona(&self, persona: &Persona) -> Result<(), DatabaseError> {
        self.tables
            .write()
            .await
            .personas
            .insert(persona.id().to_string(), persona.clone());
        Ok(())
    }

    async fn list_personas(&self) -> Result<Vec<Persona>, DatabaseError> {
        let mut personas: Vec<Persona> =
            self.tables.read().await.personas.values().cloned().collect();
        personas.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        Ok(personas)
    }

    async fn delete_persona(&self, id: &str) -> Result<(), DatabaseError> {
        self.tables.write().await.personas.remove(id);
        Ok(())
    }
}
