//! In-memory application state and the events broadcast when it changes.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::conversation::{FileEntry, Thread, Turn};
use crate::llm::UploadState;
use crate::sandbox::WorkspaceMutation;

/// Change notifications for whoever renders the conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ThreadCreated { thread: Thread },
    /// Every streamed snapshot and every appended content.
    TurnUpdated { turn: Turn },
    FileAdded { file: FileEntry },
    FileUpdated { file: FileEntry },
    /// Structured data a tool returned alongside its result.
    ToolData {
        call_id: String,
        name: String,
        data: serde_json::Value,
    },
    LoadingChanged { loading: bool },
    PersonaRegistered { persona_id: String, name: String },
    UploadStatus { file_id: Uuid, state: UploadState },
}

/// Threads, turns and workspace files currently loaded.
#[derive(Debug, Default)]
pub struct AppState {
    pub threads: HashMap<Uuid, Thread>,
    pub active_thread_id: Option<Uuid>,
    /// Turns per thread, in conversation order.
    pub turns: HashMap<Uuid, Vec<Turn>>,
    pub files: Vec<FileEntry>,
    pub active_file_id: Option<Uuid>,
}

impl AppState {
    pub fn active_thread(&self) -> Option<&Thread> {
        self.active_thread_id.and_then(|id| self.threads.get(&id))
    }

    pub fn turns(&self, thread_id: Uuid) -> &[Turn] {
        self.turns.get(&thread_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace a turn by id, or append it.
    pub fn upsert_turn(&mut self, turn: &Turn) {
        let turns = self.turns.entry(turn.thread_id).or_default();
        match turns.iter_mut().find(|t| t.id == turn.id) {
            Some(existing) => *existing = turn.clone(),
            None => turns.push(turn.clone()),
        }
    }

    /// Files a thread can see.
    pub fn files_for(&self, thread_id: Uuid) -> Vec<FileEntry> {
        self.files
            .iter()
            .filter(|f| f.visible_in(thread_id))
            .cloned()
            .collect()
    }

    pub fn file_mut(&mut self, id: Uuid) -> Option<&mut FileEntry> {
        self.files.iter_mut().find(|f| f.id == id)
    }

    /// Hand every unowned session file to `thread_id`, returning the moved files.
    pub fn adopt_orphan_files(&mut self, thread_id: Uuid) -> Vec<FileEntry> {
        self.files
            .iter_mut()
            .filter(|f| f.is_orphan_session_file())
            .map(|f| {
                f.thread_id = Some(thread_id);
                f.clone()
            })
            .collect()
    }

    /// Apply a harvested mutation. Returns the changed file, if any.
    pub fn apply_mutation(&mut self, mutation: &WorkspaceMutation) -> Option<FileEntry> {
        match mutation {
            WorkspaceMutation::AddLayer { file_id, layer } => {
                let file = self.file_mut(*file_id)?;
                file.layers.push(layer.clone());
                Some(file.clone())
            }
            WorkspaceMutation::AttachArtifact { file_id, artifact } => {
                let file = self.file_mut(*file_id)?;
                file.artifacts.push(artifact.clone());
                Some(file.clone())
            }
            WorkspaceMutation::UpdateLayerData {
                file_id,
                layer_id,
                blocks,
            } => {
                let file = self.file_mut(*file_id)?;
                let layer = file.layers.iter_mut().find(|l| l.id == *layer_id)?;
                layer.data = blocks.clone();
                Some(file.clone())
            }
            WorkspaceMutation::UpdateFileMetadata { file_id, metadata } => {
                let file = self.file_mut(*file_id)?;
                for (key, value) in metadata {
                    file.metadata.insert(key.clone(), value.clone());
                }
                Some(file.clone())
            }
            WorkspaceMutation::PersonaRegistered { .. } => None,
        }
    }
}
