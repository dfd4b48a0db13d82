//! The agent orchestrator.
//!
//! Drives an assistant turn from creation to a terminal status by
//! alternating model rounds with capability or embedded-code execution:
//! stream → inspect → execute → stream again, until a round produces
//! neither a function call nor an executable fence.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::loop_state::LoopState;
use crate::agent::state::{AgentEvent, AppState};
use crate::config::AgentConfig;
use crate::conversation::{
    Content, FileEntry, FunctionCall, FunctionResponse, GeneratedFile, Part, Role, Thread,
    ThreadConfig, Turn, TurnStatus, hydrate_turns,
};
use crate::error::{DatabaseError, Error, Result};
use crate::llm::{
    ModelStreamer, OutgoingMessage, StreamRequest, UploadState, UploadStatusFn, model_history,
    turn_history,
};
use crate::parser::{SYSTEM_OUTPUT_PREFIX, extract_executable_blocks};
use crate::persona::{PersonaActivator, PersonaRegistry};
use crate::sandbox::{CodeRunner, WorkspaceMutation};
use crate::store::Store;
use crate::tools::{ToolContext, ToolOutput, ToolRegistry};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Core dependencies for the orchestrator.
///
/// Bundles the shared components to reduce argument count.
pub struct AgentDeps {
    pub store: Arc<dyn Store>,
    pub streamer: Arc<dyn ModelStreamer>,
    pub tools: Arc<ToolRegistry>,
    pub runner: Arc<CodeRunner>,
    pub personas: Arc<PersonaRegistry>,
    pub activator: Arc<PersonaActivator>,
}

/// A message typed by the user.
#[derive(Debug, Clone, Default)]
pub struct UserMessage {
    pub text: String,
    pub persona_id: Option<String>,
    /// Ids of workspace files attached to the message.
    pub attached_files: Vec<Uuid>,
    pub model_hint: Option<String>,
}

impl UserMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_persona(mut self, persona_id: impl Into<String>) -> Self {
        self.persona_id = Some(persona_id.into());
        self
    }

    pub fn with_attachments(mut self, files: Vec<Uuid>) -> Self {
        self.attached_files = files;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_hint = Some(model.into());
        self
    }
}

/// What happened to a `send_message` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Another message was still in flight; nothing was done.
    Busy,
    /// The assistant turn reached a terminal status.
    Finished(Turn),
}

/// Inputs of one turn's loop.
struct LoopInput {
    thread: Thread,
    message: OutgoingMessage,
    /// Prior turns' contents.
    history: Vec<Content>,
    /// The user content that opened this exchange.
    user_content: Content,
    files: Vec<FileEntry>,
    context_files: Vec<FileEntry>,
    persona_id: String,
    model: String,
    cancel: CancellationToken,
}

/// Clears the busy flag when a send finishes, however it finishes.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
    events: &'a broadcast::Sender<AgentEvent>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(AgentEvent::LoadingChanged { loading: false });
    }
}

/// Writes turn snapshots in order without blocking the loop.
///
/// Each write waits on the previous one, so a stale snapshot never lands
/// after a newer one.
struct TurnWriter {
    store: Arc<dyn Store>,
    thread_id: Uuid,
    pending: Option<JoinHandle<()>>,
}

impl TurnWriter {
    fn new(store: Arc<dyn Store>, thread_id: Uuid) -> Self {
        Self {
            store,
            thread_id,
            pending: None,
        }
    }

    fn write(&mut self, turn: &Turn) {
        let previous = self.pending.take();
        let store = Arc::clone(&self.store);
        let thread_id = self.thread_id;
        let turn_id = turn.id;
        let contents = turn.contents.clone();
        self.pending = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(e) = store.bulk_put_contents(thread_id, &contents).await {
                warn!(turn_id = %turn_id, "Failed to persist turn: {}", e);
            }
        }));
    }

    /// Wait for every queued write.
    async fn flush(&mut self) {
        if let Some(pending) = self.pending.take()
            && let Err(e) = pending.await
        {
            warn!("Turn persistence task failed: {}", e);
        }
    }
}

/// Coordinates threads, turns, model rounds and capability execution.
pub struct Orchestrator {
    config: AgentConfig,
    deps: AgentDeps,
    state: Arc<RwLock<AppState>>,
    events: broadcast::Sender<AgentEvent>,
    busy: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl Orchestrator {
    pub fn new(config: AgentConfig, deps: AgentDeps) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            deps,
            state: Arc::new(RwLock::new(AppState::default())),
            events,
            busy: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn state(&self) -> Arc<RwLock<AppState>> {
        Arc::clone(&self.state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Workspace ───────────────────────────────────────────────────

    /// Load every persisted file into state.
    pub async fn load_files(&self) -> Result<usize> {
        let files = self.deps.store.list_files().await?;
        let count = files.len();
        self.state.write().await.files = files;
        Ok(count)
    }

    /// Register an uploaded file.
    pub async fn add_file(&self, file: FileEntry, bytes: Option<Vec<u8>>) -> Result<()> {
        self.deps.store.add_file(&file, bytes).await?;
        self.state.write().await.files.push(file.clone());
        self.emit(AgentEvent::FileAdded { file });
        Ok(())
    }

    pub async fn set_active_file(&self, id: Option<Uuid>) {
        self.state.write().await.active_file_id = id;
    }

    /// Detach from the active thread; the next message starts a new one.
    pub async fn start_new_thread(&self) {
        self.state.write().await.active_thread_id = None;
    }

    /// Hydrate a persisted thread and make it active.
    pub async fn load_thread(&self, id: Uuid) -> Result<Vec<Turn>> {
        let thread = self
            .deps
            .store
            .get_thread(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "thread".into(),
                id: id.to_string(),
            })?;
        let contents = self.deps.store.list_contents(id).await?;
        let turns = hydrate_turns(id, contents);

        let mut state = self.state.write().await;
        state.threads.insert(id, thread);
        state.turns.insert(id, turns.clone());
        state.active_thread_id = Some(id);
        debug!(thread_id = %id, turns = turns.len(), "Thread loaded");
        Ok(turns)
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Cancel the in-flight message, if any.
    pub async fn stop_generation(&self) {
        self.cancel.lock().await.cancel();
    }

    /// Send a user message and drive the assistant turn to completion.
    ///
    /// A second call while one is in flight returns [`SendOutcome::Busy`].
    pub async fn send_message(&self, message: UserMessage) -> Result<SendOutcome> {
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("send_message ignored, another message is in flight");
            return Ok(SendOutcome::Busy);
        }
        let _guard = BusyGuard {
            flag: &self.busy,
            events: &self.events,
        };
        self.emit(AgentEvent::LoadingChanged { loading: true });

        let cancel = {
            let mut current = self.cancel.lock().await;
            current.cancel();
            *current = CancellationToken::new();
            current.clone()
        };

        let thread = self.prepare_thread(&message).await;
        let persona_id = message
            .persona_id
            .clone()
            .or_else(|| thread.config.persona_id.clone())
            .unwrap_or_else(|| self.config.default_persona_id.clone());
        let model = message
            .model_hint
            .clone()
            .unwrap_or_else(|| thread.config.model.clone());

        let (history, files) = {
            let state = self.state.read().await;
            let history: Vec<Content> = state
                .turns(thread.id)
                .iter()
                .flat_map(|t| t.contents.iter().cloned())
                .collect();
            (history, state.files_for(thread.id))
        };

        let user_turn = Turn::user(thread.id, &message.text, &message.attached_files);
        if let Err(e) = self
            .deps
            .store
            .bulk_put_contents(thread.id, &user_turn.contents)
            .await
        {
            warn!(thread_id = %thread.id, "Failed to persist user turn: {}", e);
        }
        self.publish_turn(&user_turn).await;

        let context_files: Vec<FileEntry> = files
            .iter()
            .filter(|f| message.attached_files.contains(&f.id))
            .cloned()
            .collect();

        let mut turn = Turn::assistant(thread.id);
        self.publish_turn(&turn).await;

        let mut writer = TurnWriter::new(Arc::clone(&self.deps.store), thread.id);
        let thread_id = thread.id;
        let input = LoopInput {
            thread,
            message: OutgoingMessage::Text(message.text),
            history,
            user_content: user_turn.contents[0].clone(),
            files,
            context_files,
            persona_id,
            model,
            cancel,
        };

        match self.run_loop(&mut turn, input, &mut writer).await {
            Ok(state) => {
                if turn.status == TurnStatus::Streaming {
                    // Aborted before a terminal status was recorded.
                    self.finish_turn(&mut turn, TurnStatus::Complete, &mut writer)
                        .await;
                }
                info!(
                    thread_id = %thread_id,
                    turn_id = %turn.id,
                    outcome = %state,
                    "Turn finished"
                );
            }
            Err(e) => {
                error!(thread_id = %thread_id, turn_id = %turn.id, "Agent loop failed: {}", e);
                turn.push_content(Role::Model, vec![Part::Error(e.to_string())]);
                self.finish_turn(&mut turn, TurnStatus::Error, &mut writer)
                    .await;
            }
        }

        writer.flush().await;
        Ok(SendOutcome::Finished(turn))
    }

    /// Active thread refreshed with this message, or a new one.
    async fn prepare_thread(&self, message: &UserMessage) -> Thread {
        let mut state = self.state.write().await;

        if let Some(mut thread) = state.active_thread().cloned() {
            thread.touch(&message.text);
            if let Some(persona_id) = &message.persona_id {
                thread.config.persona_id = Some(persona_id.clone());
            }
            state.threads.insert(thread.id, thread.clone());
            drop(state);
            if let Err(e) = self.deps.store.put_thread(&thread).await {
                warn!(thread_id = %thread.id, "Failed to persist thread: {}", e);
            }
            return thread;
        }

        let mut config = ThreadConfig::new(
            message
                .model_hint
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
        );
        config.persona_id = message.persona_id.clone();
        let thread = Thread::new(&message.text, self.config.title_max_chars, config);

        state.threads.insert(thread.id, thread.clone());
        state.active_thread_id = Some(thread.id);
        let adopted = state.adopt_orphan_files(thread.id);
        drop(state);

        info!(thread_id = %thread.id, title = %thread.title, "Thread created");
        if let Err(e) = self.deps.store.put_thread(&thread).await {
            warn!(thread_id = %thread.id, "Failed to persist thread: {}", e);
        }
        self.emit(AgentEvent::ThreadCreated {
            thread: thread.clone(),
        });

        for file in adopted {
            if let Err(e) = self.deps.store.update_file(&file).await {
                warn!(file_id = %file.id, "Failed to move session file into thread: {}", e);
            }
            self.emit(AgentEvent::FileUpdated { file });
        }
        thread
    }

    // ── Loop ────────────────────────────────────────────────────────

    /// Run model rounds until the turn is done or aborted.
    ///
    /// Tool and code failures become conversation content. `Err` is reserved
    /// for stream failures and runaway loops; the caller marks the turn
    /// `error` in that case.
    async fn run_loop(
        &self,
        turn: &mut Turn,
        input: LoopInput,
        writer: &mut TurnWriter,
    ) -> Result<LoopState> {
        let LoopInput {
            thread,
            mut message,
            history,
            user_content,
            mut files,
            mut context_files,
            persona_id,
            model,
            cancel,
        } = input;

        let mut state = LoopState::Streaming;
        let mut rounds = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok(LoopState::Aborted);
            }

            rounds += 1;
            if rounds > self.config.max_rounds {
                return Err(Error::Loop(format!(
                    "exceeded {} model rounds",
                    self.config.max_rounds
                )));
            }

            let persona = self.deps.personas.resolve(Some(persona_id.as_str())).await;
            if let Err(e) = self.deps.activator.ensure_loaded(&persona, false).await {
                warn!(persona = %persona.id(), "Failed to load persona into sandbox: {}", e);
            }

            let model_content_id = turn.push_content(Role::Model, Vec::new());
            self.persist_turn(turn, writer).await;

            let mut round_history = history.clone();
            // The first round sends the user text as the message itself.
            if rounds > 1 {
                round_history.push(user_content.clone());
            }
            round_history.extend(turn_history(turn, model_content_id, &message));
            let request = StreamRequest {
                history: model_history(&round_history, &files),
                message: message.clone(),
                files: files.clone(),
                context_files: std::mem::take(&mut context_files),
                persona,
                tools: self.deps.tools.tool_definitions().await,
                model: model.clone(),
                cancel: cancel.clone(),
                on_upload_status: Some(self.upload_status_callback()),
            };

            debug!(turn_id = %turn.id, round = rounds, "Starting model round");
            let mut stream = self.deps.streamer.stream(request).await?;
            let mut aborted = false;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        aborted = true;
                        break;
                    }
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(parts)) => {
                        if let Some(content) = turn.content_mut(model_content_id) {
                            content.parts = parts;
                        }
                        self.persist_turn(turn, writer).await;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                }
            }
            drop(stream);
            self.persist_turn(turn, writer).await;

            if aborted || cancel.is_cancelled() {
                self.transition(&mut state, LoopState::Aborted);
                info!(turn_id = %turn.id, "Generation stopped");
                self.finish_turn(turn, TurnStatus::Complete, writer).await;
                return Ok(state);
            }
            self.transition(&mut state, LoopState::InspectingCalls);

            let (calls, text) = match turn.contents.iter().find(|c| c.id == model_content_id) {
                Some(content) => (
                    content.function_calls().cloned().collect::<Vec<FunctionCall>>(),
                    content.text(),
                ),
                None => (Vec::new(), String::new()),
            };
            let ctx = self.tool_context(&thread, &files).await;

            if let Some(call) = calls.first() {
                if calls.len() > 1 {
                    warn!(
                        tool = %call.name,
                        ignored = calls.len() - 1,
                        "Multiple function calls in one response, executing only the first"
                    );
                }
                self.transition(&mut state, LoopState::ExecutingTool);

                let output = self.execute_call(call, &ctx).await;
                if cancel.is_cancelled() {
                    self.transition(&mut state, LoopState::Aborted);
                    self.finish_turn(turn, TurnStatus::Complete, writer).await;
                    return Ok(state);
                }

                if let Some(data) = output.structured_data.clone() {
                    self.emit(AgentEvent::ToolData {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        data,
                    });
                }
                let response = match &output.error {
                    Some(err) => FunctionResponse::error(&call.id, &call.name, err.as_str()),
                    None => FunctionResponse::result(&call.id, &call.name, output.result.as_str()),
                };
                let generated = self
                    .register_generated(thread.id, output.generated_files, false)
                    .await;
                self.apply_mutations(&output.mutations).await;

                let mut parts = vec![Part::FunctionResponse(response.clone())];
                if !generated.is_empty() {
                    parts.push(Part::text(format!(
                        "[System] The tool generated {} file(s). See attached content.",
                        generated.len()
                    )));
                    parts.extend(generated.iter().map(|f| Part::FileRef(f.id)));
                }
                turn.push_content(Role::Tool, parts);
                self.persist_turn(turn, writer).await;

                message = OutgoingMessage::ToolResponse(response);
                files.extend(generated.iter().cloned());
                context_files = generated;
                self.transition(&mut state, LoopState::Streaming);
                continue;
            }

            let blocks = extract_executable_blocks(&text);
            if let Some(code) = blocks.first() {
                if cancel.is_cancelled() {
                    self.transition(&mut state, LoopState::Aborted);
                    self.finish_turn(turn, TurnStatus::Complete, writer).await;
                    return Ok(state);
                }
                if blocks.len() > 1 {
                    warn!(
                        ignored = blocks.len() - 1,
                        "Multiple executable blocks in one response, running only the first"
                    );
                }
                self.transition(&mut state, LoopState::ExecutingEmbeddedCode);

                let executed = self.deps.runner.execute(code, &ctx).await;
                if cancel.is_cancelled() {
                    self.transition(&mut state, LoopState::Aborted);
                    self.finish_turn(turn, TurnStatus::Complete, writer).await;
                    return Ok(state);
                }

                let (output, generated) = match executed {
                    Ok(report) => {
                        let generated = self
                            .register_generated(thread.id, report.generated_files, true)
                            .await;
                        self.apply_mutations(&report.mutations).await;
                        (report.output, generated)
                    }
                    Err(e) => {
                        warn!(turn_id = %turn.id, "Sandbox execution failed: {}", e);
                        (format!("Error executing Python code: {e}"), Vec::new())
                    }
                };

                let feedback = format!("{SYSTEM_OUTPUT_PREFIX}\n{output}");
                let mut parts = vec![Part::text(feedback.clone())];
                parts.extend(generated.iter().map(|f| Part::FileRef(f.id)));
                turn.push_content(Role::User, parts);
                self.persist_turn(turn, writer).await;

                message = OutgoingMessage::Text(feedback);
                files.extend(generated.iter().cloned());
                context_files = generated;
                self.transition(&mut state, LoopState::Streaming);
                continue;
            }

            self.transition(&mut state, LoopState::Done);
            self.finish_turn(turn, TurnStatus::Complete, writer).await;
            return Ok(state);
        }
    }

    fn transition(&self, state: &mut LoopState, target: LoopState) {
        if !state.can_transition_to(target) {
            warn!(from = %state, to = %target, "Unexpected loop state transition");
        }
        debug!(from = %state, to = %target, "Loop state");
        *state = target;
    }

    /// Resolve and run a function call. Never fails: problems become result text.
    async fn execute_call(&self, call: &FunctionCall, ctx: &ToolContext) -> ToolOutput {
        let tool = match self.deps.tools.resolve(&call.name).await {
            Ok(tool) => tool,
            Err(message) => {
                warn!(tool = %call.name, "Model called an unknown tool");
                return ToolOutput::text(message);
            }
        };

        debug!(tool = %call.name, call_id = %call.id, "Executing tool");
        match tool.execute(call.args.clone(), ctx).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %call.name, "Tool execution failed: {}", e);
                ToolOutput::failure(format!("Error: {e}"), e.to_string())
            }
        }
    }

    async fn tool_context(&self, thread: &Thread, files: &[FileEntry]) -> ToolContext {
        let active_file_id = self.state.read().await.active_file_id;
        ToolContext::new(thread.id, files.to_vec())
            .with_active_file(active_file_id)
            .with_image_model(thread.config.image_model.clone())
            .with_store(Arc::clone(&self.deps.store))
    }

    /// Give each generated file a fresh entry, persist it and add it to state.
    ///
    /// `in_sandbox` marks files that already exist inside the sandbox.
    async fn register_generated(
        &self,
        thread_id: Uuid,
        generated: Vec<GeneratedFile>,
        in_sandbox: bool,
    ) -> Vec<FileEntry> {
        let mut entries = Vec::with_capacity(generated.len());
        for file in generated {
            let entry = file.to_entry(thread_id);
            if in_sandbox {
                self.deps.runner.mark_mounted(entry.id).await;
            }
            if let Err(e) = self.deps.store.add_file(&entry, Some(file.bytes)).await {
                warn!(file = %entry.name, "Failed to persist generated file: {}", e);
            }
            self.state.write().await.files.push(entry.clone());
            self.emit(AgentEvent::FileAdded {
                file: entry.clone(),
            });
            entries.push(entry);
        }
        entries
    }

    async fn apply_mutations(&self, mutations: &[WorkspaceMutation]) {
        for mutation in mutations {
            if let WorkspaceMutation::PersonaRegistered { persona_id, name } = mutation {
                self.emit(AgentEvent::PersonaRegistered {
                    persona_id: persona_id.clone(),
                    name: name.clone(),
                });
                continue;
            }

            let updated = self.state.write().await.apply_mutation(mutation);
            let Some(file) = updated else {
                warn!("Mutation target is not a loaded file, skipping");
                continue;
            };
            if let Err(e) = self.deps.store.update_file(&file).await {
                warn!(file_id = %file.id, "Failed to persist file update: {}", e);
            }
            self.emit(AgentEvent::FileUpdated { file });
        }
    }

    /// Updates `upload_state` metadata as the streamer uploads context files.
    ///
    /// Reports are applied in the order they were made by a single task.
    fn upload_status_callback(&self) -> UploadStatusFn {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Uuid, UploadState)>();
        let state = Arc::clone(&self.state);
        let store = Arc::clone(&self.deps.store);
        let events = self.events.clone();

        tokio::spawn({
            let events = events.clone();
            async move {
                while let Some((file_id, upload)) = rx.recv().await {
                    let file = {
                        let mut state = state.write().await;
                        let Some(file) = state.file_mut(file_id) else {
                            continue;
                        };
                        file.metadata.insert(
                            "upload_state".into(),
                            serde_json::to_value(upload).unwrap_or_default(),
                        );
                        file.clone()
                    };
                    if let Err(e) = store.update_file(&file).await {
                        warn!(file_id = %file_id, "Failed to persist upload state: {}", e);
                    }
                    let _ = events.send(AgentEvent::FileUpdated { file });
                }
            }
        });

        Arc::new(move |file_id: Uuid, upload: UploadState| {
            let _ = events.send(AgentEvent::UploadStatus {
                file_id,
                state: upload,
            });
            let _ = tx.send((file_id, upload));
        })
    }

    // ── Turn bookkeeping ────────────────────────────────────────────

    async fn publish_turn(&self, turn: &Turn) {
        self.state.write().await.upsert_turn(turn);
        self.emit(AgentEvent::TurnUpdated { turn: turn.clone() });
    }

    async fn persist_turn(&self, turn: &Turn, writer: &mut TurnWriter) {
        writer.write(turn);
        self.publish_turn(turn).await;
    }

    async fn finish_turn(&self, turn: &mut Turn, status: TurnStatus, writer: &mut TurnWriter) {
        if !turn.status.can_transition_to(status) {
            warn!(turn_id = %turn.id, from = ?turn.status, to = ?status, "Turn already finished");
            return;
        }
        turn.status = status;
        self.persist_turn(turn, writer).await;
    }
}
