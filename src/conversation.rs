// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

//! Drives one conversation: persists turns, calls the provider, and feeds
//! streamed text through the reflow engine into the view.

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::provider::{ClientFactory, ConfigOverride, Message, Provider, Response, Role};
use crate::reflow::{LineUpdate, ReflowEngine};
use crate::store::{ConversationId, ConversationStore};
use crate::stream::{EventSource, StreamEvent};

pub(crate) const WELCOME_LINES: [&str; 2] = [
    "Welcome to Ask AI Terminal UI",
    "Type your question below and press Enter",
];

const THINKING_STATUS: &str = "AI is thinking...";
const BUSY_STATUS: &str = "Still waiting on the current response...";

const SUMMARY_PROMPT: &str =
    "Summarize the following text in one line, capturing the general topic of the text:\n\n";
const SUMMARY_MAX_TOKENS: u32 = 50;

/// Where conversation output is shown.
pub(crate) trait ConversationView {
    fn push_line(&mut self, text: String);
    fn replace_line(&mut self, index: usize, text: String);
    fn line_count(&self) -> usize;
    fn scroll_to_bottom(&mut self);
    fn set_status(&mut self, text: String);
    /// Current width of the output area in columns, borders included.
    fn width(&self) -> u16;
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OrchestratorSettings {
    pub context_length: usize,
    pub system_prompt: Option<String>,
    pub flush_threshold: usize,
    pub border_allowance: u16,
    /// Applied to every streamed request.
    pub request_override: Option<ConfigOverride>,
    pub summarize: bool,
}

impl OrchestratorSettings {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            context_length: config.context_length,
            system_prompt: config.system_prompt.clone(),
            flush_threshold: config.display.flush_threshold,
            border_allowance: config.display.border_allowance,
            request_override: config.request_override(),
            summarize: config.summarize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// No conversation exists yet; the next submission creates one.
    AwaitingFirstTurn,
    Idle,
    Streaming,
}

/// Outcome of a submission, so the caller knows whether to clear its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submission {
    Ignored,
    /// A response is still streaming. The input is kept.
    Refused,
    Command,
    Started,
    Failed,
}

struct ActiveResponse {
    conversation_id: ConversationId,
    source: EventSource,
    reflow: ReflowEngine,
    /// View index of the first line belonging to this response.
    first_line: usize,
    text: String,
    fragments: usize,
}

struct PendingSummary {
    conversation_id: ConversationId,
    task: JoinHandle<Result<Response>>,
}

/// A finished summary request.
pub(crate) type SummaryOutcome = (ConversationId, Result<Response>);

/// Something that finished in the background.
pub(crate) enum Update {
    Stream(StreamEvent),
    Summary(SummaryOutcome),
}

pub(crate) struct Orchestrator<S, F>
where
    S: ConversationStore,
    F: ClientFactory,
{
    store: S,
    factory: F,
    settings: OrchestratorSettings,
    model_name: String,
    client: Option<F::Client>,
    conversation_id: Option<ConversationId>,
    active: Option<ActiveResponse>,
    pending_summary: Option<PendingSummary>,
}

impl<S, F> Orchestrator<S, F>
where
    S: ConversationStore,
    F: ClientFactory,
{
    pub(crate) fn new(store: S, factory: F, settings: OrchestratorSettings, model_name: String) -> Self {
        Self {
            store,
            factory,
            settings,
            model_name,
            client: None,
            conversation_id: None,
            active: None,
            pending_summary: None,
        }
    }

    pub(crate) fn state(&self) -> State {
        match (&self.active, self.conversation_id) {
            (Some(_), _) => State::Streaming,
            (None, Some(_)) => State::Idle,
            (None, None) => State::AwaitingFirstTurn,
        }
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    pub(crate) fn is_summarizing(&self) -> bool {
        self.pending_summary.is_some()
    }

    /// True while a stream or a summary request is outstanding.
    pub(crate) fn has_pending_work(&self) -> bool {
        self.is_streaming() || self.is_summarizing()
    }

    pub(crate) fn model_name(&self) -> &str {
        &self.model_name
    }

    pub(crate) fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    fn idle_status(&self) -> String {
        format!("Model: {} | Press Esc to quit", self.model_name)
    }

    /// Show the welcome banner and idle status.
    pub(crate) fn start(&mut self, view: &mut impl ConversationView) {
        for line in WELCOME_LINES {
            view.push_line(line.to_string());
        }
        self.check_available(view);
        view.set_status(self.idle_status());
    }

    /// Warn in the view when the current model has no credential.
    fn check_available(&mut self, view: &mut impl ConversationView) {
        match self.client().map(|client| client.is_available()) {
            Ok(true) => {}
            Ok(false) => view.push_line(format!(
                "No API key is configured for {}. Requests will fail until one is set.",
                self.model_name
            )),
            Err(e) => tracing::warn!(model = %self.model_name, "Could not build client: {e}"),
        }
    }

    /// Attach to an existing conversation and replay it into the view.
    pub(crate) fn resume(
        &mut self,
        conversation_id: ConversationId,
        view: &mut impl ConversationView,
    ) -> Result<()> {
        let info = self.store.conversation(conversation_id).ok_or_else(|| {
            Error::Store(format!("conversation {conversation_id} does not exist"))
        })?;
        let messages = self.store.messages(conversation_id)?;

        let mut model_changed = false;
        if self.factory.model_names().contains(&info.model) {
            if info.model != self.model_name {
                self.client = None;
                model_changed = true;
            }
            self.model_name = info.model;
        } else {
            tracing::warn!(
                conversation_id,
                model = %info.model,
                "Conversation model is no longer configured, keeping {}",
                self.model_name
            );
        }

        self.conversation_id = Some(conversation_id);
        tracing::info!(conversation_id, messages = messages.len(), "Resumed conversation");

        match &info.summary {
            Some(summary) => view.push_line(format!(
                "Continuing conversation {conversation_id}: {summary}"
            )),
            None => view.push_line(format!("Continuing conversation {conversation_id}")),
        }
        if model_changed {
            self.check_available(view);
        }
        for message in &messages {
            match message.role {
                Role::User => self.show_user_turn(&message.content, view),
                Role::Assistant => {
                    view.push_line("AI:".to_string());
                    self.show_wrapped(&message.content, view);
                    view.push_line(String::new());
                }
                Role::System => {}
            }
        }
        view.scroll_to_bottom();
        view.set_status(self.idle_status());
        Ok(())
    }

    /// Handle a line of user input.
    pub(crate) fn submit(&mut self, input: &str, view: &mut impl ConversationView) -> Submission {
        let query = input.trim();
        if query.is_empty() {
            return Submission::Ignored;
        }
        if self.is_streaming() {
            view.set_status(BUSY_STATUS.to_string());
            return Submission::Refused;
        }

        if let Some(submission) = self.run_command(query, view) {
            return submission;
        }

        match self.start_turn(query, view) {
            Ok(()) => Submission::Started,
            Err(e) => {
                tracing::warn!("Could not start turn: {e}");
                self.show_error("Error", &e, view);
                view.set_status(self.idle_status());
                Submission::Failed
            }
        }
    }

    fn run_command(&mut self, query: &str, view: &mut impl ConversationView) -> Option<Submission> {
        let mut parts = query.split_whitespace();
        let command = parts.next()?;
        let argument = parts.next();

        match command {
            "/model" => {
                match argument {
                    None => view.push_line(format!("Current model: {}", self.model_name)),
                    Some(name) => self.switch_model(name, view),
                }
                view.scroll_to_bottom();
                Some(Submission::Command)
            }
            "/new" => {
                self.conversation_id = None;
                tracing::info!("Starting a new conversation");
                view.push_line(String::new());
                view.push_line("Started a new conversation.".to_string());
                view.scroll_to_bottom();
                Some(Submission::Command)
            }
            _ => None,
        }
    }

    fn switch_model(&mut self, name: &str, view: &mut impl ConversationView) {
        let Some(model) = self.factory.resolve_model(name) else {
            view.push_line(format!(
                "Unknown model '{name}'. Available: {}",
                self.factory.model_names().join(", ")
            ));
            return;
        };
        tracing::info!(from = %self.model_name, to = %model, "Switching model");
        view.push_line(format!(
            "Switched to {model}. Your next message starts a new conversation."
        ));
        self.model_name = model;
        self.client = None;
        self.conversation_id = None;
        self.check_available(view);
        view.set_status(self.idle_status());
    }

    fn client(&mut self) -> Result<&F::Client> {
        let client = match self.client.take() {
            Some(client) => client,
            None => self.factory.client_for(&self.model_name)?,
        };
        Ok(self.client.insert(client))
    }

    fn start_turn(&mut self, query: &str, view: &mut impl ConversationView) -> Result<()> {
        // Fail before touching the store if the viewport is unusable.
        let reflow = ReflowEngine::for_viewport(
            view.width(),
            self.settings.border_allowance,
            self.settings.flush_threshold,
        )?;

        let conversation_id = match self.conversation_id {
            Some(id) => id,
            None => {
                let id = self.store.create_conversation(&self.model_name)?;
                tracing::info!(conversation_id = id, model = %self.model_name, "Created conversation");
                self.conversation_id = Some(id);
                id
            }
        };

        self.show_user_turn(query, view);
        view.scroll_to_bottom();

        self.store
            .add_conversation_item(conversation_id, Role::User, query, None, None)?;

        let mut messages = self
            .store
            .messages_for_llm(conversation_id, self.settings.context_length)?;
        if let Some(prompt) = self.settings.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.insert(0, Message::system(prompt));
        }

        let request_override = self.settings.request_override.clone();
        let source = self
            .client()?
            .send_stream(messages, request_override.as_ref());

        view.push_line("AI:".to_string());
        view.set_status(THINKING_STATUS.to_string());
        view.scroll_to_bottom();

        self.active = Some(ActiveResponse {
            conversation_id,
            source,
            reflow,
            first_line: view.line_count(),
            text: String::new(),
            fragments: 0,
        });
        tracing::debug!(conversation_id, "Streaming response");
        Ok(())
    }

    /// Wait for the next stream event or finished summary. Pends forever
    /// when neither is outstanding, so it can sit in a `select!` loop.
    pub(crate) async fn next_update(&mut self) -> Update {
        let update = {
            let active = self.active.as_mut();
            let pending = self.pending_summary.as_mut();
            tokio::select! {
                biased;
                event = async move {
                    match active {
                        Some(active) => active.source.recv().await,
                        None => std::future::pending().await,
                    }
                } => Update::Stream(event.unwrap_or_else(|| {
                    StreamEvent::Error(Error::Other("stream closed without a result".to_string()))
                })),
                outcome = async move {
                    match pending {
                        Some(pending) => {
                            let result = match (&mut pending.task).await {
                                Ok(result) => result,
                                Err(e) => Err(Error::Other(format!("summary task failed: {e}"))),
                            };
                            (pending.conversation_id, result)
                        }
                        None => std::future::pending().await,
                    }
                } => Update::Summary(outcome),
            }
        };
        if matches!(update, Update::Summary(_)) {
            self.pending_summary = None;
        }
        update
    }

    pub(crate) fn handle_update(&mut self, update: Update, view: &mut impl ConversationView) {
        match update {
            Update::Stream(event) => self.handle_event(event, view),
            Update::Summary(outcome) => self.handle_summary(outcome),
        }
    }

    fn handle_event(&mut self, event: StreamEvent, view: &mut impl ConversationView) {
        match event {
            StreamEvent::Data(fragment) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                active.text.push_str(&fragment);
                active.fragments += 1;
                let updates = active.reflow.push(&fragment);
                apply_updates(active.first_line, updates, view);
                view.scroll_to_bottom();
            }
            StreamEvent::Done { final_text, usage } => {
                let Some(mut active) = self.active.take() else {
                    return;
                };
                apply_updates(active.first_line, active.reflow.finish(), view);
                if final_text != active.text {
                    tracing::warn!(
                        streamed = active.text.len(),
                        reported = final_text.len(),
                        "Provider's final text differs from the streamed fragments"
                    );
                }
                tracing::info!(
                    conversation_id = active.conversation_id,
                    fragments = active.fragments,
                    ?usage,
                    "Response complete"
                );
                let usage = usage.unwrap_or_default();
                match self.store.add_conversation_item(
                    active.conversation_id,
                    Role::Assistant,
                    &active.text,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                ) {
                    Ok(()) => self.start_summary(active.conversation_id),
                    Err(e) => {
                        tracing::warn!("Failed to save response: {e}");
                        self.show_error("Error saving response", &e, view);
                    }
                }
                view.push_line(String::new());
                view.scroll_to_bottom();
                view.set_status(self.idle_status());
            }
            StreamEvent::Error(e) => {
                let Some(mut active) = self.active.take() else {
                    return;
                };
                // Keep whatever partial text was already received on screen.
                apply_updates(active.first_line, active.reflow.finish(), view);
                tracing::warn!(conversation_id = active.conversation_id, "Response failed: {e}");
                let label = if e.is_provider_error() {
                    "Error from AI"
                } else {
                    "Error"
                };
                self.show_error(label, &e, view);
                view.push_line(String::new());
                view.scroll_to_bottom();
                view.set_status(self.idle_status());
            }
        }
    }

    /// Ask the model for a one-line summary of a conversation that has none
    /// yet. The request runs in the background; see `next_update`.
    fn start_summary(&mut self, conversation_id: ConversationId) {
        if !self.settings.summarize || self.pending_summary.is_some() {
            return;
        }
        if self
            .store
            .conversation(conversation_id)
            .is_none_or(|info| info.summary.is_some())
        {
            return;
        }
        let Some(client) = self.client.clone().filter(|c| c.is_available()) else {
            return;
        };
        let text = match self.store.messages_for_llm(conversation_id, 2) {
            Ok(messages) => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            Err(e) => {
                tracing::warn!(conversation_id, "Cannot summarize: {e}");
                return;
            }
        };

        tracing::debug!(conversation_id, "Requesting summary");
        let prompt = vec![Message::user(format!("{SUMMARY_PROMPT}{text}"))];
        let task = tokio::spawn(async move {
            let summary_override = ConfigOverride {
                max_tokens: Some(SUMMARY_MAX_TOKENS),
                ..Default::default()
            };
            client.send(&prompt, Some(&summary_override)).await
        });
        self.pending_summary = Some(PendingSummary {
            conversation_id,
            task,
        });
    }

    /// Store the first non-empty line of a summary response.
    fn handle_summary(&mut self, outcome: SummaryOutcome) {
        let (conversation_id, result) = outcome;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(conversation_id, "Summary request failed: {e}");
                return;
            }
        };
        tracing::debug!(
            conversation_id,
            finish_reason = ?response.finish_reason,
            usage = ?response.usage,
            "Summary response"
        );
        let Some(summary) = response
            .content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
        else {
            tracing::debug!(conversation_id, "Summary was empty");
            return;
        };
        match self.store.set_summary(conversation_id, summary) {
            Ok(()) => tracing::info!(conversation_id, summary, "Saved summary"),
            Err(e) => tracing::warn!(conversation_id, "Failed to save summary: {e}"),
        }
    }

    fn show_user_turn(&self, text: &str, view: &mut impl ConversationView) {
        view.push_line(String::new());
        view.push_line("You:".to_string());
        self.show_wrapped(text, view);
    }

    /// Push `text` wrapped to the current width.
    fn show_wrapped(&self, text: &str, view: &mut impl ConversationView) {
        match ReflowEngine::for_viewport(
            view.width(),
            self.settings.border_allowance,
            self.settings.flush_threshold,
        ) {
            Ok(mut reflow) => {
                let first_line = view.line_count();
                let mut updates = reflow.push(text);
                updates.extend(reflow.finish());
                apply_updates(first_line, updates, view);
            }
            Err(_) => {
                for line in text.lines() {
                    view.push_line(line.to_string());
                }
            }
        }
    }

    fn show_error(&self, label: &str, error: &Error, view: &mut impl ConversationView) {
        let message = error.tui_message();
        let mut lines = message.lines();
        let first = lines.next().unwrap_or_default();
        view.push_line(format!("{label}: {first}"));
        for line in lines {
            view.push_line(line.to_string());
        }
        view.scroll_to_bottom();
    }
}

fn apply_updates(first_line: usize, updates: Vec<LineUpdate>, view: &mut impl ConversationView) {
    for update in updates {
        match update {
            LineUpdate::Push(text) => view.push_line(text),
            LineUpdate::Replace { line, text } => view.replace_line(first_line + line, text),
        }
    }
}
