// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

//! Conversation history.
//!
//! The on-disk form is a single append-only JSONL file holding three kinds
//! of records: conversation headers, conversation items and summaries. The
//! whole file is indexed in memory on open.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::{Message, Role};

pub(crate) type ConversationId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ConversationInfo {
    pub id: ConversationId,
    pub model: String,
    pub created_at: DateTime<Utc>,
    /// One-line topic, written once the first answer is in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredItem {
    conversation_id: ConversationId,
    role: Role,
    content: String,
    model: String,
    timestamp: DateTime<Utc>,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Conversation(ConversationInfo),
    Item(StoredItem),
    Summary {
        conversation_id: ConversationId,
        summary: String,
    },
}

/// Durable storage for conversations and their turns.
pub(crate) trait ConversationStore {
    fn create_conversation(&mut self, model: &str) -> Result<ConversationId>;

    fn add_conversation_item(
        &mut self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    ) -> Result<()>;

    /// The last `limit` messages of a conversation, oldest first.
    fn messages_for_llm(&self, conversation_id: ConversationId, limit: usize)
    -> Result<Vec<Message>>;

    fn last_conversation_id(&self) -> Option<ConversationId>;

    fn conversation(&self, conversation_id: ConversationId) -> Option<ConversationInfo>;

    fn set_summary(&mut self, conversation_id: ConversationId, summary: &str) -> Result<()>;

    /// Every message of a conversation, oldest first.
    fn messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>>;
}

/// In-memory view shared by both store implementations.
#[derive(Debug, Default)]
struct Index {
    conversations: BTreeMap<ConversationId, ConversationInfo>,
    items: HashMap<ConversationId, Vec<Message>>,
}

impl Index {
    fn next_id(&self) -> ConversationId {
        self.conversations
            .keys()
            .next_back()
            .map_or(1, |id| id + 1)
    }

    fn apply(&mut self, record: Record) {
        match record {
            Record::Conversation(info) => {
                self.items.entry(info.id).or_default();
                self.conversations.insert(info.id, info);
            }
            Record::Item(item) => {
                self.items
                    .entry(item.conversation_id)
                    .or_default()
                    .push(Message {
                        role: item.role,
                        content: item.content,
                        prompt_tokens: item.input_tokens,
                        completion_tokens: item.output_tokens,
                    });
            }
            Record::Summary {
                conversation_id,
                summary,
            } => {
                if let Some(info) = self.conversations.get_mut(&conversation_id) {
                    info.summary = Some(summary);
                }
            }
        }
    }

    fn new_conversation(&self, model: &str) -> ConversationInfo {
        ConversationInfo {
            id: self.next_id(),
            model: model.to_string(),
            created_at: Utc::now(),
            summary: None,
        }
    }

    fn new_summary(&self, conversation_id: ConversationId, summary: &str) -> Result<Record> {
        if !self.conversations.contains_key(&conversation_id) {
            return Err(Error::Store(format!(
                "conversation {conversation_id} does not exist"
            )));
        }
        Ok(Record::Summary {
            conversation_id,
            summary: summary.to_string(),
        })
    }

    fn new_item(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
    ) -> Result<Record> {
        let info = self.conversations.get(&conversation_id).ok_or_else(|| {
            Error::Store(format!("conversation {conversation_id} does not exist"))
        })?;
        Ok(Record::Item(StoredItem {
            conversation_id,
            role,
            content: content.to_string(),
            model: info.model.clone(),
            timestamp: Utc::now(),
            input_tokens,
            output_tokens,
        }))
    }

    fn messages(&self, conversation_id: ConversationId) -> Result<&[Message]> {
        if !self.conversations.contains_key(&conversation_id) {
            return Err(Error::Store(format!(
                "conversation {conversation_id} does not exist"
            )));
        }
        Ok(self
            .items
            .get(&conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    fn window(&self, conversation_id: ConversationId, limit: usize) -> Result<Vec<Message>> {
        let messages = self.messages(conversation_id)?;
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }
}

/// Store backed by a JSONL file.
pub(crate) struct JsonlStore {
    path: PathBuf,
    /// `None` when opened read-only: new records only reach the index.
    file: Option<File>,
    index: Index,
}

impl JsonlStore {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        let index = load_index(path, &content);

        // A write cut short leaves a partial last line. Terminate it so the
        // next record starts on a line of its own.
        if content.last().is_some_and(|b| *b != b'\n') {
            tracing::warn!(path = %path.display(), "History ends mid-record, terminating it");
            file.seek(SeekFrom::End(0))?;
            file.write_all(b"\n")?;
            file.flush()?;
        }

        tracing::debug!(
            path = %path.display(),
            conversations = index.conversations.len(),
            "Opened history"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            index,
        })
    }

    /// Open without ever writing. Conversations created or extended through
    /// this store live only until it is dropped.
    pub(crate) fn open_read_only(path: &Path) -> Result<Self> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let index = load_index(path, &content);
        tracing::debug!(
            path = %path.display(),
            conversations = index.conversations.len(),
            "Opened history read-only"
        );
        Ok(Self {
            path: path.to_path_buf(),
            file: None,
            index,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record: Record) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            let line = serde_json::to_string(&record)?;
            writeln!(file, "{line}")?;
            file.flush()?;
            tracing::debug!(path = %self.path.display(), "Wrote history record");
        }
        self.index.apply(record);
        Ok(())
    }
}

fn load_index(path: &Path, content: &[u8]) -> Index {
    let mut index = Index::default();
    for (lineno, line) in content.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Record>(line) {
            Ok(record) => index.apply(record),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = lineno + 1,
                "Skipping unreadable history record: {e}"
            ),
        }
    }
    index
}

impl ConversationStore for JsonlStore {
    fn create_conversation(&mut self, model: &str) -> Result<ConversationId> {
        let info = self.index.new_conversation(model);
        let id = info.id;
        self.append(Record::Conversation(info))?;
        Ok(id)
    }

    fn add_conversation_item(
        &mut self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    ) -> Result<()> {
        let record = self.index.new_item(
            conversation_id,
            role,
            content,
            prompt_tokens,
            completion_tokens,
        )?;
        self.append(record)
    }

    fn messages_for_llm(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.index.window(conversation_id, limit)
    }

    fn last_conversation_id(&self) -> Option<ConversationId> {
        self.index.conversations.keys().next_back().copied()
    }

    fn conversation(&self, conversation_id: ConversationId) -> Option<ConversationInfo> {
        self.index.conversations.get(&conversation_id).cloned()
    }

    fn set_summary(&mut self, conversation_id: ConversationId, summary: &str) -> Result<()> {
        let record = self.index.new_summary(conversation_id, summary)?;
        self.append(record)
    }

    fn messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.index.messages(conversation_id).map(<[Message]>::to_vec)
    }
}

/// Store that keeps everything in memory.
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    index: Index,
}

impl ConversationStore for MemoryStore {
    fn create_conversation(&mut self, model: &str) -> Result<ConversationId> {
        let info = self.index.new_conversation(model);
        let id = info.id;
        self.index.apply(Record::Conversation(info));
        Ok(id)
    }

    fn add_conversation_item(
        &mut self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    ) -> Result<()> {
        let record = self.index.new_item(
            conversation_id,
            role,
            content,
            prompt_tokens,
            completion_tokens,
        )?;
        self.index.apply(record);
        Ok(())
    }

    fn messages_for_llm(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.index.window(conversation_id, limit)
    }

    fn last_conversation_id(&self) -> Option<ConversationId> {
        self.index.conversations.keys().next_back().copied()
    }

    fn conversation(&self, conversation_id: ConversationId) -> Option<ConversationInfo> {
        self.index.conversations.get(&conversation_id).cloned()
    }

    fn set_summary(&mut self, conversation_id: ConversationId, summary: &str) -> Result<()> {
        let record = self.index.new_summary(conversation_id, summary)?;
        self.index.apply(record);
        Ok(())
    }

    fn messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.index.messages(conversation_id).map(<[Message]>::to_vec)
    }
}
