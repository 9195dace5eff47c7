use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Messages of the current session, oldest first.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn push(&mut self, message: ChatMessage) -> &ChatMessage {
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    /// Everything except system messages.
    pub fn visible(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Append-only SQLite log of chat turns.
pub struct ChatLog {
    conn: Connection,
}

impl ChatLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let log = Self {
            conn: Connection::open(path)?,
        };
        log.migrate()?;
        info!(path = %path.display(), "opened chat log");
        Ok(log)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let log = Self {
            conn: Connection::open_in_memory()?,
        };
        log.migrate()?;
        Ok(log)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chat_log (
                timestamp TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn append(&self, message: &ChatMessage) -> Result<()> {
        self.conn.execute(
            "INSERT INTO chat_log (timestamp, role, content) VALUES (?1, ?2, ?3)",
            params![
                message.timestamp.to_rfc3339(),
                message.role.as_str(),
                message.content
            ],
        )?;
        debug!(role = %message.role, "logged chat message");
        Ok(())
    }

    /// The last `limit` messages, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, role, content FROM chat_log ORDER BY rowid DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let timestamp: String = row.get(0)?;
            let role: String = row.get(1)?;
            let content: String = row.get(2)?;
            Ok((timestamp, role, content))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (raw_timestamp, raw_role, content) = row?;
            let role = match raw_role.parse::<Role>() {
                Ok(role) => role,
                Err(e) => {
                    warn!(timestamp = %raw_timestamp, "skipping chat log row: {e}");
                    continue;
                }
            };
            let timestamp = match DateTime::parse_from_rfc3339(&raw_timestamp) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    warn!(timestamp = %raw_timestamp, "chat log row has a bad timestamp: {e}");
                    DateTime::<Utc>::default()
                }
            };
            messages.push(ChatMessage {
                role,
                content,
                timestamp,
            });
        }

        messages.reverse();
        Ok(messages)
    }
}
