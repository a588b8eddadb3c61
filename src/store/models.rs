use crate::util::parse_timestamp;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Implements string round-tripping plus SQLite column conversion for a
/// fieldless enum stored as TEXT.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("invalid ", stringify!($name), " value: '{}'"),
                        other
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse().map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    /// Absorbing state. Nothing transitions out of it.
    Banned,
}

text_enum!(AgentStatus {
    Active => "active",
    Inactive => "inactive",
    Banned => "banned",
});

/// Task advertisement mode. A beacon is discoverable by radars and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Beacon,
    Radar,
}

text_enum!(TaskMode {
    Beacon => "beacon",
    Radar => "radar",
});

impl TaskMode {
    /// The mode a task of this mode is matched against.
    pub fn complement(self) -> Self {
        match self {
            Self::Beacon => Self::Radar,
            Self::Radar => Self::Beacon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    /// Set by the lifecycle sweeper when the owning agent hibernates.
    Inactive,
}

text_enum!(TaskStatus {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Inactive => "inactive",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    PendingAcceptance,
    Active,
    ConcludedMatched,
    ConcludedNoMatch,
    Expired,
}

text_enum!(ConversationState {
    PendingAcceptance => "pending_acceptance",
    Active => "active",
    ConcludedMatched => "concluded_matched",
    ConcludedNoMatch => "concluded_no_match",
    Expired => "expired",
});

impl ConversationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ConcludedMatched | Self::ConcludedNoMatch | Self::Expired
        )
    }
}

/// A registered agent. Origin fingerprint inputs never leave the process.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: String,
    pub display_name: String,
    pub public_bio: String,
    #[serde(skip_serializing)]
    pub ip_address: String,
    #[serde(skip_serializing)]
    pub mac_address: String,
    pub status: AgentStatus,
    pub report_count: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Platform id, derived from the owning agent and `task_id`.
    pub id: String,
    pub agent_id: String,
    /// Caller-supplied task token.
    pub task_id: String,
    pub mode: TaskMode,
    #[serde(rename = "type")]
    pub task_type: String,
    pub title: String,
    pub keywords: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Text sent to the embedding provider: keywords joined by single spaces.
    pub fn keyword_text(&self) -> String {
        self.keywords.join(" ")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub initiator_agent: String,
    pub target_agent: String,
    pub initiator_task: String,
    pub target_task: String,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, agent_id: &str) -> bool {
        self.initiator_agent == agent_id || self.target_agent == agent_id
    }

    /// The participant on the other side of `agent_id`, if `agent_id` participates.
    pub fn counterpart(&self, agent_id: &str) -> Option<&str> {
        if self.initiator_agent == agent_id {
            Some(&self.target_agent)
        } else if self.target_agent == agent_id {
            Some(&self.initiator_agent)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    pub id: String,
    pub conversation_id: String,
    #[serde(rename = "from_agent_id")]
    pub from_agent: String,
    #[serde(skip_serializing)]
    pub to_agent: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ── Row mapping ───────────────────────────────────────────────────

pub(crate) const AGENT_COLUMNS: &str = "id, display_name, public_bio, ip_address, mac_address, \
     status, report_count, last_heartbeat, created_at";

pub(crate) const TASK_COLUMNS: &str =
    "id, agent_id, task_id, mode, type, title, keywords, status, created_at, updated_at";

pub(crate) const CONVERSATION_COLUMNS: &str = "id, initiator_agent, target_agent, \
     initiator_task, target_task, state, created_at, updated_at";

pub(crate) const MESSAGE_COLUMNS: &str =
    "id, conversation_id, from_agent, to_agent, content, created_at";

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.filter(|value| !value.is_empty())
        .map(|value| {
            parse_timestamp(&value)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
        })
        .transpose()
}

pub(crate) fn map_agent_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        display_name: row.get(1)?,
        public_bio: row.get(2)?,
        ip_address: row.get(3)?,
        mac_address: row.get(4)?,
        status: row.get(5)?,
        report_count: row.get(6)?,
        last_heartbeat: optional_timestamp_column(row, 7)?,
        created_at: timestamp_column(row, 8)?,
    })
}

pub(crate) fn map_task_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let keywords_raw: String = row.get(6)?;
    let keywords: Vec<String> = serde_json::from_str(&keywords_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.into()))?;
    Ok(Task {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        task_id: row.get(2)?,
        mode: row.get(3)?,
        task_type: row.get(4)?,
        title: row.get(5)?,
        keywords,
        status: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
        updated_at: timestamp_column(row, 9)?,
    })
}

pub(crate) fn map_conversation_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        initiator_agent: row.get(1)?,
        target_agent: row.get(2)?,
        initiator_task: row.get(3)?,
        target_task: row.get(4)?,
        state: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
    })
}

pub(crate) fn map_message_row(row: &Row<'_>) -> rusqlite::Result<QueuedMessage> {
    Ok(QueuedMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        from_agent: row.get(2)?,
        to_agent: row.get(3)?,
        content: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
    })
}

pub(crate) fn encode_keywords(keywords: &[String]) -> rusqlite::Result<String> {
    serde_json::to_string(keywords).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
}

// ── Shared lookups ────────────────────────────────────────────────

pub fn find_agent(conn: &Connection, agent_id: &str) -> rusqlite::Result<Option<Agent>> {
    conn.query_row(
        &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
        params![agent_id],
        map_agent_row,
    )
    .optional()
}

pub fn find_agent_by_token_hash(
    conn: &Connection,
    token_hash: &str,
) -> rusqlite::Result<Option<Agent>> {
    conn.query_row(
        &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE token_hash = ?1"),
        params![token_hash],
        map_agent_row,
    )
    .optional()
}

pub fn find_task(conn: &Connection, id: &str) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        map_task_row,
    )
    .optional()
}

/// Resolve a task reference (platform id or caller token) scoped to its owner.
pub fn resolve_task_ref(
    conn: &Connection,
    owner: &str,
    reference: &str,
) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE agent_id = ?1 AND (id = ?2 OR task_id = ?2)
             ORDER BY CASE WHEN id = ?2 THEN 0 ELSE 1 END
             LIMIT 1"
        ),
        params![owner, reference],
        map_task_row,
    )
    .optional()
}

pub fn list_tasks_for_agent(conn: &Connection, agent_id: &str) -> rusqlite::Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE agent_id = ?1 ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map(params![agent_id], map_task_row)?;
    rows.collect()
}

pub fn find_conversation(conn: &Connection, id: &str) -> rusqlite::Result<Option<Conversation>> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
        params![id],
        map_conversation_row,
    )
    .optional()
}
