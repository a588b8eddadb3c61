// Agent identity, bearer tokens and registration quotas.
//
// Agents register with their claimed network origin (IP + MAC). The pair is
// hashed into a fingerprint that keys the per-day registration counter; the
// raw values are stored privately and never serialized. Each registration
// mints a fresh bearer token (`ast_` + base64url of CSPRNG bytes). Only the
// SHA-256 of the token is persisted, so a leaked database cannot be replayed
// against the gateway.

use crate::config::RegistrationConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::matcher;
use crate::store::models::encode_keywords;
use crate::store::{
    find_agent, find_agent_by_token_hash, find_task, list_tasks_for_agent, resolve_task_ref,
    Agent, AgentStatus, Store, Task, TaskMode, TaskStatus,
};
use crate::util::{digest_id, format_date, format_timestamp, is_blank};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// Recognizable prefix on every agent token.
pub const TOKEN_PREFIX: &str = "ast_";

/// Fingerprint of a claimed network origin, used only by the registration quota.
pub fn fingerprint(ip_address: &str, mac_address: &str) -> String {
    digest_id(&[ip_address.trim(), mac_address.trim()])
}

/// Mint an agent id from the origin plus wall-clock nanoseconds and a random nonce.
pub fn generate_agent_id(ip_address: &str, mac_address: &str, now: DateTime<Utc>) -> String {
    let nanos = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000));
    let nonce = uuid::Uuid::new_v4().to_string();
    digest_id(&[ip_address, mac_address, &nanos.to_string(), &nonce])
}

/// Generate a bearer token from `byte_len` CSPRNG bytes.
pub fn generate_token(byte_len: usize) -> String {
    let bytes: Vec<u8> = (0..byte_len).map(|_| rand::random::<u8>()).collect();
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// SHA-256 hex digest of a bearer token, the only form that is persisted.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Platform task id: stable for a given (owner, caller task token) pair.
pub fn derive_task_id(agent_id: &str, caller_task_id: &str) -> String {
    digest_id(&[agent_id, caller_task_id])
}

// ── Requests ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub public_bio: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub tasks: Vec<NewTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub mode: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Partial update for an existing task. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub status: Option<String>,
}

struct ValidTask {
    task_id: String,
    mode: TaskMode,
    task_type: String,
    title: String,
    keywords: Vec<String>,
}

fn normalize_keywords(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn validate_task(task: &NewTask) -> ServiceResult<ValidTask> {
    if is_blank(&task.task_id) {
        return Err(ServiceError::validation("task_id is required"));
    }
    let mode: TaskMode = task
        .mode
        .trim()
        .parse()
        .map_err(|_| ServiceError::validation("Task mode must be 'beacon' or 'radar'"))?;
    if is_blank(&task.task_type) {
        return Err(ServiceError::validation("task type is required"));
    }
    if is_blank(&task.title) {
        return Err(ServiceError::validation("task title is required"));
    }
    Ok(ValidTask {
        task_id: task.task_id.trim().to_string(),
        mode,
        task_type: task.task_type.trim().to_string(),
        title: task.title.trim().to_string(),
        keywords: normalize_keywords(&task.keywords),
    })
}

// ── Results ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    pub agent: Agent,
    /// Plaintext token. Returned exactly once.
    pub token: String,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub task: Task,
    /// Whether the stored vector must be recomputed from the task's keywords.
    pub reindex: bool,
}

#[derive(Debug, Clone)]
pub struct Authenticated {
    pub agent: Agent,
    /// Tasks reactivated because the agent was woken from hibernation.
    pub woken_tasks: Vec<Task>,
}

// ── Service ───────────────────────────────────────────────────────

pub struct IdentityService {
    store: Arc<Store>,
    config: RegistrationConfig,
}

impl IdentityService {
    pub fn new(store: Arc<Store>, config: RegistrationConfig) -> Self {
        Self { store, config }
    }

    /// Register an agent and its initial tasks in one transaction.
    ///
    /// The daily quota for the origin fingerprint is checked first and
    /// charged only when the whole registration commits.
    pub fn register_agent(
        &self,
        registration: &Registration,
        now: DateTime<Utc>,
    ) -> ServiceResult<RegisteredAgent> {
        if is_blank(&registration.display_name) {
            return Err(ServiceError::validation("display_name is required"));
        }
        if is_blank(&registration.ip_address) || is_blank(&registration.mac_address) {
            return Err(ServiceError::validation(
                "ip_address and mac_address are required",
            ));
        }

        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(registration.tasks.len());
        for task in &registration.tasks {
            let valid = validate_task(task)?;
            if !seen.insert(valid.task_id.clone()) {
                return Err(ServiceError::validation(format!(
                    "duplicate task_id '{}' in registration",
                    valid.task_id
                )));
            }
            tasks.push(valid);
        }

        let ip = registration.ip_address.trim();
        let mac = registration.mac_address.trim();
        let origin = fingerprint(ip, mac);
        let agent_id = generate_agent_id(ip, mac, now);
        let token = generate_token(self.config.token_bytes);
        let created_at = format_timestamp(now);
        let limit = self.config.daily_limit;

        let (agent, tasks) = self.store.with_transaction(|tx| {
            let used = current_registration_count(tx, &origin, now)?;
            if used >= limit {
                return Err(ServiceError::QuotaExceeded(format!(
                    "Registration limit exceeded ({limit} per day per origin)"
                )));
            }

            tx.execute(
                "INSERT INTO agents (id, token_hash, display_name, public_bio, ip_address,
                                     mac_address, status, report_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', 0, ?7)",
                params![
                    agent_id,
                    hash_token(&token),
                    registration.display_name.trim(),
                    registration.public_bio.trim(),
                    ip,
                    mac,
                    created_at,
                ],
            )?;

            let mut inserted = Vec::with_capacity(tasks.len());
            for task in &tasks {
                inserted.push(insert_task(tx, &agent_id, task, now)?);
            }

            tx.execute(
                "UPDATE registration_limits SET daily_count = daily_count + 1
                 WHERE fingerprint = ?1",
                params![origin],
            )?;

            let agent = find_agent(tx, &agent_id)?.ok_or(ServiceError::AgentNotFound)?;
            Ok::<_, ServiceError>((agent, inserted))
        })?;

        tracing::info!(
            agent_id = %agent.id,
            tasks = tasks.len(),
            "Agent registered"
        );
        Ok(RegisteredAgent {
            agent,
            token,
            tasks,
        })
    }

    /// Add a task to an existing agent, subject to the per-agent daily limit.
    pub fn create_task(
        &self,
        agent_id: &str,
        task: &NewTask,
        now: DateTime<Utc>,
    ) -> ServiceResult<Task> {
        let valid = validate_task(task)?;
        let limit = self.config.task_daily_limit;
        let day_start = format!("{}T00:00:00.000000Z", format_date(now.date_naive()));

        self.store.with_transaction(|tx| {
            let created_today: u32 = tx.query_row(
                "SELECT COUNT(*) FROM tasks WHERE agent_id = ?1 AND created_at >= ?2",
                params![agent_id, day_start],
                |row| row.get(0),
            )?;
            if created_today >= limit {
                return Err(ServiceError::QuotaExceeded(format!(
                    "Daily task creation limit exceeded (max {limit} per day)"
                )));
            }

            let id = derive_task_id(agent_id, &valid.task_id);
            if find_task(tx, &id)?.is_some() {
                return Err(ServiceError::Conflict(
                    "A task with this task_id already exists".into(),
                ));
            }
            Ok(insert_task(tx, agent_id, &valid, now)?)
        })
    }

    /// Apply a partial update to one of the agent's tasks.
    ///
    /// Leaving the active state (or clearing the keywords) drops the stored
    /// vector inside the same transaction; the caller re-indexes when
    /// [`TaskUpdate::reindex`] is set.
    pub fn update_task(
        &self,
        agent_id: &str,
        reference: &str,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> ServiceResult<TaskUpdate> {
        let new_status = match patch.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match raw.parse::<TaskStatus>() {
                Ok(status @ (TaskStatus::Active | TaskStatus::Paused | TaskStatus::Completed)) => {
                    Some(status)
                }
                _ => {
                    return Err(ServiceError::validation(
                        "Status must be 'active', 'paused', or 'completed'",
                    ))
                }
            },
        };

        self.store.with_transaction(|tx| {
            let mut task =
                resolve_task_ref(tx, agent_id, reference)?.ok_or(ServiceError::TaskNotFound)?;
            let old_status = task.status;

            if let Some(title) = patch.title.as_deref().filter(|t| !is_blank(t)) {
                task.title = title.trim().to_string();
            }
            let keywords_changed = match &patch.keywords {
                Some(keywords) => {
                    let normalized = normalize_keywords(keywords);
                    let changed = normalized != task.keywords;
                    task.keywords = normalized;
                    changed
                }
                None => false,
            };
            if let Some(status) = new_status {
                task.status = status;
            }
            task.updated_at = now;

            tx.execute(
                "UPDATE tasks SET title = ?1, keywords = ?2, status = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    task.title,
                    encode_keywords(&task.keywords)?,
                    task.status,
                    format_timestamp(now),
                    task.id,
                ],
            )?;

            let matchable = task.status == TaskStatus::Active && !task.keywords.is_empty();
            if !matchable {
                matcher::remove_vector(tx, &task.id)?;
            }
            let reactivated = task.status == TaskStatus::Active && old_status != TaskStatus::Active;
            let reindex = matchable && (reactivated || keywords_changed);

            Ok(TaskUpdate { task, reindex })
        })
    }

    /// Resolve a bearer token to its agent.
    ///
    /// Every successful call stamps `last_heartbeat`. An inactive agent is
    /// woken together with its inactive tasks; a banned agent is rejected.
    pub fn authenticate(&self, token: &str, now: DateTime<Utc>) -> ServiceResult<Authenticated> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ServiceError::Unauthenticated);
        }
        let token_hash = hash_token(token);
        let stamp = format_timestamp(now);

        self.store.with_transaction(|tx| {
            let agent =
                find_agent_by_token_hash(tx, &token_hash)?.ok_or(ServiceError::Unauthenticated)?;

            let mut woken_tasks = Vec::new();
            match agent.status {
                AgentStatus::Banned => return Err(ServiceError::AgentBanned),
                AgentStatus::Inactive => {
                    woken_tasks = list_tasks_for_agent(tx, &agent.id)?
                        .into_iter()
                        .filter(|t| t.status == TaskStatus::Inactive)
                        .collect();
                    tx.execute(
                        "UPDATE agents SET status = 'active' WHERE id = ?1",
                        params![agent.id],
                    )?;
                    tx.execute(
                        "UPDATE tasks SET status = 'active', updated_at = ?1
                         WHERE agent_id = ?2 AND status = 'inactive'",
                        params![stamp, agent.id],
                    )?;
                    for task in &mut woken_tasks {
                        task.status = TaskStatus::Active;
                        task.updated_at = now;
                    }
                    tracing::info!(
                        agent_id = %agent.id,
                        tasks = woken_tasks.len(),
                        "Agent woken from hibernation"
                    );
                }
                AgentStatus::Active => {}
            }

            tx.execute(
                "UPDATE agents SET last_heartbeat = ?1 WHERE id = ?2",
                params![stamp, agent.id],
            )?;
            let agent = find_agent(tx, &agent.id)?.ok_or(ServiceError::Unauthenticated)?;
            Ok(Authenticated { agent, woken_tasks })
        })
    }

    /// The agent's own profile and every task it owns.
    pub fn profile(&self, agent_id: &str) -> ServiceResult<(Agent, Vec<Task>)> {
        self.store.with_connection(|conn| {
            let agent = find_agent(conn, agent_id)?.ok_or(ServiceError::AgentNotFound)?;
            let tasks = list_tasks_for_agent(conn, agent_id)?;
            Ok((agent, tasks))
        })
    }

    /// Registrations already charged today for `ip`/`mac` (read-only).
    pub fn registrations_today(
        &self,
        ip_address: &str,
        mac_address: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<u32> {
        let origin = fingerprint(ip_address, mac_address);
        let today = format_date(now.date_naive());
        self.store.with_connection(|conn| {
            let row: Option<(u32, String)> = conn
                .query_row(
                    "SELECT daily_count, last_reset_date FROM registration_limits
                     WHERE fingerprint = ?1",
                    params![origin],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(match row {
                Some((count, date)) if date == today => count,
                _ => 0,
            })
        })
    }
}

/// Read the fingerprint's counter for today, creating or lazily resetting the
/// row as needed. Must run inside the registration transaction.
fn current_registration_count(
    conn: &Connection,
    origin: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<u32> {
    let today = format_date(now.date_naive());
    let row: Option<(u32, String)> = conn
        .query_row(
            "SELECT daily_count, last_reset_date FROM registration_limits WHERE fingerprint = ?1",
            params![origin],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        None => {
            conn.execute(
                "INSERT INTO registration_limits (fingerprint, daily_count, last_reset_date)
                 VALUES (?1, 0, ?2)",
                params![origin, today],
            )?;
            Ok(0)
        }
        Some((_, last_reset)) if last_reset != today => {
            conn.execute(
                "UPDATE registration_limits SET daily_count = 0, last_reset_date = ?1
                 WHERE fingerprint = ?2",
                params![today, origin],
            )?;
            Ok(0)
        }
        Some((count, _)) => Ok(count),
    }
}

fn insert_task(
    conn: &Connection,
    agent_id: &str,
    task: &ValidTask,
    now: DateTime<Utc>,
) -> rusqlite::Result<Task> {
    let id = derive_task_id(agent_id, &task.task_id);
    let stamp = format_timestamp(now);
    conn.execute(
        "INSERT INTO tasks (id, agent_id, task_id, mode, type, title, keywords, status,
                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8, ?8)",
        params![
            id,
            agent_id,
            task.task_id,
            task.mode,
            task.task_type,
            task.title,
            encode_keywords(&task.keywords)?,
            stamp,
        ],
    )?;
    Ok(Task {
        id,
        agent_id: agent_id.to_string(),
        task_id: task.task_id.clone(),
        mode: task.mode,
        task_type: task.task_type.clone(),
        title: task.title.clone(),
        keywords: task.keywords.clone(),
        status: TaskStatus::Active,
        created_at: now,
        updated_at: now,
    })
}
