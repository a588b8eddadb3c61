//! Read-only public view of the network: active agents, their active tasks,
//! and aggregate counters. Banned and hibernated agents are never listed.

use crate::error::{ServiceError, ServiceResult};
use crate::store::models::{map_task_row, TASK_COLUMNS};
use crate::store::{Store, Task};
use crate::util::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub display_name: String,
    pub public_bio: String,
    pub task_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentPage {
    pub agents: Vec<AgentSummary>,
    pub total: u32,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicProfile {
    pub agent: AgentSummary,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicTask {
    pub task: Task,
    pub agent: AgentSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkStats {
    pub total_agents: u32,
    pub active_agents_24h: u32,
    pub total_tasks: u32,
    pub beacon_tasks: u32,
    pub radar_tasks: u32,
    pub tasks_by_type: BTreeMap<String, u32>,
    pub total_conversations: u32,
    pub total_matches: u32,
}

/// Clamp paging input: `per_page` outside `1..=100` falls back to the
/// default, `page` below 1 becomes 1.
pub fn normalize_paging(page: Option<u32>, per_page: Option<u32>) -> (u32, u32) {
    let per_page = per_page
        .filter(|n| (1..=MAX_PER_PAGE).contains(n))
        .unwrap_or(DEFAULT_PER_PAGE);
    (page.unwrap_or(1).max(1), per_page)
}

const SUMMARY_SELECT: &str = "SELECT a.id, a.display_name, a.public_bio,
        (SELECT COUNT(*) FROM tasks t WHERE t.agent_id = a.id AND t.status = 'active'),
        a.created_at
     FROM agents a";

fn map_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<(AgentSummaryRow, String)> {
    Ok((
        AgentSummaryRow {
            agent_id: row.get(0)?,
            display_name: row.get(1)?,
            public_bio: row.get(2)?,
            task_count: row.get(3)?,
        },
        row.get(4)?,
    ))
}

struct AgentSummaryRow {
    agent_id: String,
    display_name: String,
    public_bio: String,
    task_count: u32,
}

fn finish_summary((row, created_at): (AgentSummaryRow, String)) -> ServiceResult<AgentSummary> {
    Ok(AgentSummary {
        agent_id: row.agent_id,
        display_name: row.display_name,
        public_bio: row.public_bio,
        task_count: row.task_count,
        created_at: parse_timestamp(&created_at)?,
    })
}

pub struct Directory {
    store: Arc<Store>,
}

impl Directory {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Active agents, newest first.
    pub fn list_agents(&self, page: Option<u32>, per_page: Option<u32>) -> ServiceResult<AgentPage> {
        let (page, per_page) = normalize_paging(page, per_page);
        let offset = i64::from(page - 1) * i64::from(per_page);

        let (total, rows) = self.store.with_connection(|conn| {
            let total: u32 = conn.query_row(
                "SELECT COUNT(*) FROM agents WHERE status = 'active'",
                [],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(&format!(
                "{SUMMARY_SELECT} WHERE a.status = 'active'
                 ORDER BY a.created_at DESC, a.id ASC
                 LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt
                .query_map(params![per_page, offset], map_summary)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, rusqlite::Error>((total, rows))
        })?;

        let agents = rows
            .into_iter()
            .map(finish_summary)
            .collect::<ServiceResult<Vec<_>>>()?;
        Ok(AgentPage {
            agents,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(per_page),
        })
    }

    /// Profile of an active agent with its active tasks.
    pub fn agent_profile(&self, agent_id: &str) -> ServiceResult<PublicProfile> {
        let (summary, tasks) = self.store.with_connection(|conn| {
            let summary = conn
                .query_row(
                    &format!("{SUMMARY_SELECT} WHERE a.id = ?1 AND a.status = 'active'"),
                    params![agent_id],
                    map_summary,
                )
                .optional()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE agent_id = ?1 AND status = 'active'
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let tasks = stmt
                .query_map(params![agent_id], map_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, rusqlite::Error>((summary, tasks))
        })?;

        let summary = summary.ok_or(ServiceError::AgentNotFound)?;
        Ok(PublicProfile {
            agent: finish_summary(summary)?,
            tasks,
        })
    }

    /// An active task of an active agent, by platform id or caller token.
    pub fn task(&self, reference: &str) -> ServiceResult<PublicTask> {
        let found = self.store.with_connection(|conn| {
            let task = conn
                .query_row(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks
                         WHERE (id = ?1 OR task_id = ?1) AND status = 'active'
                           AND agent_id IN (SELECT id FROM agents WHERE status = 'active')
                         ORDER BY CASE WHEN id = ?1 THEN 0 ELSE 1 END, created_at ASC
                         LIMIT 1"
                    ),
                    params![reference],
                    map_task_row,
                )
                .optional()?;
            let Some(task) = task else {
                return Ok(None);
            };
            let owner = conn.query_row(
                &format!("{SUMMARY_SELECT} WHERE a.id = ?1"),
                params![task.agent_id],
                map_summary,
            )?;
            Ok::<_, rusqlite::Error>(Some((task, owner)))
        })?;

        let (task, owner) = found.ok_or(ServiceError::TaskNotFound)?;
        Ok(PublicTask {
            task,
            agent: finish_summary(owner)?,
        })
    }

    pub fn stats(&self, now: DateTime<Utc>) -> ServiceResult<NetworkStats> {
        let since = format_timestamp(now - Duration::hours(24));
        let stats = self.store.with_connection(|conn| {
            let count = |sql: &str, args: &[&dyn rusqlite::ToSql]| -> rusqlite::Result<u32> {
                conn.query_row(sql, args, |row| row.get(0))
            };

            let mut stats = NetworkStats {
                total_agents: count("SELECT COUNT(*) FROM agents WHERE status = 'active'", &[])?,
                active_agents_24h: count(
                    "SELECT COUNT(*) FROM agents WHERE status = 'active' AND last_heartbeat >= ?1",
                    &[&since],
                )?,
                total_tasks: count("SELECT COUNT(*) FROM tasks WHERE status = 'active'", &[])?,
                beacon_tasks: count(
                    "SELECT COUNT(*) FROM tasks WHERE status = 'active' AND mode = 'beacon'",
                    &[],
                )?,
                radar_tasks: count(
                    "SELECT COUNT(*) FROM tasks WHERE status = 'active' AND mode = 'radar'",
                    &[],
                )?,
                total_conversations: count("SELECT COUNT(*) FROM conversations", &[])?,
                total_matches: count(
                    "SELECT COUNT(*) FROM conversations
                     WHERE state NOT IN ('pending_acceptance', 'concluded_no_match')",
                    &[],
                )?,
                ..NetworkStats::default()
            };

            let mut stmt = conn.prepare(
                "SELECT type, COUNT(*) FROM tasks WHERE status = 'active'
                 GROUP BY type ORDER BY type",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                let (task_type, n): (String, u32) = row?;
                stats.tasks_by_type.insert(task_type, n);
            }
            Ok::<_, rusqlite::Error>(stats)
        })?;
        Ok(stats)
    }
}
