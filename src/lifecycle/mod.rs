//! Periodic lifecycle sweeps: hibernate idle agents, expire stale pending
//! conversations, purge old messages queued for hibernated agents.
//!
//! Every sub-sweep is idempotent and independent; a zero-day setting turns
//! that sub-sweep off.

use crate::config::LifecycleConfig;
use crate::error::ServiceResult;
use crate::store::Store;
use crate::util::format_timestamp;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub hibernated_agents: u64,
    pub hibernated_tasks: u64,
    pub expired_conversations: u64,
    pub purged_messages: u64,
    /// Sub-sweeps that hit a storage error in this pass.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<&'static str>,
}

impl SweepReport {
    pub fn total_actions(&self) -> u64 {
        self.hibernated_agents
            + self.hibernated_tasks
            + self.expired_conversations
            + self.purged_messages
    }
}

#[derive(Clone)]
pub struct LifecycleSweeper {
    store: Arc<Store>,
    config: LifecycleConfig,
}

impl LifecycleSweeper {
    pub fn new(store: Arc<Store>, config: LifecycleConfig) -> Self {
        Self { store, config }
    }

    /// One full pass at `now`.
    ///
    /// The sub-sweeps run in separate transactions. A failing sub-sweep is
    /// logged, counts zero and is listed in [`SweepReport::failed`]; the
    /// pass only returns `Err` when every sub-sweep failed.
    pub fn run_once(&self, now: DateTime<Utc>) -> ServiceResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut last_error = None;

        match self.store.with_transaction(|tx| {
            hibernate_idle_agents(tx, now, self.config.agent_inactive_days)
        }) {
            Ok((agents, tasks)) => {
                report.hibernated_agents = agents;
                report.hibernated_tasks = tasks;
            }
            Err(e) => record_failure(&mut report, &mut last_error, "hibernate", e),
        }
        match self.store.with_transaction(|tx| {
            expire_pending_conversations(tx, now, self.config.conversation_timeout_days)
        }) {
            Ok(expired) => report.expired_conversations = expired,
            Err(e) => record_failure(&mut report, &mut last_error, "expire", e),
        }
        match self.store.with_transaction(|tx| {
            purge_orphaned_messages(tx, now, self.config.message_ttl_days)
        }) {
            Ok(purged) => report.purged_messages = purged,
            Err(e) => record_failure(&mut report, &mut last_error, "purge", e),
        }

        if let Some(e) = last_error {
            if report.failed.len() == SUB_SWEEPS {
                return Err(e.into());
            }
        }

        if report.total_actions() > 0 {
            tracing::info!(
                "lifecycle sweep complete: hibernated_agents={} hibernated_tasks={} expired_conversations={} purged_messages={}",
                report.hibernated_agents,
                report.hibernated_tasks,
                report.expired_conversations,
                report.purged_messages,
            );
        }
        Ok(report)
    }

    /// Sweep immediately, then every `interval_secs`, until `cancel` fires.
    ///
    /// Each pass runs on the blocking pool so a long sweep holding the
    /// store lock does not occupy an async worker.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }

            let sweeper = self.clone();
            let pass = tokio::task::spawn_blocking(move || sweeper.run_once(Utc::now()))
                .await
                .context("lifecycle sweep task panicked")?;
            match pass {
                Ok(report) if report.failed.is_empty() => {
                    crate::health::mark_component_ok("sweeper");
                }
                Ok(report) => crate::health::mark_component_error(
                    "sweeper",
                    format!("sub-sweeps failed: {}", report.failed.join(", ")),
                ),
                Err(e) => {
                    crate::health::mark_component_error("sweeper", e.to_string());
                    tracing::warn!("Lifecycle sweep failed: {e}");
                }
            }
        }
    }
}

const SUB_SWEEPS: usize = 3;

fn record_failure(
    report: &mut SweepReport,
    last_error: &mut Option<rusqlite::Error>,
    sweep: &'static str,
    error: rusqlite::Error,
) {
    tracing::warn!(sweep, "Lifecycle sub-sweep failed: {error}");
    report.failed.push(sweep);
    *last_error = Some(error);
}

fn cutoff(now: DateTime<Utc>, days: u32) -> String {
    format_timestamp(now - Duration::days(i64::from(days)))
}

/// Agents whose last sign of life predates the cutoff go inactive, and so
/// do their active tasks. Their vectors are dropped with them.
fn hibernate_idle_agents(
    conn: &Connection,
    now: DateTime<Utc>,
    days: u32,
) -> Result<(u64, u64), rusqlite::Error> {
    if days == 0 {
        return Ok((0, 0));
    }
    let cutoff = cutoff(now, days);
    let stamp = format_timestamp(now);

    let idle: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM agents
             WHERE status = 'active' AND COALESCE(last_heartbeat, created_at) < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut tasks = 0_u64;
    for agent_id in &idle {
        conn.execute(
            "DELETE FROM task_embeddings WHERE task_id IN
                (SELECT id FROM tasks WHERE agent_id = ?1 AND status = 'active')",
            params![agent_id],
        )?;
        tasks += conn.execute(
            "UPDATE tasks SET status = 'inactive', updated_at = ?1
             WHERE agent_id = ?2 AND status = 'active'",
            params![stamp, agent_id],
        )? as u64;
        conn.execute(
            "UPDATE agents SET status = 'inactive' WHERE id = ?1 AND status = 'active'",
            params![agent_id],
        )?;
        tracing::debug!(agent_id = %agent_id, "Agent hibernated");
    }

    Ok((idle.len() as u64, tasks))
}

fn expire_pending_conversations(
    conn: &Connection,
    now: DateTime<Utc>,
    days: u32,
) -> Result<u64, rusqlite::Error> {
    if days == 0 {
        return Ok(0);
    }
    let expired = conn.execute(
        "UPDATE conversations SET state = 'expired', updated_at = ?1
         WHERE state = 'pending_acceptance' AND created_at < ?2",
        params![format_timestamp(now), cutoff(now, days)],
    )?;
    Ok(expired as u64)
}

/// Only messages to currently inactive agents are purged.
fn purge_orphaned_messages(
    conn: &Connection,
    now: DateTime<Utc>,
    days: u32,
) -> Result<u64, rusqlite::Error> {
    if days == 0 {
        return Ok(0);
    }
    let purged = conn.execute(
        "DELETE FROM message_queue
         WHERE created_at < ?1
           AND to_agent IN (SELECT id FROM agents WHERE status = 'inactive')",
        params![cutoff(now, days)],
    )?;
    Ok(purged as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        find_agent, find_conversation, find_task, AgentStatus, ConversationState, TaskStatus,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap()
    }

    fn days_ago(days: i64) -> String {
        format_timestamp(now() - Duration::days(days))
    }

    fn sweeper(config: LifecycleConfig) -> (Arc<Store>, LifecycleSweeper) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        (store.clone(), LifecycleSweeper::new(store, config))
    }

    fn insert_agent(store: &Store, id: &str, status: &str, created: &str, heartbeat: Option<&str>) {
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO agents (id, token_hash, display_name, ip_address, mac_address,
                                         status, last_heartbeat, created_at)
                     VALUES (?1, ?2, ?1, 'ip', 'mac', ?3, ?4, ?5)",
                    params![id, format!("hash-{id}"), status, heartbeat, created],
                )?;
                conn.execute(
                    "INSERT INTO tasks (id, agent_id, task_id, mode, type, title, keywords,
                                        created_at, updated_at)
                     VALUES (?1, ?2, 't', 'beacon', 'x', 'T', '[\"k\"]', ?3, ?3)",
                    params![format!("{id}-task"), id, created],
                )?;
                conn.execute(
                    "INSERT INTO task_embeddings (task_id, embedding, updated_at)
                     VALUES (?1, x'0000803f', ?2)",
                    params![format!("{id}-task"), created],
                )
            })
            .unwrap();
    }

    fn agent_status(store: &Store, id: &str) -> AgentStatus {
        store
            .with_connection(|conn| find_agent(conn, id))
            .unwrap()
            .unwrap()
            .status
    }

    fn count(store: &Store, sql: &str) -> i64 {
        store
            .with_connection(|conn| conn.query_row(sql, [], |row| row.get(0)))
            .unwrap()
    }

    #[test]
    fn hibernates_idle_agents_using_heartbeat_or_creation_time() {
        let (store, sweeper) = sweeper(LifecycleConfig::default());
        insert_agent(&store, "fresh", "active", &days_ago(60), Some(&days_ago(1)));
        insert_agent(&store, "stale", "active", &days_ago(60), Some(&days_ago(31)));
        insert_agent(&store, "silent", "active", &days_ago(45), None);
        insert_agent(&store, "newbie", "active", &days_ago(2), None);
        insert_agent(&store, "banned", "banned", &days_ago(90), None);

        let report = sweeper.run_once(now()).unwrap();
        assert_eq!(report.hibernated_agents, 2);
        assert_eq!(report.hibernated_tasks, 2);

        assert_eq!(agent_status(&store, "fresh"), AgentStatus::Active);
        assert_eq!(agent_status(&store, "stale"), AgentStatus::Inactive);
        assert_eq!(agent_status(&store, "silent"), AgentStatus::Inactive);
        assert_eq!(agent_status(&store, "newbie"), AgentStatus::Active);
        assert_eq!(agent_status(&store, "banned"), AgentStatus::Banned);

        let task = store
            .with_connection(|conn| find_task(conn, "stale-task"))
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Inactive);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM task_embeddings WHERE task_id = 'stale-task'"),
            0
        );
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM task_embeddings WHERE task_id = 'fresh-task'"),
            1
        );
    }

    #[test]
    fn sweeps_are_idempotent() {
        let (store, sweeper) = sweeper(LifecycleConfig::default());
        insert_agent(&store, "stale", "active", &days_ago(60), None);
        assert_eq!(sweeper.run_once(now()).unwrap().total_actions(), 2);
        assert_eq!(sweeper.run_once(now()).unwrap(), SweepReport::default());
    }

    #[test]
    fn expires_only_old_pending_conversations() {
        let (store, sweeper) = sweeper(LifecycleConfig::default());
        store
            .with_connection(|conn| -> rusqlite::Result<()> {
                for (id, state, created) in [
                    ("old-pending", "pending_acceptance", days_ago(8)),
                    ("new-pending", "pending_acceptance", days_ago(1)),
                    ("old-active", "active", days_ago(30)),
                ] {
                    conn.execute(
                        "INSERT INTO conversations (id, initiator_agent, target_agent,
                             initiator_task, target_task, state, created_at, updated_at)
                         VALUES (?1, 'a', 'b', 'ta', 'tb', ?2, ?3, ?3)",
                        params![id, state, created],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let report = sweeper.run_once(now()).unwrap();
        assert_eq!(report.expired_conversations, 1);

        let state = |id: &str| {
            store
                .with_connection(|conn| find_conversation(conn, id))
                .unwrap()
                .unwrap()
                .state
        };
        assert_eq!(state("old-pending"), ConversationState::Expired);
        assert_eq!(state("new-pending"), ConversationState::PendingAcceptance);
        assert_eq!(state("old-active"), ConversationState::Active);
    }

    #[test]
    fn purges_old_messages_for_inactive_agents_only() {
        let (store, sweeper) = sweeper(LifecycleConfig::default());
        insert_agent(&store, "sleeper", "inactive", &days_ago(60), None);
        insert_agent(&store, "awake", "active", &days_ago(1), Some(&days_ago(0)));
        insert_agent(&store, "banned", "banned", &days_ago(60), None);
        store
            .with_connection(|conn| -> rusqlite::Result<()> {
                for (id, to, created) in [
                    ("m1", "sleeper", days_ago(10)),
                    ("m2", "sleeper", days_ago(1)),
                    ("m3", "awake", days_ago(10)),
                    ("m4", "banned", days_ago(10)),
                ] {
                    conn.execute(
                        "INSERT INTO message_queue (id, conversation_id, from_agent, to_agent,
                                                    content, created_at)
                         VALUES (?1, 'c', 'x', ?2, 'hi', ?3)",
                        params![id, to, created],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let report = sweeper.run_once(now()).unwrap();
        assert_eq!(report.purged_messages, 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM message_queue WHERE id = 'm1'"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM message_queue"), 3);
    }

    #[test]
    fn zero_days_disables_each_sub_sweep() {
        let (store, sweeper) = sweeper(LifecycleConfig {
            agent_inactive_days: 0,
            conversation_timeout_days: 0,
            message_ttl_days: 0,
            ..LifecycleConfig::default()
        });
        insert_agent(&store, "stale", "active", &days_ago(400), None);
        assert_eq!(sweeper.run_once(now()).unwrap(), SweepReport::default());
        assert_eq!(agent_status(&store, "stale"), AgentStatus::Active);
    }

    fn insert_pending_conversation(store: &Store, id: &str, created: &str) {
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO conversations (id, initiator_agent, target_agent,
                         initiator_task, target_task, state, created_at, updated_at)
                     VALUES (?1, 'a', 'b', 'ta', 'tb', 'pending_acceptance', ?2, ?2)",
                    params![id, created],
                )
            })
            .unwrap();
    }

    fn drop_table(store: &Store, table: &str) {
        store
            .with_connection(|conn| conn.execute_batch(&format!("DROP TABLE {table}")))
            .unwrap();
    }

    #[test]
    fn failing_sub_sweep_does_not_block_the_others() {
        let (store, sweeper) = sweeper(LifecycleConfig::default());
        insert_agent(&store, "stale", "active", &days_ago(60), None);
        insert_pending_conversation(&store, "old-pending", &days_ago(60));
        drop_table(&store, "task_embeddings");

        let report = sweeper.run_once(now()).unwrap();
        assert_eq!(report.failed, vec!["hibernate"]);
        assert_eq!(report.hibernated_agents, 0);
        assert_eq!(report.expired_conversations, 1);

        // The failed hibernation rolled back as a whole.
        assert_eq!(agent_status(&store, "stale"), AgentStatus::Active);
        let state = store
            .with_connection(|conn| find_conversation(conn, "old-pending"))
            .unwrap()
            .unwrap()
            .state;
        assert_eq!(state, ConversationState::Expired);
    }

    #[test]
    fn pass_fails_only_when_every_sub_sweep_fails() {
        let (store, sweeper) = sweeper(LifecycleConfig::default());
        insert_agent(&store, "stale", "active", &days_ago(60), None);
        drop_table(&store, "task_embeddings");
        drop_table(&store, "conversations");
        drop_table(&store, "message_queue");

        assert!(sweeper.run_once(now()).is_err());
    }

    #[tokio::test]
    async fn run_sweeps_immediately_and_stops_on_cancel() {
        let (store, sweeper) = sweeper(LifecycleConfig {
            interval_secs: 3600,
            ..LifecycleConfig::default()
        });
        insert_agent(&store, "stale", "active", "2000-01-01T00:00:00.000000Z", None);

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { sweeper.run(cancel).await }
        });
        for _ in 0..50 {
            if agent_status(&store, "stale") == AgentStatus::Inactive {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(agent_status(&store, "stale"), AgentStatus::Inactive);
        assert_eq!(crate::health::component("sweeper").unwrap().status, "ok");
    }
}
