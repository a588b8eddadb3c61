//! Embedding-backed matching of complementary tasks.
//!
//! One vector is stored per active task with keywords. A scan embeds the
//! query text, compares it against every stored vector of other active
//! agents, and returns the best candidates whose mode complements the
//! caller's. There is no index: each scan reads all active vectors.

use crate::config::MatchingConfig;
use crate::embedding::{cosine_similarity, decode_vector, encode_vector, EmbeddingProvider};
use crate::error::{ServiceError, ServiceResult};
use crate::store::{resolve_task_ref, Store, Task, TaskMode, TaskStatus};
use crate::util::format_timestamp;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;

/// Parameters of a single scan.
#[derive(Debug, Clone)]
pub struct ScanQuery {
    /// Caller. Its own tasks are never returned.
    pub agent_id: String,
    /// Mode of the caller's task; results are filtered to its complement.
    pub task_mode: TaskMode,
    pub query_text: String,
    pub max_results: usize,
    pub min_score: f64,
    /// Only consider agents seen at or after this instant.
    pub activity_cutoff: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub agent_id: String,
    pub task_id: String,
    pub display_name: String,
    pub public_bio: String,
    pub mode: TaskMode,
    #[serde(rename = "type")]
    pub task_type: String,
    pub title: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub matches: Vec<Candidate>,
    pub next_scan_after: DateTime<Utc>,
}

pub struct Matcher {
    store: Arc<Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: MatchingConfig,
}

impl Matcher {
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Compute and store the vector for a task.
    ///
    /// Provider failures are logged and leave the task without a vector
    /// (`Ok(false)`); the task stays valid and scans simply skip it. Blank
    /// keyword text removes any stored vector. The write is skipped, also
    /// with `Ok(false)`, when the task stopped being matchable while the
    /// provider was computing the vector.
    pub async fn index_task(
        &self,
        task_id: &str,
        keyword_text: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<bool> {
        if keyword_text.trim().is_empty() {
            self.remove_task(task_id)?;
            return Ok(false);
        }

        let vector = match self.embedder.embed(keyword_text).await {
            Ok(vector) if !vector.is_empty() => vector,
            Ok(_) => {
                tracing::warn!(task_id, "Embedding provider returned an empty vector");
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!(task_id, "Failed to compute embedding: {e:#}");
                return Ok(false);
            }
        };

        let written = self
            .store
            .with_connection(|conn| store_vector(conn, task_id, &vector, now))?;
        if !written {
            tracing::debug!(task_id, "Task no longer matchable, vector discarded");
        }
        Ok(written)
    }

    /// Index a task if it is matchable, otherwise drop its vector.
    pub async fn sync_task(&self, task: &Task, now: DateTime<Utc>) -> ServiceResult<bool> {
        if task.status == TaskStatus::Active && !task.keywords.is_empty() {
            self.index_task(&task.id, &task.keyword_text(), now).await
        } else {
            self.remove_task(&task.id)?;
            Ok(false)
        }
    }

    pub fn remove_task(&self, task_id: &str) -> ServiceResult<()> {
        self.store
            .with_connection(|conn| remove_vector(conn, task_id))?;
        Ok(())
    }

    pub fn has_vector(&self, task_id: &str) -> ServiceResult<bool> {
        let found: i64 = self.store.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM task_embeddings WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
        })?;
        Ok(found > 0)
    }

    /// Rank candidate tasks for `query`.
    ///
    /// Scores below `min_score` are dropped, the rest sorted by score
    /// descending with task id ascending as tie-break, truncated to
    /// `max_results`, and only then filtered to the complementary mode.
    pub async fn scan(&self, query: &ScanQuery) -> ServiceResult<Vec<Candidate>> {
        let query_vector = self
            .embedder
            .embed(&query.query_text)
            .await
            .map_err(|e| ServiceError::EmbeddingUnavailable(format!("{e:#}")))?;
        if query_vector.is_empty() {
            return Err(ServiceError::EmbeddingUnavailable(
                "provider returned an empty vector".into(),
            ));
        }

        let cutoff = query.activity_cutoff.map(format_timestamp);
        let rows = self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.agent_id, t.mode, t.type, t.title,
                        a.display_name, a.public_bio, e.embedding
                 FROM task_embeddings e
                 JOIN tasks t ON t.id = e.task_id
                 JOIN agents a ON a.id = t.agent_id
                 WHERE t.status = 'active'
                   AND a.status = 'active'
                   AND a.id != ?1
                   AND (?2 IS NULL OR COALESCE(a.last_heartbeat, a.created_at) >= ?2)",
            )?;
            let mapped = stmt.query_map(params![query.agent_id, cutoff], |row| {
                let blob: Vec<u8> = row.get(7)?;
                Ok((
                    Candidate {
                        task_id: row.get(0)?,
                        agent_id: row.get(1)?,
                        mode: row.get(2)?,
                        task_type: row.get(3)?,
                        title: row.get(4)?,
                        display_name: row.get(5)?,
                        public_bio: row.get(6)?,
                        score: 0.0,
                    },
                    blob,
                ))
            })?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let scored = rows
            .into_iter()
            .map(|(mut candidate, blob)| {
                candidate.score = cosine_similarity(&query_vector, &decode_vector(&blob));
                candidate
            })
            .collect();

        Ok(rank_candidates(
            scored,
            query.min_score,
            query.max_results,
            query.task_mode,
        ))
    }

    /// Scan on behalf of one of the caller's tasks using configured limits.
    ///
    /// `keywords` defaults to the task's own keywords when empty.
    pub async fn scan_for_task(
        &self,
        agent_id: &str,
        task_reference: &str,
        keywords: &[String],
        now: DateTime<Utc>,
    ) -> ServiceResult<ScanResult> {
        let task = self
            .store
            .with_connection(|conn| resolve_task_ref(conn, agent_id, task_reference))?
            .ok_or(ServiceError::TaskNotFound)?;

        let query_text = {
            let requested: Vec<&str> = keywords
                .iter()
                .map(|k| k.trim())
                .filter(|k| !k.is_empty())
                .collect();
            if requested.is_empty() {
                task.keyword_text()
            } else {
                requested.join(" ")
            }
        };
        if query_text.trim().is_empty() {
            return Err(ServiceError::validation("keywords are required"));
        }

        let activity_cutoff = (self.config.active_within_hours > 0)
            .then(|| now - Duration::hours(i64::from(self.config.active_within_hours)));

        let matches = self
            .scan(&ScanQuery {
                agent_id: agent_id.to_string(),
                task_mode: task.mode,
                query_text,
                max_results: self.config.max_results,
                min_score: self.config.min_score,
                activity_cutoff,
            })
            .await?;

        tracing::debug!(
            agent_id,
            task_id = %task.id,
            matches = matches.len(),
            "Scan complete"
        );

        let delay = i64::try_from(self.config.next_scan_after_secs).unwrap_or(i64::MAX);
        Ok(ScanResult {
            matches,
            next_scan_after: now + Duration::seconds(delay),
        })
    }
}

/// Threshold, order, truncate, then keep only the complementary mode.
fn rank_candidates(
    mut candidates: Vec<Candidate>,
    min_score: f64,
    max_results: usize,
    caller_mode: TaskMode,
) -> Vec<Candidate> {
    candidates.retain(|c| c.score >= min_score);
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    candidates.truncate(max_results);

    let wanted = caller_mode.complement();
    candidates.retain(|c| c.mode == wanted);
    candidates
}

/// Upsert the vector only if the task row is currently active with
/// keywords. Returns whether a row was written.
pub fn store_vector(
    conn: &Connection,
    task_id: &str,
    vector: &[f32],
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let written = conn.execute(
        "INSERT INTO task_embeddings (task_id, embedding, updated_at)
         SELECT ?1, ?2, ?3
         WHERE EXISTS (SELECT 1 FROM tasks
                       WHERE id = ?1 AND status = 'active' AND keywords != '[]')
         ON CONFLICT(task_id) DO UPDATE SET embedding = excluded.embedding,
                                            updated_at = excluded.updated_at",
        params![task_id, encode_vector(vector), format_timestamp(now)],
    )?;
    Ok(written > 0)
}

pub fn remove_vector(conn: &Connection, task_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM task_embeddings WHERE task_id = ?1",
        params![task_id],
    )?;
    Ok(())
}
