//! Abuse reports and threshold bans.
//!
//! Reports are append-only. The target's counter is bumped and compared to
//! the threshold in a single `UPDATE ... RETURNING`, inside the same
//! transaction as the report insert, so concurrent reports cannot miss a ban.
//! A ban is permanent.

use crate::config::ModerationConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::store::{find_agent, AgentStatus, Store};
use crate::util::{format_timestamp, is_blank};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewReport {
    #[serde(default)]
    pub reported_agent_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub report_id: String,
    /// True when the target is banned after this report.
    pub banned: bool,
    #[serde(skip)]
    pub report_count: u32,
}

pub struct ModerationService {
    store: Arc<Store>,
    config: ModerationConfig,
}

impl ModerationService {
    pub fn new(store: Arc<Store>, config: ModerationConfig) -> Self {
        Self { store, config }
    }

    pub fn admin_email(&self) -> &str {
        &self.config.admin_email
    }

    pub fn report(
        &self,
        reporter: &str,
        report: &NewReport,
        now: DateTime<Utc>,
    ) -> ServiceResult<ReportOutcome> {
        let target = report.reported_agent_id.trim();
        if target.is_empty() {
            return Err(ServiceError::validation("reported_agent_id is required"));
        }
        if is_blank(&report.reason) {
            return Err(ServiceError::validation("reason is required"));
        }
        if target == reporter {
            return Err(ServiceError::InvalidReport("cannot report yourself".into()));
        }

        let report_id = uuid::Uuid::new_v4().to_string();
        let threshold = self.config.ban_threshold.max(1);
        let stamp = format_timestamp(now);

        let outcome = self.store.with_transaction(|tx| {
            let previous = find_agent(tx, target)?.ok_or(ServiceError::AgentNotFound)?;

            tx.execute(
                "INSERT INTO reports (id, reporter_agent, reported_agent, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![report_id, reporter, target, report.reason.trim(), stamp],
            )?;

            let (report_count, status): (u32, AgentStatus) = tx.query_row(
                "UPDATE agents
                 SET report_count = report_count + 1,
                     status = CASE WHEN report_count + 1 >= ?1 THEN 'banned' ELSE status END
                 WHERE id = ?2
                 RETURNING report_count, status",
                params![threshold, target],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let banned = status == AgentStatus::Banned;
            if banned && previous.status != AgentStatus::Banned {
                tracing::warn!(
                    agent_id = target,
                    report_count,
                    "Agent banned after reaching report threshold"
                );
            }
            Ok::<_, ServiceError>(ReportOutcome {
                report_id: report_id.clone(),
                banned,
                report_count,
            })
        })?;

        tracing::info!(
            reporter,
            reported = target,
            report_count = outcome.report_count,
            "Report recorded"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, 8, 0, 0).unwrap()
    }

    fn service(threshold: u32) -> (Arc<Store>, ModerationService) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for id in ["target", "r1", "r2", "r3"] {
            store
                .with_connection(|conn| {
                    conn.execute(
                        "INSERT INTO agents (id, token_hash, display_name, ip_address,
                                             mac_address, created_at)
                         VALUES (?1, ?2, ?1, 'ip', 'mac', ?3)",
                        params![id, format!("hash-{id}"), format_timestamp(now())],
                    )
                })
                .unwrap();
        }
        let config = ModerationConfig {
            ban_threshold: threshold,
            ..ModerationConfig::default()
        };
        (store.clone(), ModerationService::new(store, config))
    }

    fn report_against(target: &str) -> NewReport {
        NewReport {
            reported_agent_id: target.into(),
            reason: "spam".into(),
        }
    }

    fn target_state(store: &Store) -> (u32, AgentStatus) {
        let agent = store
            .with_connection(|conn| find_agent(conn, "target"))
            .unwrap()
            .unwrap();
        (agent.report_count, agent.status)
    }

    #[test]
    fn threshold_minus_one_reports_leave_agent_active() {
        let (store, service) = service(3);
        for reporter in ["r1", "r2"] {
            let outcome = service
                .report(reporter, &report_against("target"), now())
                .unwrap();
            assert!(!outcome.banned);
        }
        assert_eq!(target_state(&store), (2, AgentStatus::Active));
    }

    #[test]
    fn reaching_threshold_bans() {
        let (store, service) = service(3);
        let outcomes: Vec<_> = ["r1", "r2", "r3"]
            .iter()
            .map(|r| service.report(r, &report_against("target"), now()).unwrap())
            .collect();
        assert!(!outcomes[1].banned);
        assert!(outcomes[2].banned);
        assert_eq!(target_state(&store), (3, AgentStatus::Banned));

        // Further reports keep counting; the ban stays.
        assert!(service
            .report("r1", &report_against("target"), now())
            .unwrap()
            .banned);
        assert_eq!(target_state(&store), (4, AgentStatus::Banned));
    }

    #[test]
    fn self_reports_never_count() {
        let (store, service) = service(1);
        let err = service
            .report("target", &report_against("target"), now())
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidReport(_)));
        assert_eq!(target_state(&store), (0, AgentStatus::Active));
    }

    #[test]
    fn unknown_target_is_not_found_and_records_nothing() {
        let (store, service) = service(3);
        assert!(matches!(
            service.report("r1", &report_against("ghost"), now()),
            Err(ServiceError::AgentNotFound)
        ));
        let reports: i64 = store
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM reports", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(reports, 0);
    }

    #[test]
    fn reason_is_required() {
        let (_, service) = service(3);
        let mut report = report_against("target");
        report.reason = "  ".into();
        assert!(matches!(
            service.report("r1", &report, now()),
            Err(ServiceError::Validation(_))
        ));
    }
}
