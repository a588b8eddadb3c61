use crate::config::Config;
use crate::lifecycle::LifecycleSweeper;
use crate::store::Store;
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const STATUS_FLUSH_SECONDS: u64 = 5;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

/// Run the gateway and the lifecycle sweeper until Ctrl-C.
pub async fn run(config: Config, host: String, port: u16) -> Result<()> {
    let db_path = config.db_path();
    let store = Arc::new(
        Store::open(&db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "Database ready");

    crate::health::mark_component_ok("daemon");

    let mut handles: Vec<JoinHandle<()>> = vec![spawn_state_writer(config.clone())];

    {
        let gateway_cfg = config.clone();
        let gateway_store = store.clone();
        let gateway_host = host.clone();
        handles.push(spawn_component_supervisor(
            "gateway",
            INITIAL_BACKOFF_SECS,
            MAX_BACKOFF_SECS,
            move || {
                let cfg = gateway_cfg.clone();
                let store = gateway_store.clone();
                let host = gateway_host.clone();
                async move { crate::gateway::run_gateway(&host, port, cfg, store).await }
            },
        ));
    }

    let cancel = CancellationToken::new();
    let sweeper_on = config.lifecycle.enabled;
    if sweeper_on {
        let sweeper = LifecycleSweeper::new(store.clone(), config.lifecycle.clone());
        let sweeper_cancel = cancel.clone();
        handles.push(spawn_component_supervisor(
            "sweeper",
            INITIAL_BACKOFF_SECS,
            MAX_BACKOFF_SECS,
            move || {
                let sweeper = sweeper.clone();
                let token = sweeper_cancel.clone();
                async move { sweeper.run(token).await }
            },
        ));
    } else {
        tracing::info!("Lifecycle sweeper disabled");
    }

    tracing::info!(
        "agentsocial daemon started: gateway http://{host}:{port}, sweeper {}",
        if sweeper_on { "on" } else { "off" }
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    crate::health::mark_component_error("daemon", "shutdown requested");

    cancel.cancel();
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config
        .config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join("daemon_state.json")
}

fn spawn_state_writer(config: Config) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = state_file_path(&config);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_FLUSH_SECONDS));
        loop {
            interval.tick().await;
            let mut json = crate::health::snapshot_json();
            if let Some(obj) = json.as_object_mut() {
                obj.insert(
                    "written_at".into(),
                    serde_json::json!(Utc::now().to_rfc3339()),
                );
            }
            let data = serde_json::to_vec_pretty(&json).unwrap_or_else(|_| b"{}".to_vec());
            let _ = tokio::fs::write(&path, data).await;
        }
    })
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::mark_component_ok(name);
            match run_component().await {
                Ok(()) => {
                    crate::health::mark_component_error(name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    crate::health::mark_component_error(name, e.to_string());
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            crate::health::bump_component_restart(name);
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use crate::store::{find_conversation, ConversationState};
    use tempfile::TempDir;

    #[test]
    fn state_file_path_uses_config_directory() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            config_path: tmp.path().join("config.toml"),
            ..Config::default()
        };

        assert_eq!(state_file_path(&config), tmp.path().join("daemon_state.json"));
    }

    #[tokio::test]
    async fn supervisor_marks_error_and_restart_on_failure() {
        let handle = spawn_component_supervisor("daemon-test-fail", 1, 1, || async {
            anyhow::bail!("boom")
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        let _ = handle.await;

        let snapshot = crate::health::snapshot_json();
        let component = &snapshot["components"]["daemon-test-fail"];
        assert_eq!(component["status"], "error");
        assert!(component["restart_count"].as_u64().unwrap_or(0) >= 1);
        assert!(component["last_error"]
            .as_str()
            .unwrap_or("")
            .contains("boom"));
    }

    #[tokio::test]
    async fn supervised_sweeper_applies_sweeps() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO conversations (id, initiator_agent, target_agent,
                         initiator_task, target_task, state, created_at, updated_at)
                     VALUES ('c1', 'a', 'b', 'ta', 'tb', 'pending_acceptance',
                             '2000-01-01T00:00:00.000000Z', '2000-01-01T00:00:00.000000Z')",
                    [],
                )
            })
            .unwrap();
        let sweeper = LifecycleSweeper::new(store.clone(), LifecycleConfig::default());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = spawn_component_supervisor("daemon-test-sweeper", 1, 1, move || {
            let sweeper = sweeper.clone();
            let token = token.clone();
            async move { sweeper.run(token).await }
        });

        let state = || {
            store
                .with_connection(|conn| find_conversation(conn, "c1"))
                .unwrap()
                .unwrap()
                .state
        };
        for _ in 0..50 {
            if state() == ConversationState::Expired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        handle.abort();
        let _ = handle.await;

        assert_eq!(state(), ConversationState::Expired);
    }

    #[tokio::test]
    async fn supervisor_marks_unexpected_exit_as_error() {
        let handle = spawn_component_supervisor("daemon-test-exit", 1, 1, || async { Ok(()) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        let _ = handle.await;

        let component = crate::health::component("daemon-test-exit").unwrap();
        assert_eq!(component.status, "error");
        assert!(component.restart_count >= 1);
        assert!(component
            .last_error
            .unwrap_or_default()
            .contains("component exited unexpectedly"));
    }
}
