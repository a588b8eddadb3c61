//! Process-wide component health registry.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub updated_at: DateTime<Utc>,
    pub last_ok: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restart_count: u64,
}

impl ComponentHealth {
    fn new() -> Self {
        Self {
            status: "starting".into(),
            updated_at: Utc::now(),
            last_ok: None,
            last_error: None,
            restart_count: 0,
        }
    }
}

struct Registry {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        started_at: Instant::now(),
        components: Mutex::new(BTreeMap::new()),
    })
}

fn update(component: &str, apply: impl FnOnce(&mut ComponentHealth)) {
    let mut components = registry().components.lock();
    let entry = components
        .entry(component.to_string())
        .or_insert_with(ComponentHealth::new);
    apply(entry);
    entry.updated_at = Utc::now();
}

pub fn mark_component_ok(component: &str) {
    update(component, |health| {
        health.status = "ok".into();
        health.last_ok = Some(Utc::now());
    });
}

pub fn mark_component_error(component: &str, error: impl ToString) {
    let error = error.to_string();
    update(component, |health| {
        health.status = "error".into();
        health.last_error = Some(error);
    });
}

pub fn bump_component_restart(component: &str) {
    update(component, |health| {
        health.restart_count = health.restart_count.saturating_add(1);
    });
}

pub fn component(component: &str) -> Option<ComponentHealth> {
    registry().components.lock().get(component).cloned()
}

pub fn snapshot_json() -> serde_json::Value {
    let registry = registry();
    let components = registry.components.lock().clone();
    serde_json::json!({
        "pid": std::process::id(),
        "uptime_seconds": registry.started_at.elapsed().as_secs(),
        "components": components,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_and_restarts_are_recorded() {
        mark_component_ok("health-test-a");
        bump_component_restart("health-test-a");
        mark_component_error("health-test-a", "boom");

        let health = component("health-test-a").unwrap();
        assert_eq!(health.status, "error");
        assert_eq!(health.last_error.as_deref(), Some("boom"));
        assert_eq!(health.restart_count, 1);
        assert!(health.last_ok.is_some());
    }

    #[test]
    fn snapshot_lists_components() {
        mark_component_ok("health-test-b");
        let snapshot = snapshot_json();
        assert_eq!(snapshot["components"]["health-test-b"]["status"], "ok");
        assert!(snapshot["uptime_seconds"].is_u64());
    }
}
