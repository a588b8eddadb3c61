//! Hibernation, expiry and purge across a full network, then wake-up on the
//! next authenticated request.

use agentsocial::config::{Config, LifecycleConfig};
use agentsocial::conversation::NewConversation;
use agentsocial::embedding::EmbeddingProvider;
use agentsocial::gateway::AppState;
use agentsocial::identity::{NewTask, RegisteredAgent, Registration};
use agentsocial::lifecycle::{LifecycleSweeper, SweepReport};
use agentsocial::store::{AgentStatus, ConversationState, Store, TaskStatus};
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

struct ConstantEmbedding;

#[async_trait]
impl EmbeddingProvider for ConstantEmbedding {
    fn name(&self) -> &str {
        "constant"
    }

    fn dimensions(&self) -> usize {
        3
    }

    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(vec![1.0, 0.5, 0.25])
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap()
}

fn network() -> (AppState, LifecycleSweeper) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let config = Config::default();
    let sweeper = LifecycleSweeper::new(store.clone(), LifecycleConfig::default());
    (
        AppState::new(config, store, Arc::new(ConstantEmbedding)),
        sweeper,
    )
}

async fn join(state: &AppState, name: &str, ip: &str, mode: &str) -> RegisteredAgent {
    let registered = state
        .identity
        .register_agent(
            &Registration {
                display_name: name.into(),
                public_bio: String::new(),
                ip_address: ip.into(),
                mac_address: "de:ad:be:ef:00:01".into(),
                tasks: vec![NewTask {
                    task_id: "main".into(),
                    mode: mode.into(),
                    task_type: "research".into(),
                    title: format!("{name} research"),
                    keywords: vec!["datasets".into()],
                }],
            },
            t0(),
        )
        .unwrap();
    for task in &registered.tasks {
        assert!(state.matcher.sync_task(task, t0()).await.unwrap());
    }
    registered
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    headers
}

#[tokio::test]
async fn sweep_hibernates_expires_and_purges_together() {
    let (state, sweeper) = network();
    let alice = join(&state, "Alice", "198.51.100.1", "radar").await;
    let bob = join(&state, "Bob", "198.51.100.2", "beacon").await;

    let (conversation, _) = state
        .conversations
        .create_or_get(
            &alice.agent.id,
            &NewConversation {
                target_agent_id: bob.agent.id.clone(),
                my_task_id: "main".into(),
                target_task_id: bob.tasks[0].id.clone(),
                initial_message: "Want to pair on this?".into(),
            },
            t0(),
        )
        .unwrap();

    // Nothing is old enough yet.
    let quiet = sweeper.run_once(t0() + Duration::days(1)).unwrap();
    assert_eq!(quiet, SweepReport::default());

    let report = sweeper.run_once(t0() + Duration::days(31)).unwrap();
    assert_eq!(
        report,
        SweepReport {
            hibernated_agents: 2,
            hibernated_tasks: 2,
            expired_conversations: 1,
            purged_messages: 1,
            failed: Vec::new(),
        }
    );

    let (agent, tasks) = state.identity.profile(&bob.agent.id).unwrap();
    assert_eq!(agent.status, AgentStatus::Inactive);
    assert_eq!(tasks[0].status, TaskStatus::Inactive);
    assert!(!state.matcher.has_vector(&tasks[0].id).unwrap());
    assert_eq!(
        state.conversations.get(&conversation.id).unwrap().state,
        ConversationState::Expired
    );
    assert!(state.relay.pull(&bob.agent.id).unwrap().is_empty());

    // A second pass finds nothing left to do.
    let again = sweeper.run_once(t0() + Duration::days(32)).unwrap();
    assert_eq!(again.total_actions(), 0);
}

#[tokio::test]
async fn authenticated_request_wakes_agent_and_reindexes_tasks() {
    let (state, sweeper) = network();
    let carol = join(&state, "Carol", "198.51.100.3", "beacon").await;
    let task_id = carol.tasks[0].id.clone();

    sweeper.run_once(t0() + Duration::days(45)).unwrap();
    assert!(!state.matcher.has_vector(&task_id).unwrap());

    let agent = state.authenticate(&bearer(&carol.token)).await.unwrap();

    assert_eq!(agent.status, AgentStatus::Active);
    assert!(agent.last_heartbeat.is_some());
    let (_, tasks) = state.identity.profile(&carol.agent.id).unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Active);
    assert!(state.matcher.has_vector(&task_id).unwrap());
}

#[tokio::test]
async fn paused_tasks_stay_paused_through_hibernation() {
    let (state, sweeper) = network();
    let dave = join(&state, "Dave", "198.51.100.4", "radar").await;
    state
        .identity
        .update_task(
            &dave.agent.id,
            "main",
            &agentsocial::identity::TaskPatch {
                status: Some("paused".into()),
                ..Default::default()
            },
            t0(),
        )
        .unwrap();

    let report = sweeper.run_once(t0() + Duration::days(31)).unwrap();
    assert_eq!(report.hibernated_agents, 1);
    assert_eq!(report.hibernated_tasks, 0);

    state.authenticate(&bearer(&dave.token)).await.unwrap();
    let (_, tasks) = state.identity.profile(&dave.agent.id).unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Paused);
    assert!(!state.matcher.has_vector(&tasks[0].id).unwrap());
}

#[tokio::test]
async fn recent_heartbeat_keeps_agent_awake() {
    let (state, sweeper) = network();
    let erin = join(&state, "Erin", "198.51.100.5", "beacon").await;

    // Authentication stamps last_heartbeat with the wall clock, so sweep
    // relative to that instead of the registration time.
    let agent = state.authenticate(&bearer(&erin.token)).await.unwrap();
    let seen = agent.last_heartbeat.unwrap();

    let report = sweeper.run_once(seen + Duration::days(29)).unwrap();
    assert_eq!(report.hibernated_agents, 0);

    let (agent, tasks) = state.identity.profile(&erin.agent.id).unwrap();
    assert_eq!(agent.status, AgentStatus::Active);
    assert!(state.matcher.has_vector(&tasks[0].id).unwrap());
}
