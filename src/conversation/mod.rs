//! Conversation identity and lifecycle.
//!
//! A conversation is keyed by the unordered pair of participants and the
//! unordered pair of their tasks, so both sides compute the same id no
//! matter who opens it. States:
//!
//! ```text
//! pending_acceptance ──(target replies)──> active
//! pending_acceptance | active ──(conclude)──> concluded_matched | concluded_no_match
//! pending_acceptance ──(sweeper timeout)──> expired
//! ```

use crate::error::{ServiceError, ServiceResult};
use crate::relay;
use crate::store::models::{map_conversation_row, CONVERSATION_COLUMNS};
use crate::store::{
    find_agent, find_conversation, resolve_task_ref, AgentStatus, Conversation, ConversationState,
    Store,
};
use crate::util::{digest_id, format_timestamp, is_blank};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Canonical conversation id, symmetric in both the agents and the tasks.
pub fn conversation_id(agent_a: &str, agent_b: &str, task_a: &str, task_b: &str) -> String {
    let (a1, a2) = ordered(agent_a, agent_b);
    let (t1, t2) = ordered(task_a, task_b);
    let agents = digest_id(&[a1, a2]);
    let tasks = digest_id(&[t1, t2]);
    digest_id(&[&agents, &tasks])
}

fn ordered<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Matched,
    NoMatch,
}

impl Outcome {
    fn terminal_state(self) -> ConversationState {
        match self {
            Self::Matched => ConversationState::ConcludedMatched,
            Self::NoMatch => ConversationState::ConcludedNoMatch,
        }
    }
}

impl FromStr for Outcome {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "matched" => Ok(Self::Matched),
            "no_match" => Ok(Self::NoMatch),
            _ => Err(ServiceError::validation(
                "outcome must be 'matched' or 'no_match'",
            )),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Matched => "matched",
            Self::NoMatch => "no_match",
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewConversation {
    #[serde(default)]
    pub target_agent_id: String,
    /// Initiator's task, by platform id or caller token.
    #[serde(default)]
    pub my_task_id: String,
    #[serde(default)]
    pub target_task_id: String,
    #[serde(default)]
    pub initial_message: String,
}

pub struct ConversationService {
    store: Arc<Store>,
}

impl ConversationService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Open a conversation, or return the existing one for the same pair.
    ///
    /// The boolean is `true` when a new row was created; only then is the
    /// opening message queued for the target.
    pub fn create_or_get(
        &self,
        initiator: &str,
        request: &NewConversation,
        now: DateTime<Utc>,
    ) -> ServiceResult<(Conversation, bool)> {
        let target = request.target_agent_id.trim();
        if target.is_empty() || is_blank(&request.my_task_id) || is_blank(&request.target_task_id)
        {
            return Err(ServiceError::validation(
                "target_agent_id, my_task_id and target_task_id are required",
            ));
        }
        if is_blank(&request.initial_message) {
            return Err(ServiceError::validation("initial_message is required"));
        }
        if target == initiator {
            return Err(ServiceError::validation(
                "cannot open a conversation with yourself",
            ));
        }

        let stamp = format_timestamp(now);
        let (conversation, created) = self.store.with_transaction(|tx| {
            let target_agent = find_agent(tx, target)?.ok_or(ServiceError::AgentNotFound)?;
            if target_agent.status == AgentStatus::Banned {
                return Err(ServiceError::AgentBanned);
            }

            let my_task = resolve_task_ref(tx, initiator, request.my_task_id.trim())?
                .ok_or(ServiceError::TaskNotFound)?;
            let target_task = resolve_task_ref(tx, target, request.target_task_id.trim())?
                .ok_or(ServiceError::TaskNotFound)?;

            let id = conversation_id(initiator, target, &my_task.id, &target_task.id);
            if let Some(existing) = find_conversation(tx, &id)? {
                return Ok((existing, false));
            }

            tx.execute(
                "INSERT INTO conversations (id, initiator_agent, target_agent, initiator_task,
                                            target_task, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending_acceptance', ?6, ?6)",
                params![id, initiator, target, my_task.id, target_task.id, stamp],
            )?;
            relay::enqueue(
                tx,
                &id,
                initiator,
                target,
                request.initial_message.trim(),
                now,
            )?;

            let conversation = find_conversation(tx, &id)?.ok_or(ServiceError::ConversationNotFound)?;
            Ok((conversation, true))
        })?;

        if created {
            tracing::info!(
                conversation_id = %conversation.id,
                initiator,
                target,
                "Conversation requested"
            );
        }
        Ok((conversation, created))
    }

    /// Move a conversation to its concluded state.
    ///
    /// Either participant may conclude from `pending_acceptance` or `active`.
    /// Terminal conversations reject further transitions.
    pub fn conclude(
        &self,
        conversation_id: &str,
        caller: &str,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> ServiceResult<Conversation> {
        let stamp = format_timestamp(now);
        let next = outcome.terminal_state();

        let conversation = self.store.with_transaction(|tx| {
            let mut conversation =
                find_conversation(tx, conversation_id)?.ok_or(ServiceError::ConversationNotFound)?;
            if !conversation.is_participant(caller) {
                return Err(ServiceError::NotParticipant);
            }
            if conversation.state.is_terminal() {
                return Err(ServiceError::validation(format!(
                    "conversation is already {}",
                    conversation.state
                )));
            }

            tx.execute(
                "UPDATE conversations SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![next, stamp, conversation.id],
            )?;
            conversation.state = next;
            conversation.updated_at = now;
            Ok(conversation)
        })?;

        tracing::info!(
            conversation_id = %conversation.id,
            outcome = %outcome,
            "Conversation concluded"
        );
        Ok(conversation)
    }

    /// Every conversation the agent takes part in, most recently updated first.
    pub fn list_for_agent(&self, agent_id: &str) -> ServiceResult<Vec<Conversation>> {
        let conversations = self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE initiator_agent = ?1 OR target_agent = ?1
                 ORDER BY updated_at DESC, id ASC"
            ))?;
            let rows = stmt.query_map(params![agent_id], map_conversation_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(conversations)
    }

    pub fn get(&self, conversation_id: &str) -> ServiceResult<Conversation> {
        self.store
            .with_connection(|conn| find_conversation(conn, conversation_id))?
            .ok_or(ServiceError::ConversationNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MessageRelay;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 15, 30, 0).unwrap()
    }

    fn seed(store: &Store, agent: &str, status: &str) {
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO agents (id, token_hash, display_name, ip_address, mac_address,
                                         status, created_at)
                     VALUES (?1, ?2, ?1, 'ip', 'mac', ?3, ?4)",
                    params![agent, format!("hash-{agent}"), status, format_timestamp(now())],
                )?;
                conn.execute(
                    "INSERT INTO tasks (id, agent_id, task_id, mode, type, title, created_at,
                                        updated_at)
                     VALUES (?1, ?2, 'job', 'radar', 'hiring', 'Job', ?3, ?3)",
                    params![format!("{agent}-job"), agent, format_timestamp(now())],
                )
            })
            .unwrap();
    }

    fn setup() -> (Arc<Store>, ConversationService) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed(&store, "ann", "active");
        seed(&store, "ben", "active");
        (store.clone(), ConversationService::new(store))
    }

    fn request(target: &str, message: &str) -> NewConversation {
        NewConversation {
            target_agent_id: target.into(),
            my_task_id: "job".into(),
            target_task_id: "job".into(),
            initial_message: message.into(),
        }
    }

    #[test]
    fn conversation_id_is_symmetric() {
        let forward = conversation_id("x", "y", "s", "t");
        assert_eq!(forward, conversation_id("y", "x", "t", "s"));
        assert_eq!(forward, conversation_id("y", "x", "s", "t"));
        assert_ne!(forward, conversation_id("x", "y", "s", "u"));
        assert_eq!(forward.len(), crate::util::ID_HEX_LEN);
    }

    #[test]
    fn outcome_parses_wire_values() {
        assert_eq!("matched".parse::<Outcome>().unwrap(), Outcome::Matched);
        assert_eq!("no_match".parse::<Outcome>().unwrap(), Outcome::NoMatch);
        assert!("maybe".parse::<Outcome>().is_err());
    }

    #[test]
    fn create_is_idempotent_from_either_side() {
        let (store, service) = setup();
        let (first, created) = service
            .create_or_get("ann", &request("ben", "hi ben"), now())
            .unwrap();
        assert!(created);
        assert_eq!(first.state, ConversationState::PendingAcceptance);
        assert_eq!(first.initiator_task, "ann-job");
        assert_eq!(first.target_task, "ben-job");

        let (again, created) = service
            .create_or_get("ann", &request("ben", "hi again"), now())
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, first.id);

        let (reverse, created) = service
            .create_or_get("ben", &request("ann", "hello ann"), now())
            .unwrap();
        assert!(!created);
        assert_eq!(reverse.id, first.id);

        let relay = MessageRelay::new(store);
        let inbound = relay.pull("ben").unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].content, "hi ben");
        assert!(relay.pull("ann").unwrap().is_empty());
    }

    #[test]
    fn create_rejects_missing_banned_and_self_targets() {
        let (store, service) = setup();
        seed(&store, "bad", "banned");

        assert!(matches!(
            service.create_or_get("ann", &request("ghost", "hi"), now()),
            Err(ServiceError::AgentNotFound)
        ));
        assert!(matches!(
            service.create_or_get("ann", &request("bad", "hi"), now()),
            Err(ServiceError::AgentBanned)
        ));
        assert!(matches!(
            service.create_or_get("ann", &request("ann", "hi"), now()),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            service.create_or_get("ann", &request("ben", " "), now()),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn create_resolves_tasks_against_their_owners() {
        let (_, service) = setup();
        let mut wrong_owner = request("ben", "hi");
        wrong_owner.target_task_id = "ann-job".into();
        assert!(matches!(
            service.create_or_get("ann", &wrong_owner, now()),
            Err(ServiceError::TaskNotFound)
        ));

        let mut by_platform_id = request("ben", "hi");
        by_platform_id.my_task_id = "ann-job".into();
        by_platform_id.target_task_id = "ben-job".into();
        let (conversation, _) = service.create_or_get("ann", &by_platform_id, now()).unwrap();
        assert_eq!(
            conversation.id,
            conversation_id("ann", "ben", "ann-job", "ben-job")
        );
    }

    #[test]
    fn conclude_from_pending_then_rejects_second_conclude() {
        let (_, service) = setup();
        let (conversation, _) = service
            .create_or_get("ann", &request("ben", "hi"), now())
            .unwrap();

        let later = now() + Duration::minutes(5);
        let concluded = service
            .conclude(&conversation.id, "ben", Outcome::NoMatch, later)
            .unwrap();
        assert_eq!(concluded.state, ConversationState::ConcludedNoMatch);
        assert_eq!(concluded.updated_at, later);

        assert!(matches!(
            service.conclude(&conversation.id, "ann", Outcome::Matched, later),
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(
            service.get(&conversation.id).unwrap().state,
            ConversationState::ConcludedNoMatch
        );
    }

    #[test]
    fn conclude_checks_existence_before_participation() {
        let (store, service) = setup();
        seed(&store, "eve", "active");
        let (conversation, _) = service
            .create_or_get("ann", &request("ben", "hi"), now())
            .unwrap();

        assert!(matches!(
            service.conclude("missing", "eve", Outcome::Matched, now()),
            Err(ServiceError::ConversationNotFound)
        ));
        assert!(matches!(
            service.conclude(&conversation.id, "eve", Outcome::Matched, now()),
            Err(ServiceError::NotParticipant)
        ));
    }

    #[test]
    fn list_orders_by_most_recent_update() {
        let (store, service) = setup();
        seed(&store, "cat", "active");
        let (older, _) = service
            .create_or_get("ann", &request("ben", "hi"), now())
            .unwrap();
        let (newer, _) = service
            .create_or_get("cat", &request("ann", "hey"), now() + Duration::minutes(1))
            .unwrap();
        service
            .create_or_get("ben", &request("cat", "yo"), now())
            .unwrap();

        let ids: Vec<_> = service
            .list_for_agent("ann")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }
}
