use std::collections::HashMap;
use std::sync::Arc;

use relay_protocol::WireEvent;
use tokio::sync::{Notify, RwLock, broadcast};

/// Capacity of the volatile frame broadcast channel; a slow receiver misses
/// frames (`RecvError::Lagged`) rather than blocking the agent (§5, "volatile").
const FRAME_CHANNEL_CAPACITY: usize = 4;
/// Capacity of the reliable event broadcast channel per group/agent.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The live socket for one Agent Key. Exactly one per key at any time.
pub struct AgentConnection {
    pub user_id: String,
    pub machine_id: String,
    pub agent_key: String,
    /// Most recent `screen-info` emitted by this agent; shown to any newly
    /// attached viewer immediately (§4.7 invariant 3).
    pub screen_info: RwLock<Option<WireEvent>>,
    /// Reliable channel towards the agent: input events, start/stop-streaming, kicked.
    pub to_agent: broadcast::Sender<WireEvent>,
    /// Notified when a fresh agent connects with the same key, evicting this one.
    pub evicted: Notify,
}

/// A named room: either `viewers:<agent-key>` or `user:<user-id>`.
pub struct Group {
    /// Reliable events: status transitions, screen-info, clipboard, displays-list.
    pub to_members: broadcast::Sender<WireEvent>,
    /// Volatile frame broadcast.
    pub frames: broadcast::Sender<WireEvent>,
}

impl Group {
    fn new() -> Self {
        let (to_members, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self { to_members, frames }
    }

    /// Number of sockets currently subscribed to reliable events — this is
    /// the live "group size" (see `viewer_count`), tracked for free via the
    /// broadcast channel's receiver count rather than a separate counter.
    pub fn member_count(&self) -> usize {
        self.to_members.receiver_count()
    }
}

/// The live switch: agent-key → AgentConnection, plus the two group
/// namespaces used for broadcast fan-out (§4.7).
pub struct ConnectionRegistry {
    agents: RwLock<HashMap<String, Arc<AgentConnection>>>,
    viewer_groups: RwLock<HashMap<String, Arc<Group>>>,
    user_groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            agents: RwLock::new(HashMap::new()),
            viewer_groups: RwLock::new(HashMap::new()),
            user_groups: RwLock::new(HashMap::new()),
        })
    }

    pub async fn viewer_group(&self, agent_key: &str) -> Arc<Group> {
        get_or_create(&self.viewer_groups, agent_key).await
    }

    pub async fn user_group(&self, user_id: &str) -> Arc<Group> {
        get_or_create(&self.user_groups, user_id).await
    }

    pub async fn viewer_count(&self, agent_key: &str) -> usize {
        self.viewer_group(agent_key).await.member_count()
    }

    pub async fn get_agent(&self, agent_key: &str) -> Option<Arc<AgentConnection>> {
        self.agents.read().await.get(agent_key).cloned()
    }

    /// Number of agents currently holding a live connection, used by the
    /// health and metrics endpoints.
    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Broadcast `event` to every agent and every viewer/dashboard group
    /// currently registered. Used once, at shutdown, to deliver
    /// `server-shutdown` (§4.11) to every live socket regardless of role.
    pub async fn broadcast_all(&self, event: &relay_protocol::WireEvent) {
        for conn in self.agents.read().await.values() {
            let _ = conn.to_agent.send(event.clone());
        }
        for group in self.viewer_groups.read().await.values() {
            let _ = group.to_members.send(event.clone());
        }
        for group in self.user_groups.read().await.values() {
            let _ = group.to_members.send(event.clone());
        }
    }

    /// Register a new agent connection for `agent_key`, evicting and
    /// returning the prior connection if one existed (invariant 1, §4.7).
    pub async fn connect_agent(
        &self,
        user_id: &str,
        machine_id: &str,
        agent_key: &str,
    ) -> (Arc<AgentConnection>, Option<Arc<AgentConnection>>) {
        let (to_agent, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let new_conn = Arc::new(AgentConnection {
            user_id: user_id.to_string(),
            machine_id: machine_id.to_string(),
            agent_key: agent_key.to_string(),
            screen_info: RwLock::new(None),
            to_agent,
            evicted: Notify::new(),
        });

        let prior = {
            let mut agents = self.agents.write().await;
            agents.insert(agent_key.to_string(), Arc::clone(&new_conn))
        };
        if let Some(ref prior) = prior {
            prior.evicted.notify_waiters();
        }
        (new_conn, prior)
    }

    /// Remove the registry's entry for `agent_key` iff it is still exactly
    /// `conn` — a later eviction may already have replaced it, in which case
    /// this disconnect must not remove the *new* connection (invariant 2, §4.7).
    pub async fn disconnect_agent(&self, agent_key: &str, conn: &Arc<AgentConnection>) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get(agent_key) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                agents.remove(agent_key);
                true
            }
            _ => false,
        }
    }
}

async fn get_or_create(
    map: &RwLock<HashMap<String, Arc<Group>>>,
    key: &str,
) -> Arc<Group> {
    {
        let groups = map.read().await;
        if let Some(group) = groups.get(key) {
            return Arc::clone(group);
        }
    }
    let mut groups = map.write().await;
    groups
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Group::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_agent_evicts_prior_connection() {
        let registry = ConnectionRegistry::new();
        let (first, prior) = registry.connect_agent("kingpin", "m1", "key1").await;
        assert!(prior.is_none());

        let evicted_wait = first.evicted.notified();
        tokio::pin!(evicted_wait);

        let (second, prior) = registry.connect_agent("kingpin", "m1", "key1").await;
        assert!(prior.is_some());
        assert!(Arc::ptr_eq(&prior.unwrap(), &first));

        // The prior connection's eviction notification fired.
        tokio::time::timeout(std::time::Duration::from_millis(100), evicted_wait)
            .await
            .expect("prior connection should have been notified of eviction");

        let current = registry.get_agent("key1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn disconnect_agent_is_a_noop_if_already_replaced() {
        let registry = ConnectionRegistry::new();
        let (first, _) = registry.connect_agent("kingpin", "m1", "key1").await;
        let (_second, _) = registry.connect_agent("kingpin", "m1", "key1").await;

        // The stale disconnect from the evicted connection must not remove
        // the replacement that has since taken its place.
        let removed = registry.disconnect_agent("key1", &first).await;
        assert!(!removed);
        assert!(registry.get_agent("key1").await.is_some());
    }

    #[tokio::test]
    async fn disconnect_agent_removes_current_connection() {
        let registry = ConnectionRegistry::new();
        let (conn, _) = registry.connect_agent("kingpin", "m1", "key1").await;
        assert!(registry.disconnect_agent("key1", &conn).await);
        assert!(registry.get_agent("key1").await.is_none());
    }

    #[tokio::test]
    async fn viewer_count_tracks_subscriber_receivers() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.viewer_count("key1").await, 0);

        let group = registry.viewer_group("key1").await;
        let _rx1 = group.to_members.subscribe();
        assert_eq!(registry.viewer_count("key1").await, 1);

        let _rx2 = group.to_members.subscribe();
        assert_eq!(registry.viewer_count("key1").await, 2);

        drop(_rx1);
        drop(_rx2);
        assert_eq!(registry.viewer_count("key1").await, 0);
    }

    #[tokio::test]
    async fn agent_count_reflects_connect_and_disconnect() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.agent_count().await, 0);
        let (conn, _) = registry.connect_agent("kingpin", "m1", "key1").await;
        assert_eq!(registry.agent_count().await, 1);
        registry.disconnect_agent("key1", &conn).await;
        assert_eq!(registry.agent_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_all_reaches_agents_and_groups() {
        let registry = ConnectionRegistry::new();
        let (conn, _) = registry.connect_agent("kingpin", "m1", "key1").await;
        let mut agent_rx = conn.to_agent.subscribe();
        let viewer_group = registry.viewer_group("key1").await;
        let mut viewer_rx = viewer_group.to_members.subscribe();

        registry
            .broadcast_all(&WireEvent::ServerShutdown(relay_protocol::ShutdownPayload {
                message: "restarting".to_string(),
            }))
            .await;

        assert!(matches!(agent_rx.try_recv().unwrap(), WireEvent::ServerShutdown(_)));
        assert!(matches!(viewer_rx.try_recv().unwrap(), WireEvent::ServerShutdown(_)));
    }

    #[tokio::test]
    async fn viewer_group_is_shared_across_lookups() {
        let registry = ConnectionRegistry::new();
        let a = registry.viewer_group("key1").await;
        let b = registry.viewer_group("key1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
