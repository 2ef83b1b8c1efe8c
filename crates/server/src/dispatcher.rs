use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use relay_protocol::{
    ConnectedPayload, KickedPayload, MachineStatusPayload, WireEvent,
};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, interval};

use crate::authenticator::Role;
use crate::registry::{AgentConnection, ConnectionRegistry, Group};
use crate::users::UserStore;
use crate::validate;

const WS_PING_INTERVAL: Duration = Duration::from_secs(25);
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(60);

const EVICTED_REASON: &str = "Another agent connected for this machine";

// ---- Pure state-transition helpers (unit-tested without a real socket) ----

/// An agent handshake enters Active: register it (evicting any prior holder
/// of the same key) and announce onlineness. Re-announcing `true` on an
/// eviction is intentionally idempotent from a viewer's perspective — no
/// `false` is ever broadcast for an evicted connection, so no transition is
/// observed (§8 scenario S3).
pub async fn on_agent_connect(
    registry: &ConnectionRegistry,
    user_id: &str,
    machine_id: &str,
    agent_key: &str,
) -> Arc<AgentConnection> {
    let (conn, _prior) = registry.connect_agent(user_id, machine_id, agent_key).await;

    let user_group = registry.user_group(user_id).await;
    let _ = user_group.to_members.send(WireEvent::MachineStatus(MachineStatusPayload {
        machine_id: machine_id.to_string(),
        connected: true,
    }));
    let viewer_group = registry.viewer_group(agent_key).await;
    let _ = viewer_group
        .to_members
        .send(WireEvent::AgentStatus(ConnectedPayload { connected: true }));

    conn
}

/// An agent socket exits Active, either by transport loss or by having been
/// evicted. `disconnect_agent` returns `true` only if this connection was
/// still the registry's current entry for the key — false means a newer
/// agent already replaced it, so the offline announcement is skipped (the
/// replacement already announced online).
pub async fn on_agent_exit(registry: &ConnectionRegistry, conn: &Arc<AgentConnection>) {
    let still_current = registry.disconnect_agent(&conn.agent_key, conn).await;
    if !still_current {
        return;
    }
    let user_group = registry.user_group(&conn.user_id).await;
    let _ = user_group.to_members.send(WireEvent::MachineStatus(MachineStatusPayload {
        machine_id: conn.machine_id.clone(),
        connected: false,
    }));
    let viewer_group = registry.viewer_group(&conn.agent_key).await;
    let _ = viewer_group
        .to_members
        .send(WireEvent::AgentStatus(ConnectedPayload { connected: false }));
}

/// A viewer is about to join `viewers:<agent_key>`. Returns the group (to
/// subscribe to before this function's caller reports membership elsewhere)
/// and whether the group was empty *before* this viewer's subscription —
/// the caller uses that to decide whether to kick off `start-streaming`.
pub async fn on_viewer_attach(
    registry: &ConnectionRegistry,
    agent_key: &str,
) -> (Arc<Group>, Option<Arc<AgentConnection>>, bool) {
    let group = registry.viewer_group(agent_key).await;
    let was_empty = group.member_count() == 0;
    let agent = registry.get_agent(agent_key).await;
    (group, agent, was_empty)
}

/// Called after a viewer's subscriptions have been dropped. If the viewer
/// group is now empty, tell the agent (if still Active) to stop streaming.
pub async fn on_viewer_detach(registry: &ConnectionRegistry, agent_key: &str) {
    let group = registry.viewer_group(agent_key).await;
    if group.member_count() == 0 {
        if let Some(agent) = registry.get_agent(agent_key).await {
            let _ = agent.to_agent.send(WireEvent::StopStreaming);
        }
    }
}

// ---- Socket-driving loops ----

/// Drive an authenticated Agent socket for its whole lifetime.
pub async fn handle_agent_socket(mut socket: WebSocket, role: Role, registry: Arc<ConnectionRegistry>) {
    let Role::Agent { user_id, machine_id, agent_key } = role else {
        return;
    };

    let conn = on_agent_connect(&registry, &user_id, &machine_id, &agent_key).await;
    let mut commands = conn.to_agent.subscribe();
    let evicted = conn.evicted.notified();
    tokio::pin!(evicted);

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = &mut evicted => {
                send_event(&mut socket, &WireEvent::Kicked(KickedPayload {
                    reason: EVICTED_REASON.to_string(),
                })).await;
                break;
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(agent_key = %agent_key, skipped = n, "agent command channel lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_agent_event(&registry, &conn, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    on_agent_exit(&registry, &conn).await;
}

async fn handle_agent_event(registry: &ConnectionRegistry, conn: &AgentConnection, text: &str) {
    let Ok(event) = serde_json::from_str::<WireEvent>(text) else {
        // Malformed payloads from an agent are likewise ignored (§7).
        return;
    };
    let group = registry.viewer_group(&conn.agent_key).await;
    match event {
        WireEvent::ScreenInfo(_) => {
            *conn.screen_info.write().await = Some(event.clone());
            let _ = group.to_members.send(event);
        }
        WireEvent::Frame(_) => {
            let _ = group.frames.send(event);
        }
        WireEvent::DisplaysList(_) | WireEvent::ClipboardContent(_) => {
            let _ = group.to_members.send(event);
        }
        _ => {}
    }
}

/// Drive an authenticated Viewer socket for its whole lifetime. `users` is
/// needed to translate the handshake's `machine_id` into the owning
/// machine's Agent Key.
pub async fn handle_viewer_socket(
    mut socket: WebSocket,
    role: Role,
    registry: Arc<ConnectionRegistry>,
    users: Arc<UserStore>,
) {
    let Role::Viewer { user_id, machine_id: Some(machine_id) } = role else {
        return;
    };
    let Some(machine) = users.get_machine(&user_id, &machine_id).await else {
        return;
    };
    let agent_key = machine.agent_key;

    let (group, agent, was_empty) = on_viewer_attach(&registry, &agent_key).await;
    let mut group_events = group.to_members.subscribe();
    let mut group_frames = group.frames.subscribe();
    let user_group = registry.user_group(&user_id).await;
    let mut user_events = user_group.to_members.subscribe();

    if let Some(agent) = &agent {
        send_event(&mut socket, &WireEvent::AgentStatus(ConnectedPayload { connected: true })).await;
        if let Some(cached) = agent.screen_info.read().await.clone() {
            send_event(&mut socket, &cached).await;
        }
        if was_empty {
            let _ = agent.to_agent.send(WireEvent::StartStreaming);
        }
    } else {
        send_event(&mut socket, &WireEvent::AgentStatus(ConnectedPayload { connected: false })).await;
    }

    loop {
        tokio::select! {
            result = group_events.recv() => {
                match result {
                    Ok(event) => { if !send_event(&mut socket, &event).await { break; } }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            result = group_frames.recv() => {
                match result {
                    Ok(event) => { if !send_event(&mut socket, &event).await { break; } }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(agent_key = %agent_key, skipped = n, "viewer frame consumer lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            result = user_events.recv() => {
                match result {
                    Ok(event) => { if !send_event(&mut socket, &event).await { break; } }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_viewer_event(&registry, &agent_key, &mut socket, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    drop(group_events);
    drop(group_frames);
    drop(user_events);
    on_viewer_detach(&registry, &agent_key).await;
}

async fn handle_viewer_event(
    registry: &ConnectionRegistry,
    agent_key: &str,
    socket: &mut WebSocket,
    text: &str,
) {
    let Ok(event) = serde_json::from_str::<WireEvent>(text) else {
        return;
    };

    if let WireEvent::LatencyPing(payload) = event {
        send_event(socket, &WireEvent::LatencyPong(payload)).await;
        return;
    }

    if !event.is_viewer_originated() || !validate::is_valid(&event) {
        return;
    }

    if let Some(agent) = registry.get_agent(agent_key).await {
        let _ = agent.to_agent.send(event);
    }
}

/// Drive a Dashboard socket: joins `user:<user-id>` only, gets an initial
/// machine-status burst, and otherwise only ever receives.
pub async fn handle_dashboard_socket(
    mut socket: WebSocket,
    role: Role,
    registry: Arc<ConnectionRegistry>,
    users: Arc<UserStore>,
) {
    let Role::Dashboard { user_id } = role else {
        return;
    };

    let user_group = registry.user_group(&user_id).await;
    let mut user_events = user_group.to_members.subscribe();

    if let Some(machines) = users.get_machines(&user_id).await {
        for machine in machines {
            let connected = registry.get_agent(&machine.agent_key).await.is_some();
            send_event(
                &mut socket,
                &WireEvent::MachineStatus(MachineStatusPayload {
                    machine_id: machine.id,
                    connected,
                }),
            )
            .await;
        }
    }

    loop {
        tokio::select! {
            result = user_events.recv() => {
                match result {
                    Ok(event) => { if !send_event(&mut socket, &event).await { break; } }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &WireEvent) -> bool {
    let Ok(json) = serde_json::to_string(event) else {
        return true;
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}
