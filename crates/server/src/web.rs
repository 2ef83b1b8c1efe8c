use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Extension, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_protocol::{
    CreateMachineRequest, HealthResponse, InviteCreatedResponse, InviteInfoResponse,
    LoginRequest, LoginResponse, MachineDto, MacAddress, MemoryUsage, RelayConfig,
    RenameMachineRequest, SessionInfoResponse, SetMacRequest, WakeResponse,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::authenticator::{self, Authenticator, HandshakeFields, Role};
use crate::dispatcher;
use crate::error::{RelayError, error_response};
use crate::invites::InviteStore;
use crate::rate_limit::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::sessions::{Session, SessionStore};
use crate::users::UserStore;
use crate::wol;

/// Maximum single WebSocket message size (§5, "hard cap; oversize disconnects
/// the offending socket").
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
/// Maximum HTTP request body size for the JSON control plane.
const MAX_HTTP_BODY_SIZE: usize = 65_536;
/// Directory served verbatim under `/agent-files/*` (installer binaries and
/// support files fetched by freshly-created agents).
const AGENT_FILES_DIR: &str = "agent-files";

pub struct AppState {
    pub users: Arc<UserStore>,
    pub sessions: Arc<SessionStore>,
    pub invites: Arc<InviteStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub config: RelayConfig,
    pub login_limiter: RateLimiter,
    pub wake_limiter: RateLimiter,
    pub started_at: Instant,
    pub metrics_logins_attempted: AtomicU64,
    pub metrics_logins_failed: AtomicU64,
    pub metrics_wake_attempts: AtomicU64,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/session", get(session_info))
        .route(
            "/api/machines/{user_id}",
            get(list_machines).post(create_machine),
        )
        .route(
            "/api/machines/{user_id}/{machine_id}",
            axum::routing::patch(rename_machine).delete(delete_machine),
        )
        .route(
            "/api/machines/{user_id}/{machine_id}/mac",
            axum::routing::patch(set_mac),
        )
        .route("/api/machines/{user_id}/{machine_id}/wake", post(wake_machine))
        .route(
            "/api/invites/{user_id}/{id}",
            post(create_invite).delete(revoke_invite),
        )
        .route("/api/invite-info/{invite_token}", get(invite_info))
        .route("/api/setup/{agent_key}", get(setup_script))
        .route("/api/setup-win/{agent_key}", get(setup_script_windows))
        .route("/api/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws_upgrade))
        .nest_service("/agent-files", ServeDir::new(AGENT_FILES_DIR))
        .layer(RequestBodyLimitLayer::new(MAX_HTTP_BODY_SIZE))
        .with_state(state);

    api.fallback(redirect_root)
        .layer(axum::middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn redirect_root() -> impl IntoResponse {
    Redirect::to("/")
}

/// Inserts the fixed set of security headers onto every response, API and
/// static alike (§4.9).
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        header::HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("0"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );
    headers.insert(
        header::HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );
    response
}

fn source_key(addr: Option<ConnectInfo<SocketAddr>>) -> String {
    addr.map(|ConnectInfo(a)| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn authenticate_owner(
    state: &AppState,
    headers: &HeaderMap,
    user_id: &str,
) -> Result<Session, RelayError> {
    let session = authenticator::authenticate_http(&state.sessions, headers).await?;
    authenticator::require_owner(&session, user_id)?;
    Ok(session)
}

// ---- Authentication & session ----

async fn login(
    State(state): State<Arc<AppState>>,
    addr: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(req): Json<LoginRequest>,
) -> Response {
    let key = source_key(addr.map(|Extension(ci)| ci));
    state.metrics_logins_attempted.fetch_add(1, Ordering::Relaxed);

    if !state.login_limiter.check(&key) {
        tracing::warn!(target: "audit", event = "rate_limited", source = %key, "login rate limited");
        return error_response(&RelayError::RateLimited {
            retry_after_secs: state.login_limiter.retry_after_secs(&key),
        })
        .into_response();
    }

    match state.users.authenticate_by_password(&req.password).await {
        Some(user) => {
            state.login_limiter.clear(&key);
            let token = state.sessions.create(&user.id).await;
            tracing::info!(target: "audit", event = "login_success", user_id = %user.id);
            Json(LoginResponse {
                token,
                user_id: user.id,
                display_name: user.display_name,
            })
            .into_response()
        }
        None => {
            state.metrics_logins_failed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(target: "audit", event = "login_failure", source = %key);
            error_response(&RelayError::AuthFailed).into_response()
        }
    }
}

async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = bearer_token(&headers) {
        state.sessions.destroy(token).await;
    }
    StatusCode::OK
}

async fn session_info(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let session = match authenticator::authenticate_http(&state.sessions, &headers).await {
        Ok(s) => s,
        Err(e) => return error_response(&e).into_response(),
    };
    let Some(user) = state.users.get_user(&session.user_id).await else {
        return error_response(&RelayError::NotFound).into_response();
    };
    Json(SessionInfoResponse {
        user_id: user.id,
        display_name: user.display_name,
    })
    .into_response()
}

// ---- Machines ----

fn machine_dto(machine: crate::users::Machine, connected: bool) -> MachineDto {
    MachineDto {
        id: machine.id,
        name: machine.name,
        mac_address: machine.mac_address,
        broadcast_address: machine.broadcast_address,
        connected,
    }
}

async fn list_machines(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authenticate_owner(&state, &headers, &user_id).await {
        return error_response(&e).into_response();
    }
    let Some(machines) = state.users.get_machines(&user_id).await else {
        return error_response(&RelayError::NotFound).into_response();
    };

    let mut dtos = Vec::with_capacity(machines.len());
    for machine in machines {
        let connected = state.registry.get_agent(&machine.agent_key).await.is_some();
        dtos.push(machine_dto(machine, connected));
    }
    Json(dtos).into_response()
}

async fn create_machine(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateMachineRequest>,
) -> Response {
    if let Err(e) = authenticate_owner(&state, &headers, &user_id).await {
        return error_response(&e).into_response();
    }
    match state.users.add_machine(&user_id, &req.name).await {
        Ok(machine) => Json(machine_dto(machine, false)).into_response(),
        Err(_) => error_response(&RelayError::NotFound).into_response(),
    }
}

async fn rename_machine(
    State(state): State<Arc<AppState>>,
    Path((user_id, machine_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<RenameMachineRequest>,
) -> Response {
    if let Err(e) = authenticate_owner(&state, &headers, &user_id).await {
        return error_response(&e).into_response();
    }
    match state.users.rename_machine(&user_id, &machine_id, &req.name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => error_response(&RelayError::NotFound).into_response(),
    }
}

async fn delete_machine(
    State(state): State<Arc<AppState>>,
    Path((user_id, machine_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authenticate_owner(&state, &headers, &user_id).await {
        return error_response(&e).into_response();
    }
    match state.users.remove_machine(&user_id, &machine_id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => error_response(&RelayError::NotFound).into_response(),
    }
}

async fn set_mac(
    State(state): State<Arc<AppState>>,
    Path((user_id, machine_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<SetMacRequest>,
) -> Response {
    if let Err(e) = authenticate_owner(&state, &headers, &user_id).await {
        return error_response(&e).into_response();
    }
    if let Some(mac) = &req.mac_address {
        if MacAddress::parse(mac).is_err() {
            return error_response(&RelayError::Malformed("invalid MAC address".to_string()))
                .into_response();
        }
    }
    if let Some(addr) = &req.broadcast_address {
        if addr.parse::<std::net::Ipv4Addr>().is_err() {
            return error_response(&RelayError::Malformed(
                "invalid broadcast address".to_string(),
            ))
            .into_response();
        }
    }
    match state
        .users
        .set_mac_address(&user_id, &machine_id, req.mac_address, req.broadcast_address)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => error_response(&RelayError::NotFound).into_response(),
    }
}

async fn wake_machine(
    State(state): State<Arc<AppState>>,
    Path((user_id, machine_id)): Path<(String, String)>,
    addr: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authenticate_owner(&state, &headers, &user_id).await {
        return error_response(&e).into_response();
    }
    let Some(machine) = state.users.get_machine(&user_id, &machine_id).await else {
        return error_response(&RelayError::NotFound).into_response();
    };

    if state.registry.get_agent(&machine.agent_key).await.is_some() {
        return Json(WakeResponse {
            ok: true,
            message: "machine is already online".to_string(),
            already_online: Some(true),
        })
        .into_response();
    }

    let key = source_key(addr.map(|Extension(ci)| ci));
    state.metrics_wake_attempts.fetch_add(1, Ordering::Relaxed);
    if !state.wake_limiter.check(&key) {
        return error_response(&RelayError::RateLimited {
            retry_after_secs: state.wake_limiter.retry_after_secs(&key),
        })
        .into_response();
    }

    let Some(mac) = machine
        .mac_address
        .as_deref()
        .and_then(|m| MacAddress::parse(m).ok())
    else {
        return error_response(&RelayError::Malformed(
            "machine has no MAC address on file".to_string(),
        ))
        .into_response();
    };
    let broadcast = machine
        .broadcast_address
        .clone()
        .unwrap_or_else(|| state.config.server.default_broadcast_address.clone());

    match wol::send_magic_packet(&mac, &broadcast, state.config.server.wake_port).await {
        Ok(()) => {
            tracing::info!(target: "audit", event = "machine_wake", user_id = %user_id, machine_id = %machine_id);
            Json(WakeResponse {
                ok: true,
                message: format!("Wake-on-LAN packet sent to {mac}"),
                already_online: None,
            })
            .into_response()
        }
        Err(e) => Json(WakeResponse {
            ok: false,
            message: e.to_string(),
            already_online: None,
        })
        .into_response(),
    }
}

// ---- Invites ----

async fn create_invite(
    State(state): State<Arc<AppState>>,
    Path((user_id, machine_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authenticate_owner(&state, &headers, &user_id).await {
        return error_response(&e).into_response();
    }
    let Some(user) = state.users.get_user(&user_id).await else {
        return error_response(&RelayError::NotFound).into_response();
    };
    let Some(machine) = state.users.get_machine(&user_id, &machine_id).await else {
        return error_response(&RelayError::NotFound).into_response();
    };

    let invite = state
        .invites
        .create(&user_id, &machine_id, &user.display_name, &machine.name)
        .await;
    tracing::info!(target: "audit", event = "invite_created", user_id = %user_id, machine_id = %machine_id);
    Json(InviteCreatedResponse { token: invite.token }).into_response()
}

async fn invite_info(
    State(state): State<Arc<AppState>>,
    Path(invite_token): Path<String>,
) -> Response {
    match state.invites.inspect(&invite_token).await {
        Some(invite) => Json(InviteInfoResponse {
            user_id: invite.user_id,
            machine_id: invite.machine_id,
            display_name: invite.display_name,
            machine_name: invite.machine_name,
            expires_at: invite.expires_at,
        })
        .into_response(),
        None => error_response(&RelayError::NotFound).into_response(),
    }
}

async fn revoke_invite(
    State(state): State<Arc<AppState>>,
    Path((user_id, invite_token)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authenticate_owner(&state, &headers, &user_id).await {
        return error_response(&e).into_response();
    }
    if state.invites.revoke(&user_id, &invite_token).await {
        tracing::info!(target: "audit", event = "invite_revoked", user_id = %user_id);
        StatusCode::OK.into_response()
    } else {
        error_response(&RelayError::NotFound).into_response()
    }
}

// ---- Installer scripts ----

fn request_host(headers: &HeaderMap, config: &RelayConfig) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{}:{}", config.server.bind, config.server.port))
}

async fn setup_script(
    State(state): State<Arc<AppState>>,
    Path(agent_key): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let host = request_host(&headers, &state.config);
    let script = format!(
        "#!/bin/sh\nset -e\nRELAY_HOST=\"{host}\"\nAGENT_KEY=\"{agent_key}\"\n\
         echo \"Installing relay agent for $RELAY_HOST...\"\n"
    );
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], script)
}

async fn setup_script_windows(
    State(state): State<Arc<AppState>>,
    Path(agent_key): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let host = request_host(&headers, &state.config);
    let script = format!(
        "$RelayHost = \"{host}\"\n$AgentKey = \"{agent_key}\"\n\
         Write-Host \"Installing relay agent for $RelayHost...\"\n"
    );
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], script)
}

// ---- Health & metrics ----

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs(),
        sessions: state.sessions.len().await,
        agents: state.registry.agent_count().await,
        memory: MemoryUsage {
            rss_bytes: current_rss_bytes(),
        },
    })
}

fn current_rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    let kb: u64 = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    return kb * 1024;
                }
            }
        }
    }
    0
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.sessions.len().await;
    let agents = state.registry.agent_count().await;
    let uptime = state.started_at.elapsed().as_secs();
    let logins_attempted = state.metrics_logins_attempted.load(Ordering::Relaxed);
    let logins_failed = state.metrics_logins_failed.load(Ordering::Relaxed);
    let wake_attempts = state.metrics_wake_attempts.load(Ordering::Relaxed);

    let body = format!(
        "# HELP relay_active_sessions Number of active login sessions\n\
         # TYPE relay_active_sessions gauge\n\
         relay_active_sessions {sessions}\n\
         # HELP relay_connected_agents Number of currently connected agents\n\
         # TYPE relay_connected_agents gauge\n\
         relay_connected_agents {agents}\n\
         # HELP relay_uptime_seconds Server uptime in seconds\n\
         # TYPE relay_uptime_seconds gauge\n\
         relay_uptime_seconds {uptime}\n\
         # HELP relay_logins_attempted_total Total login attempts\n\
         # TYPE relay_logins_attempted_total counter\n\
         relay_logins_attempted_total {logins_attempted}\n\
         # HELP relay_logins_failed_total Total failed login attempts\n\
         # TYPE relay_logins_failed_total counter\n\
         relay_logins_failed_total {logins_failed}\n\
         # HELP relay_wake_attempts_total Total Wake-on-LAN attempts\n\
         # TYPE relay_wake_attempts_total counter\n\
         relay_wake_attempts_total {wake_attempts}\n"
    );
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ---- WebSocket upgrade ----

/// Single upgrade point for every socket role. The handshake fields arrive as
/// the first text frame after upgrade rather than as query parameters, so an
/// agent key or invite token never appears in a server access log (§4.4, §6).
async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let Some(Ok(Message::Text(text))) = socket.recv().await else {
        return;
    };
    let Ok(fields) = serde_json::from_str::<HandshakeFields>(&text) else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let role = {
        let auth = Authenticator::new(&state.users, &state.sessions, &state.invites);
        auth.resolve_handshake(&fields).await
    };

    let role = match role {
        Ok(role) => role,
        Err(_) => {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    match role {
        Role::Agent { .. } => {
            dispatcher::handle_agent_socket(socket, role, Arc::clone(&state.registry)).await;
        }
        Role::Viewer { .. } => {
            dispatcher::handle_viewer_socket(
                socket,
                role,
                Arc::clone(&state.registry),
                Arc::clone(&state.users),
            )
            .await;
        }
        Role::Dashboard { .. } => {
            dispatcher::handle_dashboard_socket(
                socket,
                role,
                Arc::clone(&state.registry),
                Arc::clone(&state.users),
            )
            .await;
        }
    }
}
