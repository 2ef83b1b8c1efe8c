use serde::{Deserialize, Serialize};

/// A button on the viewer's pointing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MousePoint {
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button: Option<MouseButton>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPayload {
    pub x: f64,
    pub y: f64,
    pub delta_x: f64,
    pub delta_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPressPayload {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifiers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyTypePayload {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQualityPayload {
    pub quality: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFpsPayload {
    pub fps: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenInfoPayload {
    pub width: u32,
    pub height: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub quality: u32,
    pub fps: u32,
    pub scale: f64,
    pub display_id: u32,
    pub display_count: u32,
    pub offset_x: i32,
    pub offset_y: i32,
}

/// Frame payload. The binary blob is always carried as base64 in `data` — see
/// the module-level note in `lib.rs` about the `buf`/`data` encoding choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    pub data: String,
    pub width: u32,
    pub height: u32,
    pub timestamp: u64,
    pub frame: u64,
    pub quality: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayEntry {
    pub id: u32,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipboardPayload {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatusPayload {
    pub machine_id: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyPayload {
    pub t: f64,
}

/// Every event carried over the socket channel, in both directions.
///
/// Encoded adjacently-tagged (`event`/`data`) rather than internally-tagged:
/// several payloads (`displays-list`) are arrays, which internally-tagged
/// enums cannot represent, and several events (`list-screens`,
/// `start-streaming`, ...) carry no payload at all. Adjacent tagging handles
/// both uniformly — unit variants simply omit the `data` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum WireEvent {
    ScreenInfo(ScreenInfoPayload),
    Frame(FramePayload),
    MouseMove(MousePoint),
    MouseClick(MousePoint),
    MouseDoubleClick(MousePoint),
    MouseRightClick(MousePoint),
    MouseDown(MousePoint),
    MouseUp(MousePoint),
    MouseScroll(ScrollPayload),
    KeyPress(KeyPressPayload),
    KeyType(KeyTypePayload),
    UpdateQuality(UpdateQualityPayload),
    UpdateFps(UpdateFpsPayload),
    DisplaysList(Vec<DisplayEntry>),
    ListScreens,
    SwitchScreen(DisplayEntry),
    ClipboardWrite(ClipboardPayload),
    ClipboardContent(ClipboardPayload),
    ClipboardRead,
    StartStreaming,
    StopStreaming,
    AgentStatus(ConnectedPayload),
    MachineStatus(MachineStatusPayload),
    Kicked(KickedPayload),
    ServerShutdown(ShutdownPayload),
    LatencyPing(LatencyPayload),
    LatencyPong(LatencyPayload),
}

impl WireEvent {
    /// True for events a viewer is permitted to send (validated per-event by the
    /// payload validator before relay to the agent).
    pub fn is_viewer_originated(&self) -> bool {
        matches!(
            self,
            WireEvent::MouseMove(_)
                | WireEvent::MouseClick(_)
                | WireEvent::MouseDoubleClick(_)
                | WireEvent::MouseRightClick(_)
                | WireEvent::MouseDown(_)
                | WireEvent::MouseUp(_)
                | WireEvent::MouseScroll(_)
                | WireEvent::KeyPress(_)
                | WireEvent::KeyType(_)
                | WireEvent::UpdateQuality(_)
                | WireEvent::UpdateFps(_)
                | WireEvent::ListScreens
                | WireEvent::SwitchScreen(_)
                | WireEvent::ClipboardWrite(_)
                | WireEvent::ClipboardRead
        )
    }
}

// ---- HTTP control-plane DTOs ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoResponse {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineDto {
    pub id: String,
    pub name: String,
    pub mac_address: Option<String>,
    pub broadcast_address: Option<String>,
    pub connected: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMachineRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameMachineRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMacRequest {
    pub mac_address: Option<String>,
    pub broadcast_address: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeResponse {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_online: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteCreatedResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteInfoResponse {
    pub user_id: String,
    pub machine_id: String,
    pub display_name: String,
    pub machine_name: String,
    pub expires_at: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime: u64,
    pub sessions: usize,
    pub agents: usize,
    pub memory: MemoryUsage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
