//! Request/response envelopes and their wire encoding.
//!
//! Every message is a version byte followed by a [`postcard`]-encoded body.
//! Only the envelope fields (`seq`, caller credentials, error code) matter to
//! the correlation engine; the payload variants below cover the operations the
//! facade exposes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Current wire-protocol version. Prepended to every serialized message.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Outgoing
// ---------------------------------------------------------------------------

/// One logical request: sequence number, caller credentials, and payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppRequest {
    /// Correlation key, unique for the lifetime of one server identity.
    pub seq: u32,
    /// Caller (player) id.
    pub player_id: u64,
    /// Credential token.
    pub player_token: i32,
    /// Target entity for entity-scoped requests.
    pub entity_id: Option<u32>,
    /// Request payload.
    pub body: RequestBody,
}

/// Request payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RequestBody {
    GetInfo,
    GetTime,
    GetMap,
    GetTeamInfo,
    GetTeamChat,
    SendTeamMessage { message: String },
    GetEntityInfo,
    SetEntityValue { value: bool },
    /// Items held by the container behind a storage monitor.
    GetContents,
    GetMapMarkers,
    PromoteToLeader { steam_id: u64 },
    CameraSubscribe { camera_id: String },
    CameraUnsubscribe,
    CameraInput { buttons: u32, mouse_delta: (f32, f32) },
}

impl RequestBody {
    /// Admission cost in limiter tokens.
    pub fn cost(&self) -> u32 {
        match self {
            RequestBody::GetMap => 5,
            RequestBody::SendTeamMessage { .. } => 2,
            _ => 1,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestBody::GetInfo => "get_info",
            RequestBody::GetTime => "get_time",
            RequestBody::GetMap => "get_map",
            RequestBody::GetTeamInfo => "get_team_info",
            RequestBody::GetTeamChat => "get_team_chat",
            RequestBody::SendTeamMessage { .. } => "send_team_message",
            RequestBody::GetEntityInfo => "get_entity_info",
            RequestBody::SetEntityValue { .. } => "set_entity_value",
            RequestBody::GetContents => "get_contents",
            RequestBody::GetMapMarkers => "get_map_markers",
            RequestBody::PromoteToLeader { .. } => "promote_to_leader",
            RequestBody::CameraSubscribe { .. } => "camera_subscribe",
            RequestBody::CameraUnsubscribe => "camera_unsubscribe",
            RequestBody::CameraInput { .. } => "camera_input",
        }
    }
}

// ---------------------------------------------------------------------------
// Incoming
// ---------------------------------------------------------------------------

/// Any frame the server sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AppMessage {
    /// Reply correlated to a request by `seq`.
    Response(AppResponse),
    /// Unsolicited event.
    Broadcast(AppBroadcast),
}

/// Reply to one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppResponse {
    /// Sequence number of the request being answered.
    pub seq: u32,
    /// Server error code; empty or absent means success.
    pub error: Option<String>,
    /// Reply payload.
    pub body: ResponseBody,
}

impl AppResponse {
    /// Successful reply.
    pub fn ok(seq: u32, body: ResponseBody) -> Self {
        Self {
            seq,
            error: None,
            body,
        }
    }

    /// Error reply carrying `code`.
    pub fn failed(seq: u32, code: &str) -> Self {
        Self {
            seq,
            error: Some(code.to_string()),
            body: ResponseBody::Success,
        }
    }

    /// Parsed error field, if any.
    pub fn error(&self) -> Option<ServerError> {
        self.error.as_deref().and_then(ServerError::from_code)
    }
}

/// Reply payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResponseBody {
    Success,
    Info(ServerInfo),
    Time(GameTime),
    Map(MapData),
    TeamInfo(TeamInfo),
    TeamChat(Vec<ChatMessage>),
    EntityInfo(EntityInfo),
    Contents(StorageContents),
    MapMarkers(Vec<MapMarker>),
    CameraSubscribeInfo(CameraInfo),
}

/// Unsolicited server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AppBroadcast {
    TeamChanged { player_id: u64, team: TeamInfo },
    NewTeamMessage(ChatMessage),
    EntityChanged { entity_id: u32, payload: EntityPayload },
    CameraRays { frame: Vec<u8> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub url: String,
    pub map: String,
    pub map_size: u32,
    pub players: u32,
    pub max_players: u32,
    pub queued_players: u32,
    pub seed: u32,
}

/// In-game clock.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GameTime {
    pub day_length_minutes: f32,
    pub time_scale: f32,
    pub sunrise: f32,
    pub sunset: f32,
    pub time: f32,
}

/// Raw map image as sent by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MapData {
    pub width: u32,
    pub height: u32,
    pub jpg_image: Vec<u8>,
    pub ocean_margin: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TeamInfo {
    pub leader_steam_id: u64,
    pub members: Vec<TeamMember>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TeamMember {
    pub steam_id: u64,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub is_online: bool,
    pub is_alive: bool,
}

/// One team chat line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub steam_id: u64,
    pub name: String,
    pub message: String,
    pub color: String,
    pub time: u32,
}

/// Declared type of a smart entity, needed to register a live listener.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityType {
    Switch,
    Alarm,
    StorageMonitor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityInfo {
    pub entity_type: EntityType,
    pub payload: EntityPayload,
}

/// Entity state carried by info replies and change broadcasts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityPayload {
    pub value: bool,
    pub capacity: u32,
    pub items: Vec<EntityItem>,
    pub has_protection: bool,
    pub protection_expiry: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityItem {
    pub item_id: i32,
    pub quantity: i32,
    pub item_is_blueprint: bool,
}

/// Container contents reported by a storage monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageContents {
    pub protection_expiry: u32,
    pub has_protection: bool,
    pub items: Vec<EntityItem>,
}

impl StorageContents {
    /// Merge stacks of the same item (blueprints kept apart), keeping the
    /// order in which each item first appears.
    pub fn combine_stacks(mut self) -> Self {
        let mut combined: Vec<EntityItem> = Vec::with_capacity(self.items.len());
        for item in self.items {
            match combined.iter_mut().find(|stack| {
                stack.item_id == item.item_id && stack.item_is_blueprint == item.item_is_blueprint
            }) {
                Some(stack) => stack.quantity += item.quantity,
                None => combined.push(item),
            }
        }
        self.items = combined;
        self
    }
}

/// Marker type codes used by the server.
pub mod marker_type {
    pub const PLAYER: u32 = 1;
    pub const EXPLOSION: u32 = 2;
    pub const VENDING_MACHINE: u32 = 3;
    pub const CH47: u32 = 4;
    pub const CARGO_SHIP: u32 = 5;
    pub const CRATE: u32 = 6;
    pub const GENERIC_RADIUS: u32 = 7;
    pub const PATROL_HELICOPTER: u32 = 8;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MapMarker {
    pub id: u32,
    pub marker_type: u32,
    pub x: f32,
    pub y: f32,
    pub name: String,
}

impl MapMarker {
    /// Explosions, chinooks, cargo ships, locked crates and patrol helicopters.
    pub fn is_event(&self) -> bool {
        matches!(
            self.marker_type,
            marker_type::EXPLOSION
                | marker_type::CH47
                | marker_type::CARGO_SHIP
                | marker_type::CRATE
                | marker_type::PATROL_HELICOPTER
        )
    }
}

/// Camera subscribe acknowledgement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CameraInfo {
    pub width: u32,
    pub height: u32,
    pub near_plane: f32,
    pub far_plane: f32,
    pub control_flags: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during message decoding.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The payload was empty (no version byte).
    #[error("empty payload, no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("codec error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serialize a message as `[version: u8] [postcard body]`.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, postcard::Error> {
    let body = postcard::to_allocvec(msg)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a versioned payload.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, MessageError> {
    let (&version, body) = data.split_first().ok_or(MessageError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}
