//! Protocol Messages
//!
//! The wire format: every frame is one envelope with a `type` tag, an
//! RFC 3339 timestamp, optional player/game ids, and an optional `data`
//! object keyed by payload name (`auth_request`, `game_event`, ...).
//!
//! Unknown `type` values are detected before full decoding so the server
//! can answer `UNKNOWN_MESSAGE_TYPE` without dropping the connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::store::{ProfileSnapshot, StoreError};
use crate::game::engine::RuleError;
use crate::game::events::{EndReason, GameEvent};
use crate::game::types::{
    GameId, GameState, Mode, PlayerId, Tower, TowerKind, Troop, TroopKind, Winner,
};

// =============================================================================
// MESSAGE TYPES
// =============================================================================

/// Every message type on the wire, client-to-server and server-to-client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // -- Client -> Server --
    /// Authenticate an existing account.
    Login,
    /// Create an account (and authenticate).
    Register,
    /// Join a matchmaking queue.
    FindMatch,
    /// Deploy a troop.
    SummonTroop,
    /// Attack an opponent tower (Simple mode).
    Attack,
    /// End the turn (Simple mode).
    EndTurn,
    /// Concede the match.
    Surrender,
    /// Keep-alive.
    Ping,

    // -- Server -> Client --
    /// Authentication succeeded.
    AuthOk,
    /// Authentication failed.
    AuthFail,
    /// A match was found.
    MatchFound,
    /// The match is starting; carries the player's private view.
    GameStart,
    /// An engine event with a state snapshot.
    GameEvent,
    /// The turn changed (Simple mode).
    TurnChange,
    /// Mana/clock tick (Enhanced mode).
    ManaUpdate,
    /// The match is over.
    GameEnd,
    /// The opponent's connection dropped.
    PlayerDisconnect,
    /// A request was rejected.
    Error,
    /// Keep-alive reply.
    Pong,
}

impl MessageType {
    /// Every message type, both directions.
    pub const ALL: [MessageType; 19] = [
        MessageType::Login,
        MessageType::Register,
        MessageType::FindMatch,
        MessageType::SummonTroop,
        MessageType::Attack,
        MessageType::EndTurn,
        MessageType::Surrender,
        MessageType::Ping,
        MessageType::AuthOk,
        MessageType::AuthFail,
        MessageType::MatchFound,
        MessageType::GameStart,
        MessageType::GameEvent,
        MessageType::TurnChange,
        MessageType::ManaUpdate,
        MessageType::GameEnd,
        MessageType::PlayerDisconnect,
        MessageType::Error,
        MessageType::Pong,
    ];

    /// The wire token for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Login => "LOGIN",
            MessageType::Register => "REGISTER",
            MessageType::FindMatch => "FIND_MATCH",
            MessageType::SummonTroop => "SUMMON_TROOP",
            MessageType::Attack => "ATTACK",
            MessageType::EndTurn => "END_TURN",
            MessageType::Surrender => "SURRENDER",
            MessageType::Ping => "PING",
            MessageType::AuthOk => "AUTH_OK",
            MessageType::AuthFail => "AUTH_FAIL",
            MessageType::MatchFound => "MATCH_FOUND",
            MessageType::GameStart => "GAME_START",
            MessageType::GameEvent => "GAME_EVENT",
            MessageType::TurnChange => "TURN_CHANGE",
            MessageType::ManaUpdate => "MANA_UPDATE",
            MessageType::GameEnd => "GAME_END",
            MessageType::PlayerDisconnect => "PLAYER_DISCONNECT",
            MessageType::Error => "ERROR",
            MessageType::Pong => "PONG",
        }
    }

    /// Parse a wire token.
    pub fn parse(s: &str) -> Option<MessageType> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Machine-readable error codes carried by `ERROR` replies and failed
/// auth responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Protocol --
    /// The `type` token is not part of the protocol.
    UnknownMessageType,
    /// The envelope or payload shape is wrong for this request.
    InvalidRequest,
    /// A frame exceeded the size cap; the session is closed.
    FrameTooLarge,

    // -- Authentication --
    /// Unknown username or wrong password.
    BadCredentials,
    /// The username is already registered.
    UsernameTaken,
    /// The account (or this session) is already authenticated.
    AlreadyLoggedIn,
    /// The request requires authentication first.
    NotAuthenticated,
    /// Username or password failed validation.
    ValidationError,

    // -- Matchmaking --
    /// The game mode token is not `simple` or `enhanced`.
    InvalidGameMode,
    /// The player is already in an active game.
    AlreadyInRoom,

    // -- Game rules --
    /// The match is not (or no longer) running.
    GameNotActive,
    /// Simple mode: it is the opponent's turn.
    NotYourTurn,
    /// Simple mode: one deployment per turn.
    DeploymentLimitReached,
    /// The troop was not dealt to the caller this match.
    TroopNotAvailable,
    /// Not enough mana for the summon.
    InsufficientMana,
    /// The attacking troop is missing or destroyed.
    AttackerUnavailable,
    /// The target tower does not exist or is already destroyed.
    TargetInvalid,
    /// Both guard towers still stand.
    KingTowerProtected,
    /// The Queen has no living tower to heal.
    NoHealTarget,

    // -- System --
    /// The session's outbound queue overflowed; the session is closed.
    Backpressure,
    /// Unexpected server-side failure.
    InternalError,
}

impl From<&RuleError> for ErrorCode {
    fn from(err: &RuleError) -> Self {
        match err {
            RuleError::GameNotActive => ErrorCode::GameNotActive,
            RuleError::NotYourTurn => ErrorCode::NotYourTurn,
            RuleError::DeploymentLimitReached => ErrorCode::DeploymentLimitReached,
            RuleError::TroopNotAvailable => ErrorCode::TroopNotAvailable,
            RuleError::InsufficientMana { .. } => ErrorCode::InsufficientMana,
            RuleError::AttackerUnavailable => ErrorCode::AttackerUnavailable,
            RuleError::TargetInvalid => ErrorCode::TargetInvalid,
            RuleError::KingTowerProtected => ErrorCode::KingTowerProtected,
            RuleError::NoHealTarget => ErrorCode::NoHealTarget,
            RuleError::InvalidAction(_) => ErrorCode::InvalidRequest,
            RuleError::UnknownPlayer => ErrorCode::InternalError,
        }
    }
}

impl From<&StoreError> for ErrorCode {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::InvalidUsername | StoreError::InvalidPassword => {
                ErrorCode::ValidationError
            }
            StoreError::UsernameTaken => ErrorCode::UsernameTaken,
            StoreError::BadCredentials => ErrorCode::BadCredentials,
            StoreError::AlreadyLoggedIn => ErrorCode::AlreadyLoggedIn,
            StoreError::UnknownPlayer(_) | StoreError::Io(_) | StoreError::Encode(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Login/register credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

/// Authentication reply, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Whether authentication succeeded.
    pub success: bool,
    /// Error code when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<ErrorCode>,
    /// The session's player id when `success` is true.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub player_id: Option<PlayerId>,
    /// Human-readable outcome.
    pub message: String,
    /// The account profile (without credentials) on success.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub player_data: Option<ProfileSnapshot>,
}

/// Matchmaking request. The mode string is validated server-side so a
/// bad mode can be answered with `INVALID_GAME_MODE` rather than a
/// generic decode failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    /// `"simple"` or `"enhanced"`.
    pub game_mode: String,
}

/// The opponent as shown to a newly matched player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpponentInfo {
    /// The opponent's session player id.
    pub player_id: PlayerId,
    /// The opponent's account name.
    pub username: String,
    /// The opponent's account level.
    pub level: u32,
}

/// A successful pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchFound {
    /// The new match's id.
    pub game_id: GameId,
    /// The match mode.
    pub game_mode: Mode,
    /// Who you are playing against.
    pub opponent: OpponentInfo,
    /// Whether you own the first turn (Simple mode).
    pub your_turn: bool,
}

/// The match is starting: full state plus the recipient's private view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameStart {
    /// Authoritative state at match start.
    pub game_state: GameState,
    /// The recipient's three troops, in draw order.
    pub your_troops: Vec<Troop>,
    /// The recipient's three towers.
    pub your_towers: Vec<Tower>,
}

/// Deploy a troop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummonRequest {
    /// Which troop to deploy.
    pub troop_name: TroopKind,
}

/// Attack an opponent tower (Simple mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackRequest {
    /// The attacking troop.
    pub attacker_name: TroopKind,
    /// Target category; only `"tower"` is valid.
    pub target_type: String,
    /// The targeted tower.
    pub target_name: TowerKind,
}

/// An engine event plus the snapshot taken when it was emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEventBody {
    /// The event.
    pub event: GameEvent,
    /// Full state at emission time.
    pub game_state: GameState,
}

/// The turn moved to the other player (Simple mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnChangeBody {
    /// Whose turn it now is.
    pub current_turn: PlayerId,
    /// Full state after the turn change.
    pub game_state: GameState,
}

/// One second of the Enhanced-mode clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManaUpdateBody {
    /// Player 1's mana.
    pub player1_mana: u32,
    /// Player 2's mana.
    pub player2_mana: u32,
    /// Seconds remaining.
    pub time_left: u32,
    /// Full state after the tick.
    pub game_state: GameState,
}

/// Match conclusion, personalized per recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEndBody {
    /// The winner's player id, or `"draw"`.
    pub winner: Winner,
    /// Why the match ended.
    pub reason: EndReason,
    /// The recipient's total match EXP, as a decimal string.
    pub exp_gained: String,
    /// The opponent's total match EXP, as a decimal string.
    pub opponent_exp_gained: String,
}

/// The opponent's connection dropped mid-match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerDisconnectBody {
    /// The departed player's id.
    pub player_id: PlayerId,
    /// The departed player's account name.
    pub username: String,
}

/// A rejected request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable explanation.
    pub message: String,
}

/// The `data` object of an envelope: exactly one payload, keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// `{"auth_request": ...}`
    #[serde(rename = "auth_request")]
    AuthRequest(AuthRequest),
    /// `{"auth_response": ...}`
    #[serde(rename = "auth_response")]
    AuthResponse(AuthResponse),
    /// `{"match_request": ...}`
    #[serde(rename = "match_request")]
    MatchRequest(MatchRequest),
    /// `{"match_found": ...}`
    #[serde(rename = "match_found")]
    MatchFound(MatchFound),
    /// `{"game_start": ...}`
    #[serde(rename = "game_start")]
    GameStart(Box<GameStart>),
    /// `{"summon_request": ...}`
    #[serde(rename = "summon_request")]
    SummonRequest(SummonRequest),
    /// `{"attack_request": ...}`
    #[serde(rename = "attack_request")]
    AttackRequest(AttackRequest),
    /// `{"game_event": ...}`
    #[serde(rename = "game_event")]
    GameEvent(Box<GameEventBody>),
    /// `{"turn_change": ...}`
    #[serde(rename = "turn_change")]
    TurnChange(Box<TurnChangeBody>),
    /// `{"mana_update": ...}`
    #[serde(rename = "mana_update")]
    ManaUpdate(Box<ManaUpdateBody>),
    /// `{"game_end": ...}`
    #[serde(rename = "game_end")]
    GameEnd(GameEndBody),
    /// `{"player_disconnect": ...}`
    #[serde(rename = "player_disconnect")]
    PlayerDisconnect(PlayerDisconnectBody),
    /// `{"error": ...}`
    #[serde(rename = "error")]
    Error(ErrorBody),
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Envelope decode errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON object or its shape is wrong.
    #[error("malformed message: {0}")]
    Malformed(serde_json::Error),

    /// The envelope has no string `type` field.
    #[error("message has no type field")]
    MissingType,

    /// The `type` token is not part of the protocol.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// The top-level wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message type tag.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Originating or addressed player, where meaningful.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub player_id: Option<PlayerId>,
    /// The match this message belongs to, where meaningful.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub game_id: Option<GameId>,
    /// When the message was created (RFC 3339).
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// The payload, keyed by payload name.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Payload>,
}

impl Message {
    /// A bare message of the given type, stamped now.
    pub fn new(msg_type: MessageType) -> Self {
        Message {
            msg_type,
            player_id: None,
            game_id: None,
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// Attach a player id.
    pub fn with_player(mut self, id: PlayerId) -> Self {
        self.player_id = Some(id);
        self
    }

    /// Attach a game id.
    pub fn with_game(mut self, id: GameId) -> Self {
        self.game_id = Some(id);
        self
    }

    /// Attach a payload.
    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = Some(data);
        self
    }

    /// An `ERROR` reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::new(MessageType::Error).with_data(Payload::Error(ErrorBody {
            code,
            message: message.into(),
        }))
    }

    /// Decode one frame. Distinguishes an unknown `type` (answered with
    /// `UNKNOWN_MESSAGE_TYPE`, connection kept) from a malformed envelope
    /// (`INVALID_REQUEST`).
    pub fn decode(line: &str) -> Result<Message, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(ProtocolError::Malformed)?;
        let type_str = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if MessageType::parse(type_str).is_none() {
            return Err(ProtocolError::UnknownType(type_str.to_owned()));
        }
        serde_json::from_value(value).map_err(ProtocolError::Malformed)
    }
}
