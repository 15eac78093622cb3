//! Match State Types
//!
//! Core entities for a single match: unit kinds, level-scaled unit
//! instances, per-player slots, and the authoritative `GameState`
//! snapshot that travels to clients with every event.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::catalog::{TowerSpec, TroopSpec};

// =============================================================================
// GAME CONSTANTS
// =============================================================================

/// Enhanced-mode match length in seconds.
pub const GAME_DURATION_SECS: u32 = 180;
/// Mana each player starts an Enhanced match with.
pub const STARTING_MANA: u32 = 5;
/// Mana cap in Enhanced mode.
pub const MAX_MANA: u32 = 10;
/// Mana regenerated per player per second in Enhanced mode.
pub const MANA_REGEN_PER_SECOND: u32 = 1;

/// EXP awarded to the winner at game end.
pub const WIN_EXP: u32 = 30;
/// EXP awarded to the loser at game end.
pub const LOSS_EXP: u32 = 10;
/// EXP awarded to both players on a draw.
pub const DRAW_EXP: u32 = 10;
/// Damage dealt per point of EXP awarded for a damaging hit.
pub const DAMAGE_EXP_DIVISOR: u32 = 50;
/// EXP for destroying the King Tower.
pub const KING_TOWER_EXP: u32 = 200;
/// EXP for destroying a Guard Tower.
pub const GUARD_TOWER_EXP: u32 = 100;

/// Stat increase per unit level above 1 (10%).
pub const STAT_SCALE_PER_LEVEL: f64 = 0.10;
/// Damage multiplier on a critical hit (Enhanced mode only).
pub const CRIT_MULTIPLIER: f64 = 1.5;
/// HP restored by the Queen's heal, before the max-HP ceiling.
pub const QUEEN_HEAL: u32 = 300;

/// Troops dealt to each player per match.
pub const TROOPS_PER_PLAYER: usize = 3;
/// Towers per player (1 King + 2 Guard).
pub const TOWERS_PER_PLAYER: usize = 3;

/// Scale a base stat by unit level: `round(base * (1 + 0.10 * (level - 1)))`.
///
/// A zero base stat stays zero regardless of level (the Queen has no
/// combat stats at any level).
pub fn scale_stat(base: u32, level: u32) -> u32 {
    if base == 0 {
        return 0;
    }
    let factor = 1.0 + STAT_SCALE_PER_LEVEL * (level.saturating_sub(1)) as f64;
    (base as f64 * factor).round() as u32
}

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Session-scoped player identifier, assigned on connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        PlayerId(format!("player_{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one match (room).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(pub String);

impl GameId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        GameId(format!("game_{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// UNIT KINDS
// =============================================================================

/// The six troop kinds. Wire tokens are the capitalized names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TroopKind {
    /// Cheap chip damage.
    Pawn,
    /// Mid-range attacker.
    Bishop,
    /// Durable bruiser.
    Rook,
    /// High-attack bruiser.
    Knight,
    /// Heavy hitter.
    Prince,
    /// Caster: heals instead of fighting, never enters combat.
    Queen,
}

impl TroopKind {
    /// All troop kinds, in catalog order.
    pub const ALL: [TroopKind; 6] = [
        TroopKind::Pawn,
        TroopKind::Bishop,
        TroopKind::Rook,
        TroopKind::Knight,
        TroopKind::Prince,
        TroopKind::Queen,
    ];

    /// Whether this kind is a non-combat caster.
    pub fn is_caster(self) -> bool {
        self == TroopKind::Queen
    }

    /// The wire token for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            TroopKind::Pawn => "Pawn",
            TroopKind::Bishop => "Bishop",
            TroopKind::Rook => "Rook",
            TroopKind::Knight => "Knight",
            TroopKind::Prince => "Prince",
            TroopKind::Queen => "Queen",
        }
    }
}

impl fmt::Display for TroopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three tower kinds. The two guard towers are distinct instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TowerKind {
    /// The tower whose destruction ends the game.
    #[serde(rename = "King Tower")]
    KingTower,
    /// First guard tower.
    #[serde(rename = "Guard Tower 1")]
    GuardTower1,
    /// Second guard tower.
    #[serde(rename = "Guard Tower 2")]
    GuardTower2,
}

impl TowerKind {
    /// All tower kinds, in placement order: King first, then guards.
    pub const ALL: [TowerKind; 3] = [
        TowerKind::KingTower,
        TowerKind::GuardTower1,
        TowerKind::GuardTower2,
    ];

    /// Whether this is one of the two guard towers.
    pub fn is_guard(self) -> bool {
        self != TowerKind::KingTower
    }

    /// The wire token for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            TowerKind::KingTower => "King Tower",
            TowerKind::GuardTower1 => "Guard Tower 1",
            TowerKind::GuardTower2 => "Guard Tower 2",
        }
    }
}

impl fmt::Display for TowerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// MODES / STATUS / WINNER
// =============================================================================

/// Match mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Turn-based: one deployment per turn, no mana, no crits.
    Simple,
    /// Real-time: 180 s clock, mana regeneration, crits, auto-attacks.
    Enhanced,
}

impl Mode {
    /// Parse a wire token (`"simple"` / `"enhanced"`).
    pub fn parse(s: &str) -> Option<Mode> {
        match s {
            "simple" => Some(Mode::Simple),
            "enhanced" => Some(Mode::Enhanced),
            _ => None,
        }
    }

    /// The wire token for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Simple => "simple",
            Mode::Enhanced => "enhanced",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Match lifecycle. Progresses monotonically and never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Room created, engine not yet started.
    Waiting,
    /// Match running; operations are accepted.
    Active,
    /// Match over; every operation answers `GAME_NOT_ACTIVE`.
    Finished,
}

/// Outcome of a finished match: a player id, or `"draw"` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    /// Neither player won.
    #[serde(rename = "draw")]
    Draw,
    /// The winning player's id.
    #[serde(untagged)]
    Player(PlayerId),
}

// =============================================================================
// UNIT INSTANCES
// =============================================================================

/// A troop instance with level-scaled stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Troop {
    /// Troop kind.
    pub name: TroopKind,
    /// Current hit points. Zero means destroyed.
    pub hp: u32,
    /// Maximum hit points at this level.
    pub max_hp: u32,
    /// Attack, level-scaled.
    pub atk: u32,
    /// Defense, level-scaled.
    pub def: u32,
    /// Critical-hit chance in `[0, 1]`.
    pub crit: f64,
    /// Mana cost to summon (Enhanced mode).
    pub mana: u32,
    /// EXP awarded to the opponent for destroying this troop.
    pub exp: u32,
    /// Special-ability description, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub special: Option<String>,
    /// Owner's level for this troop kind.
    pub level: u32,
}

impl Troop {
    /// Build a level-scaled instance from base stats.
    pub fn from_spec(kind: TroopKind, spec: &TroopSpec, level: u32) -> Self {
        let hp = scale_stat(spec.hp, level);
        Troop {
            name: kind,
            hp,
            max_hp: hp,
            atk: scale_stat(spec.atk, level),
            def: scale_stat(spec.def, level),
            crit: spec.crit,
            mana: spec.mana,
            exp: spec.exp,
            special: spec.special.clone(),
            level,
        }
    }

    /// Whether this troop can act or be targeted.
    pub fn is_alive(&self) -> bool {
        self.hp > 0
    }
}

/// A tower instance with level-scaled stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tower {
    /// Tower kind.
    pub name: TowerKind,
    /// Current hit points. Zero means destroyed.
    pub hp: u32,
    /// Maximum hit points at this level.
    pub max_hp: u32,
    /// Attack, level-scaled (used for counter-attacks).
    pub atk: u32,
    /// Defense, level-scaled.
    pub def: u32,
    /// Critical-hit chance in `[0, 1]`.
    pub crit: f64,
    /// EXP awarded to the opponent for destroying this tower.
    pub exp: u32,
    /// Owner's level for this tower kind.
    pub level: u32,
}

impl Tower {
    /// Build a level-scaled instance from base stats.
    pub fn from_spec(kind: TowerKind, spec: &TowerSpec, level: u32) -> Self {
        let hp = scale_stat(spec.hp, level);
        Tower {
            name: kind,
            hp,
            max_hp: hp,
            atk: scale_stat(spec.atk, level),
            def: scale_stat(spec.def, level),
            crit: spec.crit,
            exp: spec.exp,
            level,
        }
    }

    /// Whether this tower still stands.
    pub fn is_alive(&self) -> bool {
        self.hp > 0
    }
}

// =============================================================================
// PLAYER SLOT
// =============================================================================

/// One player's side of a match.
///
/// Invariants: exactly [`TROOPS_PER_PLAYER`] troops, exactly
/// [`TOWERS_PER_PLAYER`] towers ordered `[King, Guard 1, Guard 2]`.
/// `exp` accumulates within this match only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSlot {
    /// Session-scoped player id.
    pub id: PlayerId,
    /// Account name.
    pub username: String,
    /// Account level at match start.
    pub level: u32,
    /// EXP earned this match.
    pub exp: u32,
    /// Current mana (Enhanced mode; unused in Simple).
    pub mana: u32,
    /// Mana cap.
    pub max_mana: u32,
    /// The three troops dealt for this match, in draw order.
    pub troops: Vec<Troop>,
    /// The three towers: King, Guard 1, Guard 2.
    pub towers: Vec<Tower>,
    /// Troops deployed in the current turn (Simple mode).
    pub troops_deployed_this_turn: u32,
}

impl PlayerSlot {
    /// The troop of the given kind, if dealt to this player.
    pub fn troop(&self, kind: TroopKind) -> Option<&Troop> {
        self.troops.iter().find(|t| t.name == kind)
    }

    /// Mutable access to the troop of the given kind.
    pub fn troop_mut(&mut self, kind: TroopKind) -> Option<&mut Troop> {
        self.troops.iter_mut().find(|t| t.name == kind)
    }

    /// The tower of the given kind.
    pub fn tower(&self, kind: TowerKind) -> Option<&Tower> {
        self.towers.iter().find(|t| t.name == kind)
    }

    /// Mutable access to the tower of the given kind.
    pub fn tower_mut(&mut self, kind: TowerKind) -> Option<&mut Tower> {
        self.towers.iter_mut().find(|t| t.name == kind)
    }

    /// Number of guard towers still standing.
    pub fn alive_guard_count(&self) -> usize {
        self.towers
            .iter()
            .filter(|t| t.name.is_guard() && t.is_alive())
            .count()
    }

    /// Whether this player's King Tower still stands.
    pub fn king_alive(&self) -> bool {
        self.tower(TowerKind::KingTower).is_some_and(Tower::is_alive)
    }

    /// Number of towers this player has lost.
    pub fn towers_lost(&self) -> u32 {
        self.towers.iter().filter(|t| !t.is_alive()).count() as u32
    }

    /// First living tower in `[King, Guard 1, Guard 2]` order.
    ///
    /// This is the tower that performs counter-attacks.
    pub fn first_alive_tower(&self) -> Option<&Tower> {
        self.towers.iter().find(|t| t.is_alive())
    }
}

// =============================================================================
// GAME STATE
// =============================================================================

/// Towers lost per player. `player1` counts towers *player 1* has lost.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TowersKilled {
    /// Towers player 1 has lost.
    pub player1: u32,
    /// Towers player 2 has lost.
    pub player2: u32,
}

/// The authoritative state of one match.
///
/// A full clone of this struct accompanies every event broadcast so
/// clients never have to reconstruct state incrementally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    /// Match identifier.
    pub id: GameId,
    /// Match mode.
    pub game_mode: Mode,
    /// Lifecycle status.
    pub status: Status,
    /// First player (owns the first turn in Simple mode).
    pub player1: PlayerSlot,
    /// Second player.
    pub player2: PlayerSlot,
    /// Whose turn it is (Simple mode only).
    pub current_turn: PlayerId,
    /// Seconds remaining (Enhanced mode only).
    pub time_left: u32,
    /// When the match started.
    pub start_time: DateTime<Utc>,
    /// Winner, set once `status` is `Finished`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub winner: Option<Winner>,
    /// Towers lost per player.
    pub towers_killed: TowersKilled,
}

impl GameState {
    /// The slot belonging to `id`, if `id` is in this match.
    pub fn slot(&self, id: &PlayerId) -> Option<&PlayerSlot> {
        if self.player1.id == *id {
            Some(&self.player1)
        } else if self.player2.id == *id {
            Some(&self.player2)
        } else {
            None
        }
    }

    /// The opponent of `id`, if `id` is in this match.
    pub fn opponent(&self, id: &PlayerId) -> Option<&PlayerSlot> {
        if self.player1.id == *id {
            Some(&self.player2)
        } else if self.player2.id == *id {
            Some(&self.player1)
        } else {
            None
        }
    }

    /// Mutable `(caller, opponent)` slot pair.
    pub fn slot_pair_mut(&mut self, id: &PlayerId) -> Option<(&mut PlayerSlot, &mut PlayerSlot)> {
        if self.player1.id == *id {
            Some((&mut self.player1, &mut self.player2))
        } else if self.player2.id == *id {
            Some((&mut self.player2, &mut self.player1))
        } else {
            None
        }
    }

    /// Whether `id` is player 1.
    pub fn is_player1(&self, id: &PlayerId) -> bool {
        self.player1.id == *id
    }
}
