//! Game Events
//!
//! Everything the engine does is reported as an event on the room's
//! stream. Each record carries a full [`GameState`] snapshot taken at the
//! moment of emission, so the fan-out layer never has to re-lock the
//! engine and both players observe identical ordered histories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::game::types::{GameState, PlayerId, TowerKind, TroopKind, Winner};

/// A combatant on either side of an attack: a troop or a tower.
///
/// Serializes as the unit's wire token (the troop and tower token sets
/// are disjoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnitName {
    /// A troop.
    Troop(TroopKind),
    /// A tower.
    Tower(TowerKind),
}

/// Why a match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A King Tower fell.
    KingTowerDestroyed,
    /// The Enhanced-mode clock reached zero.
    TimeUp,
    /// A player surrendered.
    Surrender,
    /// A player's connection dropped mid-match.
    OpponentDisconnect,
    /// The server is shutting down.
    ServerStop,
}

/// One engine event. The tag is the event kind as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameEvent {
    /// A troop was deployed.
    Summon {
        /// The summoning player.
        player_id: PlayerId,
        /// The deployed troop.
        troop: TroopKind,
        /// The troop's HP after deployment.
        troop_hp: u32,
        /// Caller's remaining mana (Enhanced mode only).
        #[serde(skip_serializing_if = "Option::is_none", default)]
        mana_left: Option<u32>,
        /// Caller's deployments so far this turn (Simple mode).
        troops_deployed_this_turn: u32,
    },

    /// A strike landed (manual, auto, or counter).
    Attack {
        /// The attacking player.
        player_id: PlayerId,
        /// The attacking unit.
        attacker: UnitName,
        /// The struck unit.
        target: UnitName,
        /// Damage dealt after defense, zero-clamped.
        damage: u32,
        /// Whether the critical roll hit (Enhanced mode only).
        is_crit: bool,
        /// Target HP after the strike.
        target_hp: u32,
        /// Target HP before the strike.
        old_hp: u32,
        /// Whether this was a tower counter-attack.
        counter: bool,
    },

    /// The Queen healed a tower.
    Heal {
        /// The casting player.
        player_id: PlayerId,
        /// The healed tower (the caster's own).
        target: TowerKind,
        /// HP restored, after the max-HP ceiling.
        heal_amount: u32,
        /// The tower's HP after the heal.
        tower_hp: u32,
    },

    /// A troop fell to a counter-attack.
    TroopDestroyed {
        /// The player credited with the kill (the tower's owner).
        player_id: PlayerId,
        /// The destroyed troop.
        troop: TroopKind,
        /// The troop's owner.
        owner: PlayerId,
    },

    /// A tower was destroyed.
    TowerDestroyed {
        /// The player credited with the kill.
        player_id: PlayerId,
        /// The destroyed tower.
        tower: TowerKind,
        /// The tower's owner.
        owner: PlayerId,
    },

    /// A destroyed troop was summoned back to full HP.
    TroopRevived {
        /// The owning player.
        player_id: PlayerId,
        /// The revived troop.
        troop: TroopKind,
        /// HP after revival (the level-scaled maximum).
        hp: u32,
    },

    /// EXP credited to a player mid-match.
    ExpGained {
        /// The credited player.
        player_id: PlayerId,
        /// EXP amount.
        amount: u32,
        /// Human-readable reason.
        reason: String,
    },

    /// An account leveled up when the match result was applied.
    LevelUp {
        /// The leveled player.
        player_id: PlayerId,
        /// The new account level.
        level: u32,
    },

    /// A Simple-mode turn ended.
    TurnEnd {
        /// The player whose turn ended.
        player_id: PlayerId,
        /// The player whose turn begins.
        next_turn: PlayerId,
    },

    /// One second of the Enhanced-mode clock elapsed.
    ManaTick {
        /// Player 1's mana after regeneration.
        player1_mana: u32,
        /// Player 2's mana after regeneration.
        player2_mana: u32,
        /// Seconds remaining.
        time_left: u32,
    },

    /// The match is over. Terminal: nothing follows this event.
    GameEnd {
        /// The winner, or a draw.
        winner: Winner,
        /// Why the match ended.
        reason: EndReason,
        /// Player 1's total match EXP (end-of-game bonus included).
        player1_exp: u32,
        /// Player 2's total match EXP (end-of-game bonus included).
        player2_exp: u32,
    },
}

/// An event paired with the state snapshot taken when it was emitted.
#[derive(Debug, Clone)]
pub struct EngineUpdate {
    /// The event.
    pub event: GameEvent,
    /// Full state at emission time.
    pub state: GameState,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}
