//! Game Engine
//!
//! The authoritative rules state machine for one match. Every operation
//! is validated here and either mutates state and emits events, or comes
//! back as a typed [`RuleError`] — the engine never aborts on a rule
//! violation.
//!
//! The engine itself is synchronous. Delayed effects (auto-attacks,
//! counter-attacks, the Queen's auto end-turn, the Enhanced-mode clock)
//! are returned to the caller as [`FollowUp`] records; the owning room
//! schedules them and re-enters the engine through its lock, so event
//! order always reflects acceptance order. Deferred entry points check
//! `status == Active` and drop silently when the match has ended.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::data::catalog::SpecCatalog;
use crate::data::store::ProfileSnapshot;
use crate::game::events::{EndReason, EngineUpdate, GameEvent, UnitName};
use crate::game::types::{
    scale_stat, GameId, GameState, Mode, PlayerId, PlayerSlot, Status, Tower, TowerKind,
    TowersKilled, Troop, TroopKind, Winner, CRIT_MULTIPLIER, DAMAGE_EXP_DIVISOR, DRAW_EXP,
    GAME_DURATION_SECS, GUARD_TOWER_EXP, KING_TOWER_EXP, LOSS_EXP, MANA_REGEN_PER_SECOND,
    MAX_MANA, QUEEN_HEAL, STARTING_MANA, TROOPS_PER_PLAYER, WIN_EXP,
};

/// Delay before an Enhanced-mode summon resolves into an attack.
pub const AUTO_ATTACK_DELAY: Duration = Duration::from_millis(500);
/// Delay before a tower counter-attacks the troop that struck it.
pub const COUNTER_ATTACK_DELAY: Duration = Duration::from_secs(2);
/// Delay before the Queen's summon auto-ends the turn (Simple mode).
pub const QUEEN_END_TURN_DELAY: Duration = Duration::from_secs(1);

/// A game-rule violation. Maps 1:1 onto wire error codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// The match is not (or no longer) running.
    #[error("game is not active")]
    GameNotActive,

    /// Simple mode: it is the opponent's turn.
    #[error("it's not your turn")]
    NotYourTurn,

    /// Simple mode: one deployment per turn.
    #[error("cannot deploy more than one troop per turn")]
    DeploymentLimitReached,

    /// The troop was not dealt to the caller this match.
    #[error("troop not available")]
    TroopNotAvailable,

    /// Enhanced mode: the summon costs more mana than the caller has.
    #[error("insufficient mana: need {need}, have {have}")]
    InsufficientMana {
        /// Mana the summon costs.
        need: u32,
        /// Mana the caller has.
        have: u32,
    },

    /// The attacking troop is missing or destroyed.
    #[error("troop is destroyed and cannot attack")]
    AttackerUnavailable,

    /// The target tower does not exist or is already destroyed.
    #[error("target tower is not available")]
    TargetInvalid,

    /// Both guard towers still stand, so the King Tower is off-limits.
    #[error("must destroy at least one Guard Tower before attacking King Tower")]
    KingTowerProtected,

    /// The Queen has no living tower to heal.
    #[error("no towers to heal")]
    NoHealTarget,

    /// The operation does not exist in this room's mode.
    #[error("{0}")]
    InvalidAction(&'static str),

    /// The caller is not a member of this match.
    #[error("player is not in this game")]
    UnknownPlayer,
}

/// A deferred effect the room must schedule after an accepted operation.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    /// Enhanced mode: the summoned troop picks a target and strikes.
    AutoAttack {
        /// The summoning player.
        player: PlayerId,
        /// The summoned troop.
        troop: TroopKind,
    },
    /// The opponent's first living tower strikes back at the attacker.
    CounterAttack {
        /// The player whose troop attacked.
        player: PlayerId,
        /// The troop that attacked.
        troop: TroopKind,
    },
    /// Simple mode: the Queen's summon ends the caller's turn.
    EndTurn {
        /// The player whose turn ends.
        player: PlayerId,
    },
}

impl FollowUp {
    /// How long after acceptance this effect fires.
    pub fn delay(&self) -> Duration {
        match self {
            FollowUp::AutoAttack { .. } => AUTO_ATTACK_DELAY,
            FollowUp::CounterAttack { .. } => COUNTER_ATTACK_DELAY,
            FollowUp::EndTurn { .. } => QUEEN_END_TURN_DELAY,
        }
    }
}

/// What the engine needs to know about one participant at room creation.
#[derive(Debug, Clone)]
pub struct MatchSeat {
    /// Session-scoped player id.
    pub player_id: PlayerId,
    /// Account name.
    pub username: String,
    /// Account level.
    pub level: u32,
    /// Per-troop-kind levels.
    pub troop_levels: BTreeMap<TroopKind, u32>,
    /// Per-tower-kind levels.
    pub tower_levels: BTreeMap<TowerKind, u32>,
}

impl MatchSeat {
    /// Build a seat from a profile snapshot taken at login.
    pub fn from_snapshot(player_id: PlayerId, snapshot: &ProfileSnapshot) -> Self {
        MatchSeat {
            player_id,
            username: snapshot.username.clone(),
            level: snapshot.level,
            troop_levels: snapshot.troop_levels.clone(),
            tower_levels: snapshot.tower_levels.clone(),
        }
    }
}

/// The authoritative state machine for one match.
pub struct GameEngine {
    state: GameState,
    catalog: Arc<SpecCatalog>,
    rng: StdRng,
    events: mpsc::UnboundedSender<EngineUpdate>,
}

impl GameEngine {
    /// Create an engine for a fresh match: deal each player three distinct
    /// random troops, build their towers, and scale everything by the
    /// owner's per-unit levels. The match starts in `Waiting`.
    pub fn new(
        id: GameId,
        mode: Mode,
        seat1: MatchSeat,
        seat2: MatchSeat,
        catalog: Arc<SpecCatalog>,
        events: mpsc::UnboundedSender<EngineUpdate>,
        mut rng: StdRng,
    ) -> Self {
        let player1 = Self::build_slot(&seat1, mode, &catalog, &mut rng);
        let player2 = Self::build_slot(&seat2, mode, &catalog, &mut rng);
        let current_turn = player1.id.clone();

        let state = GameState {
            id,
            game_mode: mode,
            status: Status::Waiting,
            player1,
            player2,
            current_turn,
            time_left: match mode {
                Mode::Enhanced => GAME_DURATION_SECS,
                Mode::Simple => 0,
            },
            start_time: Utc::now(),
            winner: None,
            towers_killed: TowersKilled::default(),
        };

        GameEngine {
            state,
            catalog,
            rng,
            events,
        }
    }

    fn build_slot(
        seat: &MatchSeat,
        mode: Mode,
        catalog: &SpecCatalog,
        rng: &mut StdRng,
    ) -> PlayerSlot {
        let mut kinds = TroopKind::ALL.to_vec();
        kinds.shuffle(rng);
        kinds.truncate(TROOPS_PER_PLAYER);

        let troops = kinds
            .iter()
            .map(|&kind| {
                let level = seat.troop_levels.get(&kind).copied().unwrap_or(1);
                Troop::from_spec(kind, catalog.troop_spec(kind), level)
            })
            .collect();

        let towers = TowerKind::ALL
            .iter()
            .map(|&kind| {
                let level = seat.tower_levels.get(&kind).copied().unwrap_or(1);
                Tower::from_spec(kind, catalog.tower_spec(kind), level)
            })
            .collect();

        PlayerSlot {
            id: seat.player_id.clone(),
            username: seat.username.clone(),
            level: seat.level,
            exp: 0,
            mana: match mode {
                Mode::Enhanced => STARTING_MANA,
                Mode::Simple => 0,
            },
            max_mana: MAX_MANA,
            troops,
            towers,
            troops_deployed_this_turn: 0,
        }
    }

    /// Transition from `Waiting` to `Active`.
    pub fn start(&mut self) {
        if self.state.status == Status::Waiting {
            self.state.status = Status::Active;
        }
    }

    /// Current state (cloned into every emitted event).
    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Whether the match is accepting operations.
    pub fn is_active(&self) -> bool {
        self.state.status == Status::Active
    }

    /// Match mode.
    pub fn mode(&self) -> Mode {
        self.state.game_mode
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Summon (deploy) a troop.
    ///
    /// Restores the troop to full level-scaled HP whether or not it was
    /// destroyed; the Queen instead heals the caller's weakest tower.
    pub fn summon(
        &mut self,
        caller: &PlayerId,
        kind: TroopKind,
    ) -> Result<Vec<FollowUp>, RuleError> {
        if self.state.status != Status::Active {
            return Err(RuleError::GameNotActive);
        }
        let mode = self.state.game_mode;
        if mode == Mode::Simple && self.state.current_turn != *caller {
            return Err(RuleError::NotYourTurn);
        }

        let spec_hp = self.catalog.troop_spec(kind).hp;
        let mana_cost = self.catalog.troop_spec(kind).mana;

        let (revived, troop_hp, mana_left, deployed, heal_done) = {
            let (player, _) = self
                .state
                .slot_pair_mut(caller)
                .ok_or(RuleError::UnknownPlayer)?;

            if mode == Mode::Simple && player.troops_deployed_this_turn >= 1 {
                return Err(RuleError::DeploymentLimitReached);
            }
            let troop_level = match player.troop(kind) {
                Some(t) => t.level,
                None => return Err(RuleError::TroopNotAvailable),
            };
            if mode == Mode::Enhanced && player.mana < mana_cost {
                return Err(RuleError::InsufficientMana {
                    need: mana_cost,
                    have: player.mana,
                });
            }

            // The heal target is resolved before any mutation, so a
            // failed Queen summon leaves mana and the deployment counter
            // untouched.
            let heal_plan = if kind.is_caster() {
                match player
                    .towers
                    .iter()
                    .filter(|t| t.is_alive())
                    .min_by_key(|t| t.hp)
                {
                    Some(t) => Some((t.name, QUEEN_HEAL.min(t.max_hp - t.hp))),
                    None => return Err(RuleError::NoHealTarget),
                }
            } else {
                None
            };

            let mut revived = None;
            let mut troop_hp = 0;
            if !kind.is_caster() {
                if let Some(troop) = player.troop_mut(kind) {
                    let full = scale_stat(spec_hp, troop_level);
                    if troop.hp == 0 {
                        revived = Some(full);
                    }
                    troop.hp = full;
                    troop.max_hp = full;
                    troop_hp = full;
                }
            }

            if mode == Mode::Enhanced {
                player.mana -= mana_cost;
            }
            if mode == Mode::Simple {
                player.troops_deployed_this_turn += 1;
            }
            let mana_left = (mode == Mode::Enhanced).then_some(player.mana);
            let deployed = player.troops_deployed_this_turn;

            let mut heal_done = None;
            if let Some((tower_kind, amount)) = heal_plan {
                if let Some(tower) = player.tower_mut(tower_kind) {
                    tower.hp += amount;
                    heal_done = Some((tower_kind, amount, tower.hp));
                }
            }

            (revived, troop_hp, mana_left, deployed, heal_done)
        };

        if let Some(hp) = revived {
            self.emit(GameEvent::TroopRevived {
                player_id: caller.clone(),
                troop: kind,
                hp,
            });
        }
        if let Some((target, heal_amount, tower_hp)) = heal_done {
            self.emit(GameEvent::Heal {
                player_id: caller.clone(),
                target,
                heal_amount,
                tower_hp,
            });
        }
        self.emit(GameEvent::Summon {
            player_id: caller.clone(),
            troop: kind,
            troop_hp,
            mana_left,
            troops_deployed_this_turn: deployed,
        });

        let mut followups = Vec::new();
        if kind.is_caster() {
            // The Queen performs no attack; in Simple mode her summon
            // ends the turn on its own.
            if mode == Mode::Simple {
                followups.push(FollowUp::EndTurn {
                    player: caller.clone(),
                });
            }
        } else if mode == Mode::Enhanced {
            followups.push(FollowUp::AutoAttack {
                player: caller.clone(),
                troop: kind,
            });
        }
        Ok(followups)
    }

    /// Explicit attack on an opponent tower. Simple mode only; Enhanced
    /// mode resolves combat through auto-attacks.
    pub fn attack(
        &mut self,
        caller: &PlayerId,
        attacker: TroopKind,
        target: TowerKind,
    ) -> Result<Vec<FollowUp>, RuleError> {
        if self.state.status != Status::Active {
            return Err(RuleError::GameNotActive);
        }
        if self.state.game_mode != Mode::Simple {
            return Err(RuleError::InvalidAction(
                "manual attacks are only available in simple mode",
            ));
        }

        {
            let (player, opponent) = self
                .state
                .slot_pair_mut(caller)
                .ok_or(RuleError::UnknownPlayer)?;
            match player.troop(attacker) {
                Some(t) if t.is_alive() => {}
                _ => return Err(RuleError::AttackerUnavailable),
            }
            if target == TowerKind::KingTower && opponent.alive_guard_count() == 2 {
                return Err(RuleError::KingTowerProtected);
            }
            match opponent.tower(target) {
                Some(t) if t.is_alive() => {}
                _ => return Err(RuleError::TargetInvalid),
            }
        }

        self.strike_tower(caller, attacker, target);

        if self.state.status == Status::Active {
            Ok(vec![FollowUp::CounterAttack {
                player: caller.clone(),
                troop: attacker,
            }])
        } else {
            Ok(Vec::new())
        }
    }

    /// End the caller's turn. Simple mode only.
    pub fn end_turn(&mut self, caller: &PlayerId) -> Result<(), RuleError> {
        if self.state.status != Status::Active {
            return Err(RuleError::GameNotActive);
        }
        if self.state.game_mode != Mode::Simple {
            return Err(RuleError::InvalidAction(
                "end turn is only available in simple mode",
            ));
        }
        if self.state.current_turn != *caller {
            return Err(RuleError::NotYourTurn);
        }
        self.switch_turn(caller);
        Ok(())
    }

    /// Concede the match: the opponent wins.
    pub fn surrender(&mut self, caller: &PlayerId) -> Result<(), RuleError> {
        if self.state.status != Status::Active {
            return Err(RuleError::GameNotActive);
        }
        let winner = self
            .state
            .opponent(caller)
            .ok_or(RuleError::UnknownPlayer)?
            .id
            .clone();
        self.state.winner = Some(Winner::Player(winner));
        self.end_game(EndReason::Surrender);
        Ok(())
    }

    /// End the match from outside the rules (disconnect, server stop).
    /// `None` finishes as a draw.
    pub fn abort(&mut self, winner: Option<PlayerId>, reason: EndReason) {
        if self.state.status == Status::Finished {
            return;
        }
        self.state.winner = Some(match winner {
            Some(id) => Winner::Player(id),
            None => Winner::Draw,
        });
        self.end_game(reason);
    }

    // =========================================================================
    // DEFERRED ENTRY POINTS (scheduled by the room)
    // =========================================================================

    /// Enhanced mode: resolve a summoned troop's attack. Drops silently
    /// when the match ended, the troop died, or no target remains.
    pub fn auto_attack(&mut self, caller: &PlayerId, troop: TroopKind) -> Vec<FollowUp> {
        if self.state.status != Status::Active {
            return Vec::new();
        }
        let alive = self
            .state
            .slot(caller)
            .and_then(|p| p.troop(troop))
            .is_some_and(|t| t.is_alive());
        if !alive {
            return Vec::new();
        }
        let Some(target) = self.select_auto_target(caller) else {
            return Vec::new();
        };

        self.strike_tower(caller, troop, target);

        if self.state.status == Status::Active {
            vec![FollowUp::CounterAttack {
                player: caller.clone(),
                troop,
            }]
        } else {
            Vec::new()
        }
    }

    /// The opponent's first living tower (King, Guard 1, Guard 2 order)
    /// strikes the troop that attacked. The Queen is never a target.
    pub fn counter_attack(&mut self, summoner: &PlayerId, troop: TroopKind) {
        if self.state.status != Status::Active {
            return;
        }
        if troop.is_caster() {
            return;
        }

        let (tower_kind, tower_atk, tower_crit, troop_def, troop_alive, opponent_id) = {
            let Some(player) = self.state.slot(summoner) else {
                return;
            };
            let Some(t) = player.troop(troop) else {
                return;
            };
            let Some(opponent) = self.state.opponent(summoner) else {
                return;
            };
            let Some(tower) = opponent.first_alive_tower() else {
                return;
            };
            (
                tower.name,
                tower.atk,
                tower.crit,
                t.def,
                t.is_alive(),
                opponent.id.clone(),
            )
        };
        if !troop_alive {
            return;
        }

        let (damage, is_crit) = self.roll_damage(tower_atk, troop_def, tower_crit);

        let (old_hp, new_hp, destroyed, troop_exp) = {
            let Some((player, _)) = self.state.slot_pair_mut(summoner) else {
                return;
            };
            let Some(t) = player.troop_mut(troop) else {
                return;
            };
            let old_hp = t.hp;
            t.hp = old_hp.saturating_sub(damage);
            (old_hp, t.hp, t.hp == 0 && old_hp > 0, t.exp)
        };

        self.emit(GameEvent::Attack {
            player_id: opponent_id.clone(),
            attacker: UnitName::Tower(tower_kind),
            target: UnitName::Troop(troop),
            damage,
            is_crit,
            target_hp: new_hp,
            old_hp,
            counter: true,
        });
        if damage > 0 {
            self.award_exp(
                &opponent_id,
                (damage / DAMAGE_EXP_DIVISOR).max(1),
                format!("dealing {damage} damage to {troop}"),
            );
        }
        if destroyed {
            self.emit(GameEvent::TroopDestroyed {
                player_id: opponent_id.clone(),
                troop,
                owner: summoner.clone(),
            });
            self.award_exp(&opponent_id, troop_exp, format!("destroying {troop}"));
        }
    }

    /// Simple mode: the Queen's deferred end-turn. Drops silently when
    /// the turn already moved on.
    pub fn auto_end_turn(&mut self, caller: &PlayerId) {
        if self.state.status == Status::Active
            && self.state.game_mode == Mode::Simple
            && self.state.current_turn == *caller
        {
            self.switch_turn(caller);
        }
    }

    /// One second of the Enhanced-mode clock: regenerate mana, advance
    /// the clock, and run the timeout evaluation at zero.
    pub fn tick_second(&mut self) {
        if self.state.status != Status::Active || self.state.game_mode != Mode::Enhanced {
            return;
        }
        for slot in [&mut self.state.player1, &mut self.state.player2] {
            slot.mana = (slot.mana + MANA_REGEN_PER_SECOND).min(MAX_MANA);
        }
        self.state.time_left = self.state.time_left.saturating_sub(1);

        let player1_mana = self.state.player1.mana;
        let player2_mana = self.state.player2.mana;
        let time_left = self.state.time_left;
        self.emit(GameEvent::ManaTick {
            player1_mana,
            player2_mana,
            time_left,
        });

        if time_left == 0 {
            self.evaluate_timeout();
        }
    }

    // =========================================================================
    // COMBAT INTERNALS
    // =========================================================================

    /// `max(0, ATK − DEF)`, with a 1.5× critical roll in Enhanced mode.
    /// The final value truncates to an integer.
    fn roll_damage(&mut self, atk: u32, def: u32, crit: f64) -> (u32, bool) {
        let base = atk.saturating_sub(def);
        if self.state.game_mode == Mode::Enhanced && self.rng.gen::<f64>() < crit {
            ((base as f64 * CRIT_MULTIPLIER) as u32, true)
        } else {
            (base, false)
        }
    }

    /// Apply one troop-on-tower strike: damage, EXP, destruction
    /// bookkeeping, and the win check.
    fn strike_tower(&mut self, caller: &PlayerId, troop: TroopKind, target: TowerKind) {
        let (atk, crit) = {
            let Some(player) = self.state.slot(caller) else {
                return;
            };
            let Some(t) = player.troop(troop) else {
                return;
            };
            (t.atk, t.crit)
        };
        let def = {
            let Some(opponent) = self.state.opponent(caller) else {
                return;
            };
            let Some(tower) = opponent.tower(target) else {
                return;
            };
            tower.def
        };

        let (damage, is_crit) = self.roll_damage(atk, def, crit);

        let (old_hp, new_hp, destroyed, owner_id) = {
            let Some((_, opponent)) = self.state.slot_pair_mut(caller) else {
                return;
            };
            let owner_id = opponent.id.clone();
            let Some(tower) = opponent.tower_mut(target) else {
                return;
            };
            let old_hp = tower.hp;
            tower.hp = old_hp.saturating_sub(damage);
            (old_hp, tower.hp, tower.hp == 0 && old_hp > 0, owner_id)
        };

        if destroyed {
            if self.state.is_player1(&owner_id) {
                self.state.towers_killed.player1 += 1;
            } else {
                self.state.towers_killed.player2 += 1;
            }
        }

        self.emit(GameEvent::Attack {
            player_id: caller.clone(),
            attacker: UnitName::Troop(troop),
            target: UnitName::Tower(target),
            damage,
            is_crit,
            target_hp: new_hp,
            old_hp,
            counter: false,
        });
        if damage > 0 {
            self.award_exp(
                caller,
                (damage / DAMAGE_EXP_DIVISOR).max(1),
                format!("dealing {damage} damage to {target}"),
            );
        }
        if destroyed {
            self.emit(GameEvent::TowerDestroyed {
                player_id: caller.clone(),
                tower: target,
                owner: owner_id,
            });
            let amount = if target == TowerKind::KingTower {
                KING_TOWER_EXP
            } else {
                GUARD_TOWER_EXP
            };
            self.award_exp(caller, amount, format!("destroying {target}"));
            self.check_win();
        }
    }

    /// Enhanced auto-attack targeting: both guards standing → the weaker
    /// guard (ties by index); a guard already down → the King, if alive.
    fn select_auto_target(&self, caller: &PlayerId) -> Option<TowerKind> {
        let opponent = self.state.opponent(caller)?;
        if opponent.alive_guard_count() == 2 {
            opponent
                .towers
                .iter()
                .filter(|t| t.name.is_guard() && t.is_alive())
                .min_by_key(|t| t.hp)
                .map(|t| t.name)
        } else if opponent.king_alive() {
            Some(TowerKind::KingTower)
        } else {
            None
        }
    }

    fn award_exp(&mut self, player_id: &PlayerId, amount: u32, reason: String) {
        {
            let Some((slot, _)) = self.state.slot_pair_mut(player_id) else {
                return;
            };
            slot.exp += amount;
        }
        self.emit(GameEvent::ExpGained {
            player_id: player_id.clone(),
            amount,
            reason,
        });
    }

    fn switch_turn(&mut self, caller: &PlayerId) {
        self.state.player1.troops_deployed_this_turn = 0;
        self.state.player2.troops_deployed_this_turn = 0;
        let next = if self.state.is_player1(caller) {
            self.state.player2.id.clone()
        } else {
            self.state.player1.id.clone()
        };
        self.state.current_turn = next.clone();
        self.emit(GameEvent::TurnEnd {
            player_id: caller.clone(),
            next_turn: next,
        });
    }

    /// A King at 0 HP ends the game for its opponent.
    fn check_win(&mut self) {
        if self.state.status != Status::Active {
            return;
        }
        let p1_king = self.state.player1.king_alive();
        let p2_king = self.state.player2.king_alive();
        if p1_king && p2_king {
            return;
        }
        let winner = if !p1_king && !p2_king {
            Winner::Draw
        } else if !p1_king {
            Winner::Player(self.state.player2.id.clone())
        } else {
            Winner::Player(self.state.player1.id.clone())
        };
        self.state.winner = Some(winner);
        self.end_game(EndReason::KingTowerDestroyed);
    }

    /// Clock expiry: a sole surviving King wins; otherwise fewer towers
    /// lost wins; otherwise a draw.
    fn evaluate_timeout(&mut self) {
        let p1 = &self.state.player1;
        let p2 = &self.state.player2;
        let winner = match (p1.king_alive(), p2.king_alive()) {
            (true, false) => Winner::Player(p1.id.clone()),
            (false, true) => Winner::Player(p2.id.clone()),
            _ => {
                let (lost1, lost2) = (p1.towers_lost(), p2.towers_lost());
                if lost1 < lost2 {
                    Winner::Player(p1.id.clone())
                } else if lost2 < lost1 {
                    Winner::Player(p2.id.clone())
                } else {
                    Winner::Draw
                }
            }
        };
        self.state.winner = Some(winner);
        self.end_game(EndReason::TimeUp);
    }

    /// Award end-of-game EXP, flip to `Finished`, and emit the terminal
    /// `GAME_END` event. Idempotent.
    fn end_game(&mut self, reason: EndReason) {
        if self.state.status == Status::Finished {
            return;
        }
        let winner = self.state.winner.clone().unwrap_or(Winner::Draw);
        self.state.winner = Some(winner.clone());

        let (bonus1, bonus2) = match &winner {
            Winner::Draw => (DRAW_EXP, DRAW_EXP),
            Winner::Player(id) if self.state.is_player1(id) => (WIN_EXP, LOSS_EXP),
            Winner::Player(_) => (LOSS_EXP, WIN_EXP),
        };
        self.state.player1.exp += bonus1;
        self.state.player2.exp += bonus2;
        self.state.status = Status::Finished;

        let player1_exp = self.state.player1.exp;
        let player2_exp = self.state.player2.exp;
        self.emit(GameEvent::GameEnd {
            winner,
            reason,
            player1_exp,
            player2_exp,
        });
    }

    fn emit(&mut self, event: GameEvent) {
        let update = EngineUpdate {
            event,
            state: self.state.clone(),
            timestamp: Utc::now(),
        };
        // The receiver disappears at room teardown; late events have
        // nowhere to go and that is fine.
        let _ = self.events.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn seat(id: &str, name: &str) -> MatchSeat {
        MatchSeat {
            player_id: PlayerId(id.into()),
            username: name.into(),
            level: 1,
            troop_levels: TroopKind::ALL.iter().map(|&k| (k, 1)).collect(),
            tower_levels: TowerKind::ALL.iter().map(|&k| (k, 1)).collect(),
        }
    }

    /// Engine with fixed hands instead of a random deal.
    fn engine_with_hands(
        mode: Mode,
        p1_troops: &[TroopKind],
        p2_troops: &[TroopKind],
    ) -> (GameEngine, UnboundedReceiver<EngineUpdate>) {
        let catalog = Arc::new(SpecCatalog::builtin());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut engine = GameEngine::new(
            GameId("game_test".into()),
            mode,
            seat("p1", "alice"),
            seat("p2", "bob"),
            catalog.clone(),
            tx,
            StdRng::seed_from_u64(7),
        );
        engine.state.player1.troops = p1_troops
            .iter()
            .map(|&k| Troop::from_spec(k, catalog.troop_spec(k), 1))
            .collect();
        engine.state.player2.troops = p2_troops
            .iter()
            .map(|&k| Troop::from_spec(k, catalog.troop_spec(k), 1))
            .collect();
        engine.start();
        (engine, rx)
    }

    fn p1() -> PlayerId {
        PlayerId("p1".into())
    }

    fn p2() -> PlayerId {
        PlayerId("p2".into())
    }

    fn drain(rx: &mut UnboundedReceiver<EngineUpdate>) -> Vec<GameEvent> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update.event);
        }
        out
    }

    fn event_tags(events: &[GameEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                GameEvent::Summon { .. } => "SUMMON",
                GameEvent::Attack { .. } => "ATTACK",
                GameEvent::Heal { .. } => "HEAL",
                GameEvent::TroopDestroyed { .. } => "TROOP_DESTROYED",
                GameEvent::TowerDestroyed { .. } => "TOWER_DESTROYED",
                GameEvent::TroopRevived { .. } => "TROOP_REVIVED",
                GameEvent::ExpGained { .. } => "EXP_GAINED",
                GameEvent::LevelUp { .. } => "LEVEL_UP",
                GameEvent::TurnEnd { .. } => "TURN_END",
                GameEvent::ManaTick { .. } => "MANA_TICK",
                GameEvent::GameEnd { .. } => "GAME_END",
            })
            .collect()
    }

    #[test]
    fn test_new_engine_deals_three_distinct_troops() {
        let catalog = Arc::new(SpecCatalog::builtin());
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = GameEngine::new(
            GameId::generate(),
            Mode::Simple,
            seat("p1", "alice"),
            seat("p2", "bob"),
            catalog,
            tx,
            StdRng::seed_from_u64(42),
        );
        for slot in [&engine.state.player1, &engine.state.player2] {
            assert_eq!(slot.troops.len(), TROOPS_PER_PLAYER);
            let mut kinds: Vec<_> = slot.troops.iter().map(|t| t.name).collect();
            kinds.sort();
            kinds.dedup();
            assert_eq!(kinds.len(), TROOPS_PER_PLAYER);
            assert_eq!(slot.towers.len(), 3);
            assert_eq!(slot.towers[0].name, TowerKind::KingTower);
            assert!(slot.troops.iter().all(|t| t.hp == t.max_hp));
            assert_eq!(slot.exp, 0);
        }
        assert_eq!(engine.state.status, Status::Waiting);
        assert_eq!(engine.state.current_turn, p1());
    }

    #[test]
    fn test_deployment_limit_and_turn_order() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );

        assert!(engine.summon(&p1(), TroopKind::Pawn).is_ok());
        assert_eq!(
            engine.summon(&p1(), TroopKind::Bishop),
            Err(RuleError::DeploymentLimitReached)
        );

        engine.end_turn(&p1()).unwrap();
        assert_eq!(
            engine.summon(&p1(), TroopKind::Pawn),
            Err(RuleError::NotYourTurn)
        );
        assert!(engine.summon(&p2(), TroopKind::Knight).is_ok());
    }

    #[test]
    fn test_turn_end_resets_both_deployment_counters() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.summon(&p1(), TroopKind::Pawn).unwrap();
        engine.end_turn(&p1()).unwrap();
        assert_eq!(engine.state.player1.troops_deployed_this_turn, 0);
        assert_eq!(engine.state.player2.troops_deployed_this_turn, 0);
        assert_eq!(engine.state.current_turn, p2());
    }

    #[test]
    fn test_end_turn_requires_simple_mode_and_own_turn() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        assert_eq!(engine.end_turn(&p2()), Err(RuleError::NotYourTurn));

        let (mut enhanced, _rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        assert!(matches!(
            enhanced.end_turn(&p1()),
            Err(RuleError::InvalidAction(_))
        ));
    }

    #[test]
    fn test_guard_tower_gating() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );

        assert_eq!(
            engine.attack(&p1(), TroopKind::Pawn, TowerKind::KingTower),
            Err(RuleError::KingTowerProtected)
        );

        engine
            .state
            .player2
            .tower_mut(TowerKind::GuardTower1)
            .unwrap()
            .hp = 0;
        assert!(engine
            .attack(&p1(), TroopKind::Pawn, TowerKind::KingTower)
            .is_ok());
    }

    #[test]
    fn test_attack_rejects_dead_attacker_and_dead_target() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );

        engine.state.player1.troop_mut(TroopKind::Pawn).unwrap().hp = 0;
        assert_eq!(
            engine.attack(&p1(), TroopKind::Pawn, TowerKind::GuardTower1),
            Err(RuleError::AttackerUnavailable)
        );
        assert_eq!(
            engine.attack(&p1(), TroopKind::Prince, TowerKind::GuardTower1),
            Err(RuleError::AttackerUnavailable)
        );

        engine
            .state
            .player2
            .tower_mut(TowerKind::GuardTower2)
            .unwrap()
            .hp = 0;
        assert_eq!(
            engine.attack(&p1(), TroopKind::Bishop, TowerKind::GuardTower2),
            Err(RuleError::TargetInvalid)
        );
    }

    #[test]
    fn test_simple_damage_formula_no_crit() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );

        // Pawn ATK 150 vs Guard Tower DEF 100 -> 50, never a crit.
        engine
            .attack(&p1(), TroopKind::Pawn, TowerKind::GuardTower1)
            .unwrap();
        let events = drain(&mut rx);
        let attack = events
            .iter()
            .find_map(|e| match e {
                GameEvent::Attack {
                    damage,
                    is_crit,
                    old_hp,
                    target_hp,
                    ..
                } => Some((*damage, *is_crit, *old_hp, *target_hp)),
                _ => None,
            })
            .unwrap();
        assert_eq!(attack, (50, false, 1000, 950));
    }

    #[test]
    fn test_enhanced_forced_crit_multiplies_base_damage() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player1.troop_mut(TroopKind::Pawn).unwrap().crit = 1.0;

        let followups = engine.auto_attack(&p1(), TroopKind::Pawn);
        assert!(matches!(
            followups.as_slice(),
            [FollowUp::CounterAttack { .. }]
        ));

        let events = drain(&mut rx);
        let (damage, is_crit) = events
            .iter()
            .find_map(|e| match e {
                GameEvent::Attack { damage, is_crit, .. } => Some((*damage, *is_crit)),
                _ => None,
            })
            .unwrap();
        // (150 - 100) * 1.5 = 75: the crit scales the post-defense base.
        assert_eq!(damage, 75);
        assert!(is_crit);
    }

    #[test]
    fn test_negative_damage_margin_clamps_to_zero() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine
            .state
            .player2
            .tower_mut(TowerKind::GuardTower1)
            .unwrap()
            .def = 200;

        engine
            .attack(&p1(), TroopKind::Pawn, TowerKind::GuardTower1)
            .unwrap();
        let events = drain(&mut rx);
        let damage = events
            .iter()
            .find_map(|e| match e {
                GameEvent::Attack { damage, .. } => Some(*damage),
                _ => None,
            })
            .unwrap();
        assert_eq!(damage, 0);
        // Zero damage earns zero EXP.
        assert!(!events
            .iter()
            .any(|e| matches!(e, GameEvent::ExpGained { .. })));
    }

    #[test]
    fn test_damage_exp_is_floor_div_fifty_min_one() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Prince, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );

        // Prince ATK 400 vs Guard DEF 100 -> 300 damage -> 6 EXP.
        engine
            .attack(&p1(), TroopKind::Prince, TowerKind::GuardTower1)
            .unwrap();
        let events = drain(&mut rx);
        let amount = events
            .iter()
            .find_map(|e| match e {
                GameEvent::ExpGained { amount, .. } => Some(*amount),
                _ => None,
            })
            .unwrap();
        assert_eq!(amount, 6);

        // Bishop ATK 200 vs Rook's... Guard DEF 200 margin 0 handled above;
        // a 30-damage hit must still earn the 1-EXP floor.
        engine
            .state
            .player2
            .tower_mut(TowerKind::GuardTower2)
            .unwrap()
            .def = 170;
        engine
            .attack(&p1(), TroopKind::Bishop, TowerKind::GuardTower2)
            .unwrap();
        let events = drain(&mut rx);
        let amount = events
            .iter()
            .find_map(|e| match e {
                GameEvent::ExpGained { amount, .. } => Some(*amount),
                _ => None,
            })
            .unwrap();
        assert_eq!(amount, 1);
    }

    #[test]
    fn test_queen_heals_lowest_hp_tower_with_ceiling() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Queen, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player1.tower_mut(TowerKind::GuardTower1).unwrap().hp = 400;
        engine.state.player1.tower_mut(TowerKind::GuardTower2).unwrap().hp = 150;

        engine.summon(&p1(), TroopKind::Queen).unwrap();

        let events = drain(&mut rx);
        assert_eq!(event_tags(&events), vec!["HEAL", "SUMMON"]);
        match &events[0] {
            GameEvent::Heal {
                target,
                heal_amount,
                tower_hp,
                ..
            } => {
                assert_eq!(*target, TowerKind::GuardTower2);
                assert_eq!(*heal_amount, 300);
                assert_eq!(*tower_hp, 450);
            }
            other => panic!("expected HEAL, got {other:?}"),
        }
    }

    #[test]
    fn test_queen_heal_clamps_at_max_hp() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Queen, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        for kind in [TowerKind::GuardTower1, TowerKind::GuardTower2] {
            engine.state.player1.tower_mut(kind).unwrap().hp = 950;
        }

        engine.summon(&p1(), TroopKind::Queen).unwrap();
        let events = drain(&mut rx);
        match &events[0] {
            GameEvent::Heal {
                heal_amount,
                tower_hp,
                ..
            } => {
                assert_eq!(*heal_amount, 50);
                assert_eq!(*tower_hp, 1000);
            }
            other => panic!("expected HEAL, got {other:?}"),
        }
    }

    #[test]
    fn test_queen_summon_schedules_auto_end_turn_in_simple() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Queen, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        let followups = engine.summon(&p1(), TroopKind::Queen).unwrap();
        assert!(matches!(followups.as_slice(), [FollowUp::EndTurn { .. }]));

        engine.auto_end_turn(&p1());
        assert_eq!(engine.state.current_turn, p2());
        // A stale auto end-turn for a player who lost the turn is a no-op.
        engine.auto_end_turn(&p1());
        assert_eq!(engine.state.current_turn, p2());
    }

    #[test]
    fn test_queen_schedules_no_auto_attack_in_enhanced() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Queen, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        let followups = engine.summon(&p1(), TroopKind::Queen).unwrap();
        assert!(followups.is_empty());
    }

    #[test]
    fn test_queen_is_never_revived() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Queen, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.summon(&p1(), TroopKind::Queen).unwrap();
        let events = drain(&mut rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, GameEvent::TroopRevived { .. })));
        assert_eq!(engine.state.player1.troop(TroopKind::Queen).unwrap().hp, 0);
    }

    #[test]
    fn test_summon_revives_destroyed_troop() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player1.troop_mut(TroopKind::Pawn).unwrap().hp = 0;

        engine.summon(&p1(), TroopKind::Pawn).unwrap();
        let events = drain(&mut rx);
        assert_eq!(event_tags(&events), vec!["TROOP_REVIVED", "SUMMON"]);
        assert_eq!(engine.state.player1.troop(TroopKind::Pawn).unwrap().hp, 50);
    }

    #[test]
    fn test_summon_of_living_troop_emits_no_revive() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player1.troop_mut(TroopKind::Pawn).unwrap().hp = 10;

        engine.summon(&p1(), TroopKind::Pawn).unwrap();
        let events = drain(&mut rx);
        assert_eq!(event_tags(&events), vec!["SUMMON"]);
        // Restored to full regardless.
        assert_eq!(engine.state.player1.troop(TroopKind::Pawn).unwrap().hp, 50);
    }

    #[test]
    fn test_summon_unavailable_troop() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        assert_eq!(
            engine.summon(&p1(), TroopKind::Prince),
            Err(RuleError::TroopNotAvailable)
        );
    }

    #[test]
    fn test_enhanced_mana_cost_and_regen() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Prince, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        assert_eq!(engine.state.player1.mana, STARTING_MANA);

        // Five seconds without summoning caps both players at 10.
        for _ in 0..5 {
            engine.tick_second();
        }
        assert_eq!(engine.state.player1.mana, MAX_MANA);
        assert_eq!(engine.state.player2.mana, MAX_MANA);

        // Prince costs 6: 10 -> 4.
        engine.summon(&p1(), TroopKind::Prince).unwrap();
        assert_eq!(engine.state.player1.mana, 4);

        // Six more seconds: back to the cap, never above it.
        for _ in 0..6 {
            engine.tick_second();
        }
        assert_eq!(engine.state.player1.mana, MAX_MANA);
        assert_eq!(engine.state.player2.mana, MAX_MANA);
    }

    #[test]
    fn test_insufficient_mana() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Prince, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        // Starting mana is 5; the Prince costs 6.
        assert_eq!(
            engine.summon(&p1(), TroopKind::Prince),
            Err(RuleError::InsufficientMana { need: 6, have: 5 })
        );
        // The failed summon consumed nothing.
        assert_eq!(engine.state.player1.mana, STARTING_MANA);
    }

    #[test]
    fn test_mana_tick_emits_every_second() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.tick_second();
        engine.tick_second();
        let events = drain(&mut rx);
        assert_eq!(event_tags(&events), vec!["MANA_TICK", "MANA_TICK"]);
        match &events[1] {
            GameEvent::ManaTick {
                player1_mana,
                time_left,
                ..
            } => {
                assert_eq!(*player1_mana, 7);
                assert_eq!(*time_left, GAME_DURATION_SECS - 2);
            }
            other => panic!("expected MANA_TICK, got {other:?}"),
        }
    }

    #[test]
    fn test_auto_attack_targets_weaker_guard_while_both_stand() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Knight, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player2.tower_mut(TowerKind::GuardTower2).unwrap().hp = 700;

        engine.auto_attack(&p1(), TroopKind::Knight);
        let events = drain(&mut rx);
        let target = events
            .iter()
            .find_map(|e| match e {
                GameEvent::Attack { target, .. } => Some(*target),
                _ => None,
            })
            .unwrap();
        assert_eq!(target, UnitName::Tower(TowerKind::GuardTower2));
    }

    #[test]
    fn test_auto_attack_switches_to_king_once_a_guard_falls() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Knight, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player2.tower_mut(TowerKind::GuardTower1).unwrap().hp = 0;

        engine.auto_attack(&p1(), TroopKind::Knight);
        let events = drain(&mut rx);
        let target = events
            .iter()
            .find_map(|e| match e {
                GameEvent::Attack { target, .. } => Some(*target),
                _ => None,
            })
            .unwrap();
        assert_eq!(target, UnitName::Tower(TowerKind::KingTower));
    }

    #[test]
    fn test_auto_attack_by_dead_troop_is_silent() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player1.troop_mut(TroopKind::Pawn).unwrap().hp = 0;
        let followups = engine.auto_attack(&p1(), TroopKind::Pawn);
        assert!(followups.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_counter_attack_comes_from_first_alive_tower() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Rook, TroopKind::Bishop, TroopKind::Pawn],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );

        engine.counter_attack(&p1(), TroopKind::Rook);
        let events = drain(&mut rx);
        match &events[0] {
            GameEvent::Attack {
                player_id,
                attacker,
                target,
                damage,
                is_crit,
                counter,
                ..
            } => {
                assert_eq!(*player_id, p2());
                assert_eq!(*attacker, UnitName::Tower(TowerKind::KingTower));
                assert_eq!(*target, UnitName::Troop(TroopKind::Rook));
                // King ATK 500 - Rook DEF 200 = 300; no crits in Simple.
                assert_eq!(*damage, 300);
                assert!(!is_crit);
                assert!(counter);
            }
            other => panic!("expected ATTACK, got {other:?}"),
        }

        // The Rook (250 HP) died to the counter: kill credit and EXP go
        // to the tower's owner.
        assert!(events.iter().any(|e| matches!(
            e,
            GameEvent::TroopDestroyed { player_id, troop, .. }
                if *player_id == p2() && *troop == TroopKind::Rook
        )));
        let destroy_exp = events
            .iter()
            .filter_map(|e| match e {
                GameEvent::ExpGained { amount, reason, .. } if reason.contains("destroying") => {
                    Some(*amount)
                }
                _ => None,
            })
            .next()
            .unwrap();
        assert_eq!(destroy_exp, 25);
    }

    #[test]
    fn test_counter_attack_skips_king_when_destroyed() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Rook, TroopKind::Bishop, TroopKind::Pawn],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player2.tower_mut(TowerKind::KingTower).unwrap().hp = 0;

        engine.counter_attack(&p1(), TroopKind::Rook);
        let events = drain(&mut rx);
        let attacker = events
            .iter()
            .find_map(|e| match e {
                GameEvent::Attack { attacker, .. } => Some(*attacker),
                _ => None,
            })
            .unwrap();
        assert_eq!(attacker, UnitName::Tower(TowerKind::GuardTower1));
    }

    #[test]
    fn test_queen_is_never_counter_attacked() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Queen, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.counter_attack(&p1(), TroopKind::Queen);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_counter_attack_skips_dead_troop() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player1.troop_mut(TroopKind::Pawn).unwrap().hp = 0;
        engine.counter_attack(&p1(), TroopKind::Pawn);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_tower_destruction_awards_exp_and_counts_losses() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Prince, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player2.tower_mut(TowerKind::GuardTower1).unwrap().hp = 100;

        engine
            .attack(&p1(), TroopKind::Prince, TowerKind::GuardTower1)
            .unwrap();
        let events = drain(&mut rx);

        assert!(events.iter().any(|e| matches!(
            e,
            GameEvent::TowerDestroyed { tower, .. } if *tower == TowerKind::GuardTower1
        )));
        // 100 for the guard tower, on top of the damage EXP.
        assert!(events.iter().any(|e| matches!(
            e,
            GameEvent::ExpGained { amount, .. } if *amount == GUARD_TOWER_EXP
        )));
        assert_eq!(engine.state.towers_killed.player2, 1);
        assert_eq!(engine.state.towers_killed.player1, 0);
        // Destroying a guard does not end the game.
        assert!(engine.is_active());
    }

    #[test]
    fn test_king_tower_destruction_ends_game() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Prince, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.player2.tower_mut(TowerKind::GuardTower1).unwrap().hp = 0;
        engine.state.player2.tower_mut(TowerKind::KingTower).unwrap().hp = 50;

        let followups = engine
            .attack(&p1(), TroopKind::Prince, TowerKind::KingTower)
            .unwrap();
        // No counter-attack after the match ends.
        assert!(followups.is_empty());

        let events = drain(&mut rx);
        match events.last().unwrap() {
            GameEvent::GameEnd {
                winner,
                reason,
                player1_exp,
                player2_exp,
            } => {
                assert_eq!(*winner, Winner::Player(p1()));
                assert_eq!(*reason, EndReason::KingTowerDestroyed);
                // Damage (100/50=2) + king EXP (200) + win bonus (30).
                assert_eq!(*player1_exp, 232);
                assert_eq!(*player2_exp, LOSS_EXP);
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }
        assert_eq!(engine.state.status, Status::Finished);
    }

    #[test]
    fn test_finished_game_rejects_everything_and_stays_silent() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.surrender(&p1()).unwrap();
        drain(&mut rx);

        assert_eq!(
            engine.summon(&p2(), TroopKind::Pawn),
            Err(RuleError::GameNotActive)
        );
        assert_eq!(engine.surrender(&p2()), Err(RuleError::GameNotActive));
        engine.tick_second();
        engine.auto_attack(&p1(), TroopKind::Pawn);
        engine.counter_attack(&p1(), TroopKind::Pawn);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_surrender_awards_win_loss_split() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.surrender(&p1()).unwrap();
        let events = drain(&mut rx);
        match events.last().unwrap() {
            GameEvent::GameEnd {
                winner,
                reason,
                player1_exp,
                player2_exp,
            } => {
                assert_eq!(*winner, Winner::Player(p2()));
                assert_eq!(*reason, EndReason::Surrender);
                assert_eq!(*player1_exp, LOSS_EXP);
                assert_eq!(*player2_exp, WIN_EXP);
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_fewer_losses_wins() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        // P2 lost one tower, P1 lost none.
        engine.state.player2.tower_mut(TowerKind::GuardTower1).unwrap().hp = 0;
        engine.state.time_left = 1;

        engine.tick_second();
        let events = drain(&mut rx);
        match events.last().unwrap() {
            GameEvent::GameEnd { winner, reason, .. } => {
                assert_eq!(*winner, Winner::Player(p1()));
                assert_eq!(*reason, EndReason::TimeUp);
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_equal_losses_is_draw() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.state.time_left = 1;

        engine.tick_second();
        let events = drain(&mut rx);
        match events.last().unwrap() {
            GameEvent::GameEnd {
                winner,
                player1_exp,
                player2_exp,
                ..
            } => {
                assert_eq!(*winner, Winner::Draw);
                assert_eq!(*player1_exp, DRAW_EXP);
                assert_eq!(*player2_exp, DRAW_EXP);
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_sole_surviving_king_wins_despite_losses() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Enhanced,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        // P1 lost both guards (2 losses) but P2's king is down (1 loss):
        // the king rule outranks the tower count.
        engine.state.player1.tower_mut(TowerKind::GuardTower1).unwrap().hp = 0;
        engine.state.player1.tower_mut(TowerKind::GuardTower2).unwrap().hp = 0;
        engine.state.player2.tower_mut(TowerKind::KingTower).unwrap().hp = 0;
        engine.state.time_left = 1;

        engine.tick_second();
        let events = drain(&mut rx);
        match events.last().unwrap() {
            GameEvent::GameEnd { winner, .. } => {
                assert_eq!(*winner, Winner::Player(p1()));
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }
    }

    #[test]
    fn test_abort_with_survivor_ends_as_disconnect_win() {
        let (mut engine, mut rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Pawn, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        engine.abort(Some(p2()), EndReason::OpponentDisconnect);
        let events = drain(&mut rx);
        match events.last().unwrap() {
            GameEvent::GameEnd { winner, reason, .. } => {
                assert_eq!(*winner, Winner::Player(p2()));
                assert_eq!(*reason, EndReason::OpponentDisconnect);
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }
        // A second abort is a no-op.
        engine.abort(Some(p1()), EndReason::ServerStop);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_hp_stays_within_bounds_through_combat() {
        let (mut engine, _rx) = engine_with_hands(
            Mode::Simple,
            &[TroopKind::Prince, TroopKind::Bishop, TroopKind::Rook],
            &[TroopKind::Pawn, TroopKind::Knight, TroopKind::Rook],
        );
        for _ in 0..20 {
            let _ = engine.attack(&p1(), TroopKind::Prince, TowerKind::GuardTower1);
            engine.counter_attack(&p1(), TroopKind::Prince);
        }
        for slot in [&engine.state.player1, &engine.state.player2] {
            for troop in &slot.troops {
                assert!(troop.hp <= troop.max_hp);
            }
            for tower in &slot.towers {
                assert!(tower.hp <= tower.max_hp);
            }
        }
    }
}
