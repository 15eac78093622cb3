//! Room
//!
//! One running match: the engine behind a single lock, the two member
//! handles, and the timer tasks that drive deferred effects (auto- and
//! counter-attacks, the Queen's auto end-turn, the Enhanced-mode clock).
//!
//! Sessions never hold a room reference; they keep a `GameId` and look
//! the room up in the server registry, so disconnects unlink cleanly in
//! both directions. The room holds member ids and outbound queue handles
//! only, never sessions themselves.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::game::engine::{FollowUp, GameEngine, RuleError};
use crate::game::types::{GameId, Mode, PlayerId, TowerKind, TroopKind};
use crate::network::protocol::Message;

/// A room's view of one participant: identity plus the session's
/// outbound queue.
#[derive(Debug, Clone)]
pub struct RoomMember {
    /// The member's session player id.
    pub player_id: PlayerId,
    /// The member's account name.
    pub username: String,
    /// The member session's outbound message queue.
    pub sender: mpsc::Sender<Message>,
}

/// One active match between exactly two sessions.
pub struct Room {
    /// Match identifier.
    pub id: GameId,
    /// Match mode.
    pub mode: Mode,
    engine: Mutex<GameEngine>,
    members: [RoomMember; 2],
    timers: Mutex<Vec<JoinHandle<()>>>,
    gone: Mutex<BTreeSet<PlayerId>>,
}

impl Room {
    /// Assemble a room around an engine and its two members.
    pub fn new(id: GameId, mode: Mode, engine: GameEngine, members: [RoomMember; 2]) -> Self {
        Room {
            id,
            mode,
            engine: Mutex::new(engine),
            members,
            timers: Mutex::new(Vec::new()),
            gone: Mutex::new(BTreeSet::new()),
        }
    }

    /// The engine lock. All operations and deferred effects re-enter
    /// through this, which makes event order acceptance order.
    pub fn engine(&self) -> &Mutex<GameEngine> {
        &self.engine
    }

    /// Both members.
    pub fn members(&self) -> &[RoomMember; 2] {
        &self.members
    }

    /// The member with the given id.
    pub fn member(&self, id: &PlayerId) -> Option<&RoomMember> {
        self.members.iter().find(|m| m.player_id == *id)
    }

    /// The other member.
    pub fn other_member(&self, id: &PlayerId) -> Option<&RoomMember> {
        self.members.iter().find(|m| m.player_id != *id)
    }

    // =========================================================================
    // OPERATIONS (delegate into the engine, then schedule follow-ups)
    // =========================================================================

    /// Deploy a troop for `caller`.
    pub async fn summon(
        self: &Arc<Self>,
        caller: &PlayerId,
        kind: TroopKind,
    ) -> Result<(), RuleError> {
        let followups = self.engine.lock().await.summon(caller, kind)?;
        self.schedule(followups).await;
        Ok(())
    }

    /// Manual attack for `caller` (Simple mode).
    pub async fn attack(
        self: &Arc<Self>,
        caller: &PlayerId,
        attacker: TroopKind,
        target: TowerKind,
    ) -> Result<(), RuleError> {
        let followups = self.engine.lock().await.attack(caller, attacker, target)?;
        self.schedule(followups).await;
        Ok(())
    }

    /// End `caller`'s turn (Simple mode).
    pub async fn end_turn(&self, caller: &PlayerId) -> Result<(), RuleError> {
        self.engine.lock().await.end_turn(caller)
    }

    /// Concede the match for `caller`.
    pub async fn surrender(&self, caller: &PlayerId) -> Result<(), RuleError> {
        self.engine.lock().await.surrender(caller)
    }

    // =========================================================================
    // TIMERS
    // =========================================================================

    /// Schedule deferred effects. Each fires after its own delay,
    /// re-enters the engine, and schedules whatever the engine hands
    /// back (an auto-attack chains into a counter-attack).
    pub fn schedule<'a>(
        self: &'a Arc<Self>,
        followups: Vec<FollowUp>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            for followup in followups {
                let room = Arc::clone(self);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(followup.delay()).await;
                    let next = {
                        let mut engine = room.engine.lock().await;
                        match followup {
                            FollowUp::AutoAttack { player, troop } => {
                                engine.auto_attack(&player, troop)
                            }
                            FollowUp::CounterAttack { player, troop } => {
                                engine.counter_attack(&player, troop);
                                Vec::new()
                            }
                            FollowUp::EndTurn { player } => {
                                engine.auto_end_turn(&player);
                                Vec::new()
                            }
                        }
                    };
                    if !next.is_empty() {
                        room.schedule(next).await;
                    }
                });
                self.add_timer(handle).await;
            }
        })
    }

    /// Start the Enhanced-mode 1 Hz clock. Ends on its own once the
    /// engine leaves `Active`.
    pub async fn start_clock(self: &Arc<Self>) {
        let room = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of an interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut engine = room.engine.lock().await;
                if !engine.is_active() {
                    break;
                }
                engine.tick_second();
                if !engine.is_active() {
                    break;
                }
            }
            debug!(room = %room.id, "clock stopped");
        });
        self.add_timer(handle).await;
    }

    async fn add_timer(&self, handle: JoinHandle<()>) {
        let mut timers = self.timers.lock().await;
        timers.retain(|h| !h.is_finished());
        timers.push(handle);
    }

    /// Abort every pending timer so room teardown is prompt.
    pub async fn abort_timers(&self) {
        let mut timers = self.timers.lock().await;
        for handle in timers.drain(..) {
            handle.abort();
        }
    }

    // =========================================================================
    // MEMBERSHIP / DELIVERY
    // =========================================================================

    /// Record that a member's session is gone. Returns true when both
    /// sides have now left.
    pub async fn mark_gone(&self, id: &PlayerId) -> bool {
        let mut gone = self.gone.lock().await;
        gone.insert(id.clone());
        gone.len() >= self.members.len()
    }

    /// Enqueue a message to both members without blocking. Returns the
    /// ids of members whose outbound queue was full — the caller treats
    /// those sessions as unresponsive.
    pub fn broadcast(&self, msg: &Message) -> Vec<PlayerId> {
        let mut overflowed = Vec::new();
        for member in &self.members {
            if self.push_to(member, msg.clone()) {
                overflowed.push(member.player_id.clone());
            }
        }
        overflowed
    }

    /// Enqueue a message to one member. Returns true when the member's
    /// queue was full.
    pub fn send_to(&self, id: &PlayerId, msg: Message) -> bool {
        match self.member(id) {
            Some(member) => self.push_to(member, msg),
            None => false,
        }
    }

    fn push_to(&self, member: &RoomMember, msg: Message) -> bool {
        match member.sender.try_send(msg) {
            Ok(()) => false,
            Err(TrySendError::Full(_)) => true,
            // A closed queue means the session is already tearing down;
            // the disconnect path handles it.
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
