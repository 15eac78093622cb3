//! Matchmaker
//!
//! Two independent FIFO queues, one per mode. Pairing is strictly
//! first-come-first-served with no skill matching. Tickets are just
//! player ids; liveness is checked by the server at pop time, and a
//! ticket whose session has vanished is simply dropped. A session that
//! closes removes its own ticket.

use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::game::types::{Mode, PlayerId};

#[derive(Default)]
struct Queues {
    simple: VecDeque<PlayerId>,
    enhanced: VecDeque<PlayerId>,
}

impl Queues {
    fn queue_mut(&mut self, mode: Mode) -> &mut VecDeque<PlayerId> {
        match mode {
            Mode::Simple => &mut self.simple,
            Mode::Enhanced => &mut self.enhanced,
        }
    }
}

/// FIFO pairing queues for both modes.
#[derive(Default)]
pub struct Matchmaker {
    queues: Mutex<Queues>,
}

impl Matchmaker {
    /// Create empty queues.
    pub fn new() -> Self {
        Matchmaker::default()
    }

    /// Add a player to a mode's queue. Idempotent: a player already
    /// waiting in either queue is not added again. Returns whether the
    /// ticket was added.
    pub async fn enqueue(&self, mode: Mode, player: PlayerId) -> bool {
        let mut queues = self.queues.lock().await;
        if queues.simple.contains(&player) || queues.enhanced.contains(&player) {
            return false;
        }
        queues.queue_mut(mode).push_back(player);
        true
    }

    /// Remove a player's ticket from both queues (session close).
    pub async fn remove(&self, player: &PlayerId) {
        let mut queues = self.queues.lock().await;
        queues.simple.retain(|p| p != player);
        queues.enhanced.retain(|p| p != player);
    }

    /// Pop the two oldest tickets of a mode, if the queue holds at least
    /// two.
    pub async fn pop_pair(&self, mode: Mode) -> Option<(PlayerId, PlayerId)> {
        let mut queues = self.queues.lock().await;
        let queue = queues.queue_mut(mode);
        if queue.len() < 2 {
            return None;
        }
        let first = queue.pop_front()?;
        let second = queue.pop_front()?;
        Some((first, second))
    }

    /// Put a ticket back at the head of its queue (its partner's session
    /// vanished between enqueue and pairing).
    pub async fn requeue_front(&self, mode: Mode, player: PlayerId) {
        let mut queues = self.queues.lock().await;
        queues.queue_mut(mode).push_front(player);
    }

    /// Number of tickets waiting in a mode's queue.
    pub async fn queue_len(&self, mode: Mode) -> usize {
        let mut queues = self.queues.lock().await;
        queues.queue_mut(mode).len()
    }
}
