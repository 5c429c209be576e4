//! Leader election among the actors that share one local store.
//!
//! Exactly one actor per device should hold the remote connection. The
//! election is a plain state machine: callers feed it bus messages and clock
//! ticks, and it answers with messages to post and leadership transitions.
//! Time is always passed in, so the machine never reads a clock itself.
//!
//! Rules:
//! - A fresh actor with no live leader posts `Claim` and waits one claim window.
//! - A leader answers every `Claim` with a `Heartbeat`.
//! - A claimer yields to any `Heartbeat`, and to a `Claim` from a lower id.
//! - A leader that hears a `Heartbeat` from a lower id steps down.
//! - A follower claims when the leader releases or stops heartbeating.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::messages::ActorId;

/// Election messages posted on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaderMessage {
    Claim,
    Heartbeat,
    Release,
}

/// Configuration for leader election.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// How long a claimer waits for objections.
    pub claim_window: Duration,
    /// Leader heartbeat period.
    pub heartbeat_interval: Duration,
    /// Silence after which followers consider the leader gone.
    pub leader_timeout: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            claim_window: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(500),
            leader_timeout: Duration::from_secs(2),
        }
    }
}

/// Leadership transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderEvent {
    BecameLeader,
    LostLeadership,
}

/// Output of one state transition.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub outbound: Vec<LeaderMessage>,
    pub event: Option<LeaderEvent>,
}

impl Step {
    fn send(message: LeaderMessage) -> Self {
        Self {
            outbound: vec![message],
            event: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Claiming { until: Instant },
    Leader { next_heartbeat: Instant },
    Released,
}

/// Election state for one actor.
#[derive(Debug)]
pub struct LeaderElection {
    id: ActorId,
    config: LeaderConfig,
    state: State,
    /// Presumed leader and when we last heard from it.
    known_leader: Option<(ActorId, Instant)>,
}

impl LeaderElection {
    pub fn new(id: ActorId, config: LeaderConfig) -> Self {
        Self {
            id,
            config,
            state: State::Idle,
            known_leader: None,
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader { .. })
    }

    /// The leader we are following, if any.
    pub fn known_leader(&self) -> Option<ActorId> {
        if self.is_leader() {
            return Some(self.id);
        }
        self.known_leader.map(|(id, _)| id)
    }

    /// Join the election.
    pub fn start(&mut self, now: Instant) -> Step {
        match self.state {
            State::Idle if !self.leader_alive(now) => self.claim(now),
            _ => Step::default(),
        }
    }

    /// Apply a message from another actor.
    pub fn handle(&mut self, from: ActorId, message: LeaderMessage, now: Instant) -> Step {
        if from == self.id {
            return Step::default();
        }

        match message {
            LeaderMessage::Heartbeat => {
                self.known_leader = Some((from, now));
                match self.state {
                    State::Claiming { .. } => {
                        self.state = State::Idle;
                        Step::default()
                    }
                    State::Leader { .. } if from < self.id => {
                        tracing::info!(actor = %self.id, leader = %from, "stepping down");
                        self.state = State::Idle;
                        Step {
                            outbound: Vec::new(),
                            event: Some(LeaderEvent::LostLeadership),
                        }
                    }
                    // Two leaders: assert ours so the higher id steps down.
                    State::Leader { .. } => {
                        self.known_leader = None;
                        Step::send(LeaderMessage::Heartbeat)
                    }
                    State::Idle | State::Released => Step::default(),
                }
            }
            LeaderMessage::Claim => match self.state {
                State::Leader { .. } => Step::send(LeaderMessage::Heartbeat),
                State::Claiming { .. } if from < self.id => {
                    self.state = State::Idle;
                    self.known_leader = Some((from, now));
                    Step::default()
                }
                _ => Step::default(),
            },
            LeaderMessage::Release => {
                if self.known_leader.map(|(id, _)| id) == Some(from) {
                    self.known_leader = None;
                }
                match self.state {
                    State::Idle => self.claim(now),
                    _ => Step::default(),
                }
            }
        }
    }

    /// Advance timers.
    pub fn tick(&mut self, now: Instant) -> Step {
        match self.state {
            State::Claiming { until } if now >= until => {
                tracing::info!(actor = %self.id, "became leader");
                self.state = State::Leader {
                    next_heartbeat: now + self.config.heartbeat_interval,
                };
                self.known_leader = None;
                Step {
                    outbound: vec![LeaderMessage::Heartbeat],
                    event: Some(LeaderEvent::BecameLeader),
                }
            }
            State::Leader { next_heartbeat } if now >= next_heartbeat => {
                self.state = State::Leader {
                    next_heartbeat: now + self.config.heartbeat_interval,
                };
                Step::send(LeaderMessage::Heartbeat)
            }
            State::Idle if self.known_leader.is_some() && !self.leader_alive(now) => {
                tracing::debug!(actor = %self.id, "leader timed out");
                self.known_leader = None;
                self.claim(now)
            }
            _ => Step::default(),
        }
    }

    /// Leave the election for good.
    pub fn release(&mut self) -> Step {
        let was_leader = self.is_leader();
        self.state = State::Released;
        if was_leader {
            Step {
                outbound: vec![LeaderMessage::Release],
                event: Some(LeaderEvent::LostLeadership),
            }
        } else {
            Step::default()
        }
    }

    /// When `tick` next has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            State::Claiming { until } => Some(until),
            State::Leader { next_heartbeat } => Some(next_heartbeat),
            State::Idle => self
                .known_leader
                .map(|(_, seen)| seen + self.config.leader_timeout),
            State::Released => None,
        }
    }

    fn leader_alive(&self, now: Instant) -> bool {
        self.known_leader
            .map(|(_, seen)| now.duration_since(seen) < self.config.leader_timeout)
            .unwrap_or(false)
    }

    fn claim(&mut self, now: Instant) -> Step {
        self.state = State::Claiming {
            until: now + self.config.claim_window,
        };
        Step::send(LeaderMessage::Claim)
    }
}
