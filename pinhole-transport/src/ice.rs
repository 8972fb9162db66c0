//! ICE-style connectivity checker. Builds the priority-ordered candidate
//! pair list and drives simplified connectivity checks: a PUNCH probe per
//! remote candidate per 500 ms round stands in for a full STUN binding,
//! with nomination going to the first pair that answers.

use std::net::SocketAddrV4;
use tracing::{debug, info};

use crate::candidate::{pair_priority, CandidateList, CandidatePair, PairState};
use crate::packet::PacketType;

/// Interval between check rounds.
pub const CHECK_INTERVAL_MS: u64 = 500;
/// Rounds before the checker gives up (20 x 500 ms = 10 s).
pub const MAX_CHECK_ROUNDS: u32 = 20;

/// Which agent drives nomination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlling,
    Controlled,
}

/// Checker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    Idle,
    Gathering,
    GatheringDone,
    Checking,
    Completed,
    Failed,
}

/// Emitted when a tick changes the checker's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceEvent {
    Failed,
}

/// Connectivity checker state for one session.
pub struct IceChecker {
    role: IceRole,
    state: IceState,
    pairs: Vec<CandidatePair>,
    round: u32,
    last_round_ms: u64,
}

impl IceChecker {
    pub fn new(role: IceRole) -> Self {
        Self {
            role,
            state: IceState::Idle,
            pairs: Vec::new(),
            round: 0,
            last_round_ms: 0,
        }
    }

    pub fn state(&self) -> IceState {
        self.state
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    pub fn begin_gathering(&mut self) {
        if self.state == IceState::Idle {
            self.state = IceState::Gathering;
        }
    }

    pub fn gathering_done(&mut self) {
        if matches!(self.state, IceState::Idle | IceState::Gathering) {
            self.state = IceState::GatheringDone;
        }
    }

    /// Recompute the check list from the current candidate sets. The
    /// topmost pair starts `Waiting`, the rest `Frozen`; pair order is the
    /// descending RFC 8445 pair priority.
    pub fn rebuild_pairs(&mut self, locals: &CandidateList, remotes: &CandidateList) {
        self.pairs.clear();
        for local in locals.iter() {
            for remote in remotes.iter() {
                let (g, d) = match self.role {
                    IceRole::Controlling => (local.priority, remote.priority),
                    IceRole::Controlled => (remote.priority, local.priority),
                };
                self.pairs.push(CandidatePair {
                    local: *local,
                    remote: *remote,
                    priority: pair_priority(g, d),
                    state: PairState::Frozen,
                    nominated: false,
                    last_check_ms: 0,
                    check_count: 0,
                });
            }
        }
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        if let Some(top) = self.pairs.first_mut() {
            top.state = PairState::Waiting;
        }
    }

    /// Drop all remote state so a reconnection offer can start clean.
    pub fn reset(&mut self) {
        debug!("ice reset");
        self.pairs.clear();
        self.round = 0;
        self.last_round_ms = 0;
        if self.state != IceState::Idle {
            self.state = IceState::GatheringDone;
        }
    }

    /// Run one tick. Sends a probe burst every `CHECK_INTERVAL_MS` while
    /// checks are active and remote candidates exist.
    pub fn tick(
        &mut self,
        now_ms: u64,
        remotes: &CandidateList,
        mut emit: impl FnMut(SocketAddrV4, PacketType),
    ) -> Option<IceEvent> {
        if !matches!(
            self.state,
            IceState::Gathering | IceState::GatheringDone | IceState::Checking
        ) || remotes.is_empty()
        {
            return None;
        }
        if self.last_round_ms != 0 && now_ms.saturating_sub(self.last_round_ms) < CHECK_INTERVAL_MS
        {
            return None;
        }
        if self.round >= MAX_CHECK_ROUNDS {
            debug!(rounds = self.round, "ice checks exhausted");
            self.state = IceState::Failed;
            return Some(IceEvent::Failed);
        }
        self.state = IceState::Checking;
        self.round += 1;
        self.last_round_ms = now_ms;
        for remote in remotes.iter() {
            emit(remote.addr, PacketType::Punch);
        }
        for pair in &mut self.pairs {
            if matches!(pair.state, PairState::Frozen | PairState::Waiting) {
                pair.state = PairState::InProgress;
            }
            if pair.state == PairState::InProgress {
                pair.last_check_ms = now_ms;
                pair.check_count += 1;
            }
        }
        None
    }

    /// A probe (or its answer) arrived from `addr`: nominate the matching
    /// pair and complete. Returns false when no pair matches, which signals
    /// a peer-reflexive discovery to the caller.
    pub fn on_success(&mut self, addr: SocketAddrV4) -> bool {
        let mut matched = false;
        for pair in &mut self.pairs {
            if pair.remote.addr == addr {
                pair.state = PairState::Succeeded;
                pair.nominated = true;
                matched = true;
            }
        }
        if !matched {
            return false;
        }
        if self.state != IceState::Completed {
            info!(%addr, "ice completed");
        }
        self.state = IceState::Completed;
        true
    }
}
