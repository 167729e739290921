//! Peer link monitoring and controller mode state machine.
//!
//! Tracks per-neighbor beacon arrival and drives the entity-wide switch
//! between the cooperative control strategy (requires fresh peer data) and
//! the degraded autonomous one. The state machine is pure: callers feed it
//! beacons and clock readings; it reports mode transitions. Timer wiring
//! lives in the runtime.
//!
//! # Transitions
//!
//! - `Cooperative -> Degraded`: any tracked link silent for longer than
//!   the silence threshold. The switch is entity-wide and silence checks
//!   stop until recovery.
//! - `Degraded -> Cooperative`: every tracked link has delivered
//!   [`RECOVERY_STREAK`] consecutive in-sequence beacons. A gap in any
//!   link's sequence resets that link's streak to zero.

use std::{collections::HashMap, time::Duration, time::Instant};

/// Silence threshold after which a link is considered lost.
pub const DEFAULT_SILENCE_THRESHOLD: Duration = Duration::from_millis(500);

/// Consecutive in-sequence beacons each link must show before the
/// cooperative strategy is restored.
pub const RECOVERY_STREAK: u32 = 5;

/// Active control strategy of one vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerMode {
    /// Cooperative strategy; depends on fresh peer kinematic data.
    Cooperative,
    /// Autonomous fallback used while peer data is stale.
    Degraded,
}

/// Arrival statistics for one tracked neighbor link.
#[derive(Debug, Clone)]
pub struct PeerLinkState {
    /// When the last beacon from this neighbor arrived.
    pub last_seen: Instant,
    /// Sequence number of that beacon.
    pub last_sequence: Option<u64>,
    /// Current run of exactly-in-sequence beacons.
    pub consecutive_in_order: u32,
}

/// Per-vehicle link monitor.
#[derive(Debug)]
pub struct LinkMonitor {
    links: HashMap<String, PeerLinkState>,
    mode: ControllerMode,
    silence_threshold: Duration,
}

impl LinkMonitor {
    /// Create a monitor tracking `neighbors`, starting in
    /// [`ControllerMode::Cooperative`].
    ///
    /// `now` seeds every link's `last_seen`, granting each neighbor one
    /// full silence window before the first beacon is due.
    pub fn new<I, S>(neighbors: I, silence_threshold: Duration, now: Instant) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let links = neighbors
            .into_iter()
            .map(|neighbor| {
                let state = PeerLinkState {
                    last_seen: now,
                    last_sequence: None,
                    consecutive_in_order: 0,
                };
                (neighbor.into(), state)
            })
            .collect();
        Self { links, mode: ControllerMode::Cooperative, silence_threshold }
    }

    /// Current controller mode.
    pub fn mode(&self) -> ControllerMode {
        self.mode
    }

    /// Neighbors this monitor tracks.
    pub fn tracked_neighbors(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    /// Link statistics for one neighbor, if tracked.
    pub fn link(&self, neighbor: &str) -> Option<&PeerLinkState> {
        self.links.get(neighbor)
    }

    /// Record a beacon from `sender` with sequence number `seqn`.
    ///
    /// Beacons from untracked senders are ignored. Returns the new mode
    /// when this beacon completed recovery.
    pub fn record_beacon(
        &mut self,
        sender: &str,
        seqn: u64,
        now: Instant,
    ) -> Option<ControllerMode> {
        let link = self.links.get_mut(sender)?;

        let in_order = link.last_sequence.is_some_and(|last| seqn == last.wrapping_add(1));
        link.consecutive_in_order = if in_order { link.consecutive_in_order + 1 } else { 0 };
        link.last_sequence = Some(seqn);
        link.last_seen = now;

        if self.mode == ControllerMode::Degraded && self.recovery_complete() {
            self.mode = ControllerMode::Cooperative;
            // Re-arm silence monitoring: stale timestamps from before the
            // outage must not re-degrade instantly.
            for link in self.links.values_mut() {
                link.last_seen = now;
            }
            return Some(ControllerMode::Cooperative);
        }
        None
    }

    /// Check one tracked link for silence.
    ///
    /// Only meaningful in cooperative mode; while degraded, per-link
    /// silence monitoring is suspended. Returns the new mode when this
    /// check triggered the degrade.
    pub fn check_silence(&mut self, neighbor: &str, now: Instant) -> Option<ControllerMode> {
        if self.mode != ControllerMode::Cooperative {
            return None;
        }
        let link = self.links.get(neighbor)?;
        if now.duration_since(link.last_seen) <= self.silence_threshold {
            return None;
        }

        self.mode = ControllerMode::Degraded;
        // Recovery requires fresh streaks, not credit from before the loss
        for link in self.links.values_mut() {
            link.consecutive_in_order = 0;
        }
        Some(ControllerMode::Degraded)
    }

    fn recovery_complete(&self) -> bool {
        !self.links.is_empty()
            && self.links.values().all(|link| link.consecutive_in_order >= RECOVERY_STREAK)
    }
}
