//! Per-user tracking state
//!
//! One flat record per tracked uid owns everything the control loop knows
//! about a user: their event ring, badness score and status. Child state is
//! never shared between users.

use crate::badness::Badness;
use crate::collector::TrackedUser;
use crate::events::EventRing;
use crate::status::{Status, StatusPolicy};

#[derive(Debug, Clone)]
pub struct UserState {
    pub uid: u32,
    pub username: String,
    pub gids: Vec<u32>,
    pub ring: EventRing,
    pub badness: Badness,
    pub status: Status,
}

impl UserState {
    /// Start tracking a freshly observed user in their default group.
    pub fn new(tracked: &TrackedUser, policy: &StatusPolicy, ring_cap: usize, now: i64) -> Self {
        let default = policy.default_group_for(tracked.uid, &tracked.gids);
        Self {
            uid: tracked.uid,
            username: tracked.username.clone(),
            gids: tracked.gids.clone(),
            ring: EventRing::new(ring_cap),
            badness: Badness::new(now),
            status: Status::new_default(default),
        }
    }

    /// Whether the user must stay tracked. A logged-out user is only
    /// forgotten once nothing about them is worth remembering: no badness,
    /// no occurrences, and their default status.
    pub fn needs_tracking(&self, cgroup_active: bool) -> bool {
        cgroup_active
            || self.badness.is_bad()
            || self.status.occurrences > 0
            || self.status.in_penalty()
    }

    /// `username (uid)`, the form used in log lines.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.username, self.uid)
    }
}
