//! Notification and historical-log contracts
//!
//! The core never composes or sends email. On a status transition it hands
//! a [`Notification`] to whatever [`Notifier`] was wired in at startup; the
//! site-specific implementation resolves addresses, renders bodies and
//! talks SMTP. The default [`LogNotifier`] just writes service log lines,
//! which is also what debug deployments want to read.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::models::Event;

/// A user as the notifier sees one.
#[derive(Debug, Clone)]
pub struct UserRef {
    pub uid: u32,
    pub username: String,
}

/// One of the top consumers in a high-usage report.
#[derive(Debug, Clone)]
pub struct HighUsageUser {
    pub uid: u32,
    pub username: String,
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

/// What happened, with everything an email needs.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A user was promoted into a penalty tier.
    Violation {
        user: UserRef,
        status_group: String,
        occurrences: u32,
        /// When the user's badness last left zero.
        badness_start_ts: i64,
        /// Newest-first snapshot of the user's event ring.
        events: Vec<Event>,
        /// The latest event's processes folded by name, heaviest first,
        /// ready for an email table.
        top_processes: Vec<crate::models::ProcessUsage>,
        /// Other hosts in the sync group the penalty applies on.
        peer_hosts: Vec<String>,
        /// Debug deployments mark the body and go to admins only.
        debug: bool,
    },
    /// A penalty timed out on the authority host.
    Release {
        user: UserRef,
        status_group: String,
        debug: bool,
    },
    /// The whole machine is pinned, no single user at fault.
    HighUsage {
        cpu_pct: f64,
        mem_pct: f64,
        top_users: Vec<HighUsageUser>,
        debug: bool,
    },
}

/// Site integration point for outbound notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: Notification) -> Result<()>;
}

/// Receives event history at the moments worth keeping: status transitions
/// and high-usage incidents.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn record_violation(&self, uid: u32, events: &[Event]) -> Result<()>;
    async fn record_high_usage(&self, users: &[HighUsageUser]) -> Result<()>;
}

/// Notifier that only writes service log lines.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: Notification) -> Result<()> {
        match notification {
            Notification::Violation {
                user,
                status_group,
                occurrences,
                ..
            } => {
                info!(
                    uid = user.uid,
                    username = %user.username,
                    status = %status_group,
                    occurrences,
                    "User was put in penalty"
                );
            }
            Notification::Release {
                user, status_group, ..
            } => {
                info!(
                    uid = user.uid,
                    username = %user.username,
                    status = %status_group,
                    "User was released from penalty"
                );
            }
            Notification::HighUsage {
                cpu_pct,
                mem_pct,
                top_users,
                ..
            } => {
                info!(
                    cpu_pct,
                    mem_pct,
                    top_users = top_users.len(),
                    "High usage on the machine"
                );
            }
        }
        Ok(())
    }
}

/// Event log that drops everything, for sites without the history store.
pub struct NullEventLog;

#[async_trait]
impl EventLog for NullEventLog {
    async fn record_violation(&self, _uid: u32, _events: &[Event]) -> Result<()> {
        Ok(())
    }

    async fn record_high_usage(&self, _users: &[HighUsageUser]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_accepts_all_kinds() {
        let notifier = LogNotifier;
        let user = UserRef {
            uid: 1000,
            username: "u1000".to_string(),
        };
        notifier
            .deliver(Notification::Violation {
                user: user.clone(),
                status_group: "penalty1".to_string(),
                occurrences: 1,
                badness_start_ts: 0,
                events: vec![],
                top_processes: vec![],
                peer_hosts: vec!["hostB".to_string()],
                debug: false,
            })
            .await
            .unwrap();
        notifier
            .deliver(Notification::Release {
                user,
                status_group: "normal".to_string(),
                debug: true,
            })
            .await
            .unwrap();
        notifier
            .deliver(Notification::HighUsage {
                cpu_pct: 1500.0,
                mem_pct: 92.0,
                top_users: vec![],
                debug: false,
            })
            .await
            .unwrap();
    }
}
