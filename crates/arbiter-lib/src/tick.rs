//! The control loop
//!
//! One tick runs the phases in a fixed order: collect, aggregate, score,
//! run the status machine, enforce quotas, synchronize with peers, notify.
//! Transitions made by the status machine are visible to the enforcer and
//! the synchronizer within the same tick, and a sync adoption can never
//! overwrite a penalty decision made this very tick. The tick is the unit
//! of atomicity: a user's state either advances coherently or is retried
//! next tick.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::badness::PerAxis;
use crate::collector::{Collector, SystemdSlice};
use crate::config::ArbiterConfig;
use crate::enforcer::Enforcer;
use crate::events::{build_event, EventRing};
use crate::exitfile::ExitFileWatcher;
use crate::highusage::HighUsageWatcher;
use crate::models::fold_processes_by_name;
use crate::notifier::{EventLog, Notification, Notifier, UserRef};
use crate::startup::AccountingSlice;
use crate::status::{StatusPolicy, Transition};
use crate::statusdb::{pick_winner, StatusDb, StatusRow};
use crate::sysinfo::SystemSpecs;
use crate::user::UserState;

/// Total wall-clock budget for all SQL work in one tick.
const SQL_BUDGET: Duration = Duration::from_secs(5);

/// Seconds between status store cleanup passes.
const CLEANUP_INTERVAL: i64 = 3600;

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A termination signal arrived; the tick completed and state was
    /// flushed.
    Shutdown,
    /// The exit file was touched; exit with the distinguished code.
    ExitFile,
}

pub struct ControlLoop {
    cfg: ArbiterConfig,
    specs: SystemSpecs,
    policy: StatusPolicy,
    collector: Collector,
    enforcer: Enforcer,
    statusdb: Option<StatusDb>,
    notifier: Arc<dyn Notifier>,
    event_log: Arc<dyn EventLog>,
    high_usage: Option<HighUsageWatcher>,
    exit_file: Option<ExitFileWatcher>,
    accounting: Option<AccountingSlice>,
    cgroup_root: PathBuf,
    users: HashMap<u32, UserState>,
    /// Peer hostnames seen in the last successful sync, for emails.
    peer_hosts: Vec<String>,
    cleanup_due_ts: i64,
    poll_interval: Duration,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ArbiterConfig,
        specs: SystemSpecs,
        collector: Collector,
        enforcer: Enforcer,
        statusdb: Option<StatusDb>,
        notifier: Arc<dyn Notifier>,
        event_log: Arc<dyn EventLog>,
        exit_file: Option<ExitFileWatcher>,
        accounting: Option<AccountingSlice>,
        cgroup_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let policy = StatusPolicy::new(&cfg, &specs)?;
        let high_usage = cfg
            .high_usage_watcher
            .high_usage_watcher
            .then(|| HighUsageWatcher::new(&cfg.high_usage_watcher, &specs));
        let poll_interval = cfg.poll_interval();

        Ok(Self {
            cfg,
            specs,
            policy,
            collector,
            enforcer,
            statusdb,
            notifier,
            event_log,
            high_usage,
            exit_file,
            accounting,
            cgroup_root: cgroup_root.into(),
            users: HashMap::new(),
            peer_hosts: Vec::new(),
            cleanup_due_ts: chrono::Utc::now().timestamp() + CLEANUP_INTERVAL,
            poll_interval,
        })
    }

    #[cfg(test)]
    pub(crate) fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    #[cfg(test)]
    pub(crate) fn user(&self, uid: u32) -> Option<&UserState> {
        self.users.get(&uid)
    }

    /// Rehydrate user state from the status store so a restart does not
    /// amnesty everyone in penalty. Rows older than the import timeout were
    /// already filtered by the store.
    pub async fn bootstrap(&mut self, now: i64) -> Result<()> {
        let Some(db) = &self.statusdb else {
            return Ok(());
        };
        db.create_tables_if_needed().await?;

        let stored = db.bootstrap_statuses(now).await?;
        let scores = db.read_host_badness(now).await?;

        for (uid, row) in stored {
            let username = crate::sysinfo::passwd_entry(uid)
                .map(|e| e.name)
                .unwrap_or_else(|| uid.to_string());
            let gids = crate::sysinfo::group_gids(uid);
            let mut status = row.to_status();
            self.policy.reconcile_with_config(uid, &gids, &mut status);

            let mut user = UserState {
                uid,
                username,
                gids,
                ring: EventRing::new(self.cfg.badness.max_history_kept),
                badness: crate::badness::Badness::new(now),
                status,
            };
            // A user in penalty carries no badness by invariant
            if let Some(score) = scores.get(&uid) {
                if !self.policy.is_penalty(&user.status.current) {
                    user.badness = score.clone();
                }
            }
            info!(
                uid,
                status = %user.status.current,
                occurrences = user.status.occurrences,
                "Restored user state from the status store"
            );
            self.users.insert(uid, user);
        }
        Ok(())
    }

    /// Run ticks until a signal or the exit file stops the loop. The final
    /// tick's state is flushed to the status store so peers see an up to
    /// date modified_ts.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<ExitReason> {
        info!(
            refresh_secs = self.cfg.general.arbiter_refresh,
            history_per_refresh = self.cfg.general.history_per_refresh,
            poll = self.cfg.general.poll,
            "Starting the control loop"
        );

        loop {
            let deadline =
                Instant::now() + Duration::from_secs(self.cfg.general.arbiter_refresh);

            let exit_requested = self.tick().await;
            if exit_requested {
                self.final_flush().await;
                return Ok(ExitReason::ExitFile);
            }

            if Instant::now() > deadline {
                warn!(
                    late_ms = (Instant::now() - deadline).as_millis() as u64,
                    "Tick overran the refresh interval; starting the next immediately"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shutdown.recv() => {
                    info!("Termination signal received; flushing state");
                    self.final_flush().await;
                    return Ok(ExitReason::Shutdown);
                }
            }
        }
    }

    /// One full control cycle. Returns whether the exit file requested
    /// termination.
    pub async fn tick(&mut self) -> bool {
        let now = chrono::Utc::now().timestamp();

        // Phase 1+2: collect and aggregate
        self.refresh_users(now).await;
        self.collect().await;

        if let Some(exit_file) = &mut self.exit_file {
            if exit_file.triggered().await {
                return true;
            }
        }

        if !self.cfg.general.debug_mode {
            if let Some(accounting) = &self.accounting {
                if let Err(err) = accounting.create_if_needed(&self.cgroup_root).await {
                    warn!(error = %err, "Failed to recreate the accounting slice");
                }
            }
        }

        // Phases 3-5: score, transition, enforce
        let notifications = self.evaluate_users(now).await;

        // Phase 6: synchronize with peers
        self.synchronize(now).await;

        // Phase 7: notify
        for notification in notifications {
            if let Err(err) = self.notifier.deliver(notification).await {
                warn!(error = %err, "Failed to deliver notification");
            }
        }
        self.check_high_usage(now).await;

        if now >= self.cleanup_due_ts {
            if let Some(db) = &self.statusdb {
                match tokio::time::timeout(SQL_BUDGET, db.cleanup(now)).await {
                    Ok(Ok(())) => self.cleanup_due_ts = now + CLEANUP_INTERVAL,
                    Ok(Err(err)) => debug!(error = %err, "Status store cleanup failed; will retry"),
                    Err(_) => debug!("Status store cleanup timed out; will retry"),
                }
            }
        }

        false
    }

    /// Start tracking users whose slices appeared since the last tick.
    async fn refresh_users(&mut self, now: i64) {
        let tracked = match self.collector.discover_users().await {
            Ok(tracked) => tracked,
            Err(err) => {
                warn!(error = %err, "Failed to enumerate user slices");
                return;
            }
        };
        for user in tracked {
            if let Some(existing) = self.users.get_mut(&user.uid) {
                existing.gids = user.gids;
                continue;
            }
            debug!(uid = user.uid, username = %user.username, "Tracking new user");
            self.users.insert(
                user.uid,
                UserState::new(&user, &self.policy, self.cfg.badness.max_history_kept, now),
            );
        }
    }

    /// Collect `history_per_refresh` events and append them to each user's
    /// ring.
    async fn collect(&mut self) {
        let uids: Vec<u32> = self.users.keys().copied().collect();
        for _ in 0..self.cfg.general.history_per_refresh {
            let (raw_events, machine) =
                self.collector.collect_event(&uids, self.poll_interval).await;
            for (uid, raw) in raw_events {
                let Some(user) = self.users.get_mut(&uid) else {
                    continue;
                };
                let event = build_event(raw, &self.policy, &user.status.current);
                user.ring.push(event);
            }
            if let (Some(watcher), Some(machine)) = (&mut self.high_usage, machine) {
                watcher.add_usage(machine);
            }
        }
    }

    /// Score badness, run the status machine and enforce quotas for every
    /// tracked user. Users with nothing left to track are dropped.
    async fn evaluate_users(&mut self, now: i64) -> Vec<Notification> {
        let mut notifications = Vec::new();
        let uids: Vec<u32> = self.users.keys().copied().collect();

        for uid in uids {
            let active = SystemdSlice::user(&self.cgroup_root, uid).active().await;
            let user = self.users.get_mut(&uid).expect("uid came from the map");

            if !user.needs_tracking(active) {
                debug!(
                    user = %user.display_name(),
                    "No longer tracking (logged out with good behavior)"
                );
                self.users.remove(&uid);
                continue;
            }

            // The scorer is short-circuited inside penalty
            if !self.policy.is_penalty(&user.status.current) {
                let quotas = self.policy.quotas(&user.status.default, &user.status.current);
                let (cpu_pct, mem_bytes) = user
                    .ring
                    .average_accounted(self.cfg.general.history_per_refresh as usize);
                let usage = PerAxis {
                    cpu: cpu_pct,
                    mem: self.specs.bytes_to_pct(mem_bytes),
                };
                user.badness.update(
                    usage,
                    PerAxis {
                        cpu: quotas.cpu_pct,
                        mem: quotas.mem_pct,
                    },
                    &self.cfg.badness,
                    self.cfg.general.arbiter_refresh,
                    now,
                );
                if user.badness.is_bad() {
                    debug!(
                        user = %user.display_name(),
                        cpu = user.badness.cpu,
                        mem = user.badness.mem,
                        "User has nonzero badness"
                    );
                }
            }

            let badness_start_ts = user.badness.start_of_bad_ts;
            let transition =
                self.policy
                    .evaluate(&mut user.status, &mut user.badness, &self.specs.hostname, now);

            match transition {
                Some(Transition::Penalized { ref group }) => {
                    info!(user = %user.display_name(), status = %group, "User was put in penalty");
                    let events = user.ring.snapshot();
                    let top_processes = user
                        .ring
                        .latest()
                        .map(|event| fold_processes_by_name(&event.processes))
                        .unwrap_or_default();
                    if let Err(err) = self.event_log.record_violation(uid, &events).await {
                        warn!(error = %err, "Failed to record violation history");
                    }
                    notifications.push(Notification::Violation {
                        user: UserRef {
                            uid,
                            username: user.username.clone(),
                        },
                        status_group: group.clone(),
                        occurrences: user.status.occurrences,
                        badness_start_ts,
                        events,
                        top_processes,
                        peer_hosts: self.peer_hosts.clone(),
                        debug: self.cfg.general.debug_mode,
                    });
                }
                Some(Transition::Released { ref group, notify }) => {
                    info!(user = %user.display_name(), status = %group, "User was released from penalty");
                    if notify {
                        notifications.push(Notification::Release {
                            user: UserRef {
                                uid,
                                username: user.username.clone(),
                            },
                            status_group: group.clone(),
                            debug: self.cfg.general.debug_mode,
                        });
                    }
                }
                Some(Transition::Forgiven) => {
                    info!(
                        user = %user.display_name(),
                        occurrences = user.status.occurrences,
                        "Penalty occurrences lowered"
                    );
                }
                None => {}
            }

            if active {
                let quotas = self.policy.quotas(&user.status.default, &user.status.current);
                if let Err(err) = self.enforcer.apply(uid, &quotas).await {
                    warn!(user = %user.display_name(), error = %err, "Failed to enforce quotas");
                }
            }
        }

        notifications
    }

    /// Write our rows, read peer rows, and adopt any peer state that wins
    /// reconciliation. Adoption is silent; emails only ever originate at
    /// the authority host.
    async fn synchronize(&mut self, now: i64) {
        let Some(db) = &self.statusdb else {
            return;
        };

        let result = tokio::time::timeout(SQL_BUDGET, async {
            let badness = self
                .users
                .iter()
                .map(|(&uid, user)| (uid, user.badness.clone()))
                .collect();
            db.write_badness(&badness, now).await?;

            let statuses = self
                .users
                .iter()
                .map(|(&uid, user)| (uid, user.status.clone()))
                .collect();
            db.write_statuses(&statuses, now).await?;

            if db.sync_enabled() {
                db.read_peer_statuses().await.map(Some)
            } else {
                Ok(None)
            }
        })
        .await;

        let peers = match result {
            Ok(Ok(Some(peers))) => peers,
            Ok(Ok(None)) => return,
            Ok(Err(err)) => {
                warn!(error = %err, "Status store sync failed; continuing with local state");
                return;
            }
            Err(_) => {
                warn!("Status store sync exceeded its budget; continuing with local state");
                return;
            }
        };

        let mut seen_hosts: Vec<String> = peers
            .values()
            .flatten()
            .map(|row| row.hostname.clone())
            .collect();
        seen_hosts.sort();
        seen_hosts.dedup();
        self.peer_hosts = seen_hosts;

        let stale_after = self.cfg.badness.imported_badness_timeout;
        for (uid, user) in self.users.iter_mut() {
            let Some(peer_rows) = peers.get(uid) else {
                continue;
            };
            if let Some(source) = reconcile_user(
                user,
                peer_rows,
                &self.policy,
                &self.specs.hostname,
                now,
                stale_after,
            ) {
                info!(
                    user = %user.display_name(),
                    source = %source,
                    status = %user.status.current,
                    "Status was synced from another host"
                );
            }
        }
    }

    async fn check_high_usage(&mut self, now: i64) {
        let Some(watcher) = &mut self.high_usage else {
            return;
        };
        let Some(usage) = watcher.check(now) else {
            return;
        };

        let users: Vec<&UserState> = self.users.values().collect();
        let top_users = watcher.top_users(&users, &self.specs);
        info!(
            cpu_pct = usage.cpu_pct,
            mem_pct = usage.mem_pct,
            "High usage on the machine"
        );
        if let Err(err) = self.event_log.record_high_usage(&top_users).await {
            warn!(error = %err, "Failed to record high usage history");
        }
        let notification = Notification::HighUsage {
            cpu_pct: usage.cpu_pct,
            mem_pct: usage.mem_pct,
            top_users,
            debug: self.cfg.general.debug_mode,
        };
        if let Err(err) = self.notifier.deliver(notification).await {
            warn!(error = %err, "Failed to deliver high usage notification");
        }
    }

    /// Push the final state out so peers see a fresh modified_ts and a
    /// restart can rehydrate.
    async fn final_flush(&self) {
        let Some(db) = &self.statusdb else {
            return;
        };
        let now = chrono::Utc::now().timestamp();
        let statuses = self
            .users
            .iter()
            .map(|(&uid, user)| (uid, user.status.clone()))
            .collect();
        let badness = self
            .users
            .iter()
            .map(|(&uid, user)| (uid, user.badness.clone()))
            .collect();
        let flush = async {
            db.write_statuses(&statuses, now).await?;
            db.write_badness(&badness, now).await
        };
        match tokio::time::timeout(SQL_BUDGET, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "Final status store flush failed"),
            Err(_) => warn!("Final status store flush timed out"),
        }
    }
}

/// Reconcile one user against their peer rows. Our own row was written
/// moments ago, so it is always fresh; a peer only wins with more
/// occurrences, a penalty against our default, or a later write. Returns
/// the winning hostname when it was not ours.
fn reconcile_user(
    user: &mut UserState,
    peer_rows: &[StatusRow],
    policy: &StatusPolicy,
    hostname: &str,
    now: i64,
    stale_after: i64,
) -> Option<String> {
    let mine = StatusRow::from_status(hostname, "", user.uid, &user.status, now);
    let mut rows = vec![mine];
    rows.extend_from_slice(peer_rows);

    let winner = pick_winner(&rows, now, stale_after)?;
    if winner.hostname == hostname {
        return None;
    }

    let source = winner.hostname.clone();
    user.status = winner.to_status();
    policy.reconcile_with_config(user.uid, &user.gids, &mut user.status);
    if user.status.occurrences > policy.max_occurrences() {
        warn!(
            uid = user.uid,
            occurrences = user.status.occurrences,
            "Adopted occurrences exceed the configured tiers; clamping"
        );
        user.status.occurrences = policy.max_occurrences();
    }
    // The adopted state may put the user in penalty, where badness is
    // always zero.
    if policy.is_penalty(&user.status.current) {
        user.badness.reset(now);
    }
    Some(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::TrackedUser;
    use crate::config::tests::{parse_config, BASE_TOML};
    use crate::status::Status;

    fn specs() -> SystemSpecs {
        SystemSpecs {
            total_mem_bytes: 64 * 1024 * 1024 * 1024,
            total_swap_bytes: 0,
            cpu_count: 16,
            threads_per_core: 1,
            clockticks_per_sec: 100,
            hostname: "hostA".to_string(),
        }
    }

    fn policy() -> StatusPolicy {
        let cfg = parse_config(BASE_TOML).unwrap();
        StatusPolicy::new(&cfg, &specs()).unwrap()
    }

    fn user() -> UserState {
        UserState::new(
            &TrackedUser {
                uid: 1000,
                username: "u1000".to_string(),
                gids: vec![1000],
            },
            &policy(),
            16,
            0,
        )
    }

    fn peer_row(hostname: &str, status: &Status, modified_ts: i64) -> StatusRow {
        StatusRow::from_status(hostname, "", 1000, status, modified_ts)
    }

    #[test]
    fn test_peer_penalty_adopted() {
        let policy = policy();
        let mut user = user();

        let mut peer_status = Status::new_default("normal");
        peer_status.current = "penalty1".to_string();
        peer_status.occurrences = 1;
        peer_status.penalty_expiry_ts = Some(10_000);
        peer_status.authority = Some("hostB".to_string());
        let peers = vec![peer_row("hostB", &peer_status, 5000)];

        let source = reconcile_user(&mut user, &peers, &policy, "hostA", 5000, 3600);
        assert_eq!(source.as_deref(), Some("hostB"));
        assert_eq!(user.status.current, "penalty1");
        assert_eq!(user.status.occurrences, 1);
        assert_eq!(user.status.authority.as_deref(), Some("hostB"));
        // adoption into penalty zeroes badness
        assert!(user.badness.is_good());
    }

    #[test]
    fn test_local_penalty_not_overwritten_by_stale_peer() {
        let policy = policy();
        let mut user = user();
        user.status.current = "penalty2".to_string();
        user.status.occurrences = 2;
        user.status.penalty_expiry_ts = Some(50_000);
        user.status.authority = Some("hostA".to_string());

        // Stale peer row from long ago with fewer occurrences
        let mut peer_status = Status::new_default("normal");
        peer_status.occurrences = 1;
        let peers = vec![peer_row("hostB", &peer_status, 1000)];

        let source = reconcile_user(&mut user, &peers, &policy, "hostA", 40_000, 3600);
        assert_eq!(source, None);
        assert_eq!(user.status.current, "penalty2");
    }

    #[test]
    fn test_split_brain_converges_to_later_writer() {
        // Both hosts promoted the same user within one tick; the later
        // modified_ts wins on both sides, so they converge on hostB.
        let policy = policy();
        let mut user = user();
        user.status.current = "penalty1".to_string();
        user.status.occurrences = 1;
        user.status.penalty_expiry_ts = Some(10_000);
        user.status.authority = Some("hostA".to_string());

        let mut peer_status = user.status.clone();
        peer_status.authority = Some("hostB".to_string());
        peer_status.penalty_expiry_ts = Some(10_001);

        // reconcile happens at `now`, which is when our own row was
        // written; B wrote 100ms later in wall time, which lands at the
        // same second or later. Model B as one second later.
        let now = 5000;
        let peers = vec![peer_row("hostB", &peer_status, now + 1)];

        let source = reconcile_user(&mut user, &peers, &policy, "hostA", now, 3600);
        assert_eq!(source.as_deref(), Some("hostB"));
        assert_eq!(user.status.authority.as_deref(), Some("hostB"));
        assert_eq!(user.status.penalty_expiry_ts, Some(10_001));
    }

    #[test]
    fn test_adopted_unknown_group_falls_back_to_default() {
        let policy = policy();
        let mut user = user();

        let mut peer_status = Status::new_default("normal");
        peer_status.current = "removed_tier".to_string();
        peer_status.occurrences = 3;
        peer_status.penalty_expiry_ts = Some(10_000);
        let peers = vec![peer_row("hostB", &peer_status, 5000)];

        reconcile_user(&mut user, &peers, &policy, "hostA", 5000, 3600);
        // unknown group from the store falls back to the configured default
        assert_eq!(user.status.current, "normal");
        // and an out-of-range occurrence count clamps to the tier count
        assert_eq!(user.status.occurrences, 2);
    }

    mod full_loop {
        use super::*;
        use crate::collector::Collector;
        use crate::enforcer::Enforcer;
        use crate::notifier::NullEventLog;
        use std::sync::Mutex;
        use tempfile::TempDir;

        /// Notifier that records everything it is handed.
        struct RecordingNotifier(Mutex<Vec<Notification>>);

        #[async_trait::async_trait]
        impl Notifier for RecordingNotifier {
            async fn deliver(&self, notification: Notification) -> Result<()> {
                self.0.lock().unwrap().push(notification);
                Ok(())
            }
        }

        /// Config driving a memory violation within a single tick: root's
        /// slice is tracked (min_uid 0), the normal group gets 1 GB, and
        /// unexplained usage counts against the user.
        fn test_toml() -> String {
            BASE_TOML
                .replace("min_uid = 1000", "min_uid = 0")
                .replace("time_to_max_bad = 900", "time_to_max_bad = 10")
                .replace(
                    "whitelist = [\"bash\", \"ssh*\"]",
                    "whitelist = []\nwhitelist_other_processes = false",
                )
                .replace("mem_quota = 16", "mem_quota = 1")
        }

        fn write_fixture_slice(root: &std::path::Path, uid: u32, rss: u64) {
            let slice = format!("user.slice/user-{}.slice", uid);
            for controller in ["systemd", "cpuacct", "memory"] {
                std::fs::create_dir_all(root.join(controller).join(&slice)).unwrap();
                std::fs::create_dir_all(root.join(controller).join("user.slice")).unwrap();
            }
            std::fs::write(root.join("systemd").join(&slice).join("cgroup.procs"), "").unwrap();
            for base in ["user.slice", slice.as_str()] {
                std::fs::write(
                    root.join("cpuacct").join(base).join("cpuacct.usage_user"),
                    "1000000\n",
                )
                .unwrap();
                std::fs::write(
                    root.join("cpuacct").join(base).join("cpuacct.usage_sys"),
                    "0\n",
                )
                .unwrap();
                std::fs::write(
                    root.join("memory").join(base).join("memory.stat"),
                    format!("total_rss {}\ntotal_mapped_file 0\n", rss),
                )
                .unwrap();
            }
            std::fs::write(
                root.join("cpuacct").join(&slice).join("cpu.cfs_period_us"),
                "100000\n",
            )
            .unwrap();
            std::fs::write(
                root.join("cpuacct").join(&slice).join("cpu.cfs_quota_us"),
                "-1\n",
            )
            .unwrap();
            std::fs::write(
                root.join("memory").join(&slice).join("memory.limit_in_bytes"),
                "9223372036854771712\n",
            )
            .unwrap();
        }

        async fn build_loop(
            cgroup: &TempDir,
            proc: &TempDir,
            db_dir: &TempDir,
        ) -> (ControlLoop, Arc<RecordingNotifier>) {
            let cfg = parse_config(&test_toml()).unwrap();
            let specs = specs();
            let collector =
                Collector::with_roots(&cfg, specs.clone(), cgroup.path(), proc.path());
            let enforcer = Enforcer::with_root(&cfg, false, cgroup.path());
            let url = format!("sqlite://{}/statuses.db?mode=rwc", db_dir.path().display());
            let db = StatusDb::connect(&url, &specs.hostname, "", 3600)
                .await
                .unwrap();
            db.create_tables_if_needed().await.unwrap();

            let notifier = Arc::new(RecordingNotifier(Mutex::new(Vec::new())));
            let mut control_loop = ControlLoop::new(
                cfg,
                specs,
                collector,
                enforcer,
                Some(db),
                notifier.clone(),
                Arc::new(NullEventLog),
                None,
                None,
                cgroup.path(),
            )
            .unwrap();
            control_loop.set_poll_interval(Duration::from_millis(5));
            (control_loop, notifier)
        }

        #[tokio::test]
        async fn test_memory_overuse_is_penalized_once() {
            let cgroup = TempDir::new().unwrap();
            let proc = TempDir::new().unwrap();
            let db_dir = TempDir::new().unwrap();
            // root uses 8 GB against a 1 GB quota
            write_fixture_slice(cgroup.path(), 0, 8 * 1024 * 1024 * 1024);

            let (mut control_loop, notifier) = build_loop(&cgroup, &proc, &db_dir).await;

            assert!(!control_loop.tick().await);
            {
                let user = control_loop.user(0).expect("root is tracked");
                assert_eq!(user.status.current, "penalty1");
                assert_eq!(user.status.occurrences, 1);
                assert!(user.badness.is_good());
                assert_eq!(user.status.authority.as_deref(), Some("hostA"));
            }

            // A second tick in penalty accumulates nothing and must not
            // re-notify.
            assert!(!control_loop.tick().await);
            let notifications = notifier.0.lock().unwrap();
            let violations = notifications
                .iter()
                .filter(|n| matches!(n, Notification::Violation { .. }))
                .count();
            assert_eq!(violations, 1);

            // The enforcer wrote the penalty quota: 0.8 of the 1 GB
            // default, relative quotas.
            let limit = std::fs::read_to_string(
                cgroup
                    .path()
                    .join("memory/user.slice/user-0.slice/memory.limit_in_bytes"),
            )
            .unwrap();
            let expected = (0.8 * 1024.0 * 1024.0 * 1024.0) as u64;
            assert_eq!(limit.trim(), expected.to_string());
        }

        #[tokio::test]
        async fn test_restart_rehydrates_penalty_from_store() {
            let cgroup = TempDir::new().unwrap();
            let proc = TempDir::new().unwrap();
            let db_dir = TempDir::new().unwrap();
            write_fixture_slice(cgroup.path(), 0, 8 * 1024 * 1024 * 1024);

            let (mut first, _) = build_loop(&cgroup, &proc, &db_dir).await;
            assert!(!first.tick().await);
            assert_eq!(first.user(0).unwrap().status.current, "penalty1");
            drop(first);

            // A fresh instance against the same store picks the state up
            let (mut second, _) = build_loop(&cgroup, &proc, &db_dir).await;
            let now = chrono::Utc::now().timestamp();
            second.bootstrap(now).await.unwrap();
            let user = second.user(0).expect("state was rehydrated");
            assert_eq!(user.status.current, "penalty1");
            assert_eq!(user.status.occurrences, 1);
        }

        #[tokio::test]
        async fn test_debug_mode_transitions_without_enforcing() {
            let cgroup = TempDir::new().unwrap();
            let proc = TempDir::new().unwrap();
            let db_dir = TempDir::new().unwrap();
            write_fixture_slice(cgroup.path(), 0, 8 * 1024 * 1024 * 1024);

            let cfg = parse_config(
                &test_toml().replace("debug_mode = false", "debug_mode = true"),
            )
            .unwrap();
            let specs = specs();
            let collector =
                Collector::with_roots(&cfg, specs.clone(), cgroup.path(), proc.path());
            let enforcer = Enforcer::with_root(&cfg, false, cgroup.path());
            let url = format!("sqlite://{}/statuses.db?mode=rwc", db_dir.path().display());
            let db = StatusDb::connect(&url, &specs.hostname, "", 3600)
                .await
                .unwrap();
            db.create_tables_if_needed().await.unwrap();
            let notifier = Arc::new(RecordingNotifier(Mutex::new(Vec::new())));
            let mut control_loop = ControlLoop::new(
                cfg,
                specs,
                collector,
                enforcer,
                Some(db),
                notifier.clone(),
                Arc::new(NullEventLog),
                None,
                None,
                cgroup.path(),
            )
            .unwrap();
            control_loop.set_poll_interval(Duration::from_millis(5));

            assert!(!control_loop.tick().await);

            // The status machine still ran
            assert_eq!(control_loop.user(0).unwrap().status.current, "penalty1");
            // but the quota files were never touched
            let limit = std::fs::read_to_string(
                cgroup
                    .path()
                    .join("memory/user.slice/user-0.slice/memory.limit_in_bytes"),
            )
            .unwrap();
            assert_eq!(limit, "9223372036854771712\n");
            // and the notification is marked as debug
            let notifications = notifier.0.lock().unwrap();
            assert!(notifications
                .iter()
                .any(|n| matches!(n, Notification::Violation { debug: true, .. })));
        }
    }
}
