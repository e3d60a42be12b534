//! Arbiter2 daemon
//!
//! Watches interactive login nodes, scores users for sustained CPU and
//! memory overuse via the cgroup hierarchy, and applies time-limited quota
//! penalties. This binary parses arguments, verifies the host can actually
//! be monitored, wires the components together and runs the control loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use arbiter_lib::collector::Collector;
use arbiter_lib::enforcer::Enforcer;
use arbiter_lib::exitfile::{ExitFileWatcher, EXIT_FILE_CODE};
use arbiter_lib::notifier::{LogNotifier, NullEventLog};
use arbiter_lib::startup::{
    verify_cgroup_accounting, verify_pss_readable, verify_write_permissions, AccountingSlice,
};
use arbiter_lib::statusdb::StatusDb;
use arbiter_lib::{ArbiterConfig, ControlLoop, ExitReason, SystemSpecs};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Uses cgroups for monitoring and managing behavior on login nodes.
#[derive(Debug, Parser)]
#[command(name = "arbiterd", version, about)]
struct Args {
    /// Configuration files, cascaded left to right (the rightmost wins).
    #[arg(short = 'g', long = "config", num_args = 1.., required = true)]
    configs: Vec<PathBuf>,

    /// Directory where site files referenced by relative paths live.
    #[arg(short, long)]
    etc: Option<PathBuf>,

    /// Elevate cgroup writes and accounting setup through sudo helpers.
    #[arg(short, long)]
    sudo: bool,

    /// Keep cgroup accounting on by holding a permanent slice for this
    /// (inactive) uid.
    #[arg(short = 'a', long = "account-uid")]
    account_uid: Option<u32>,

    /// Exit with a distinguished code when this file is touched, for
    /// coordinated restarts.
    #[arg(long = "exit-file")]
    exit_file: Option<PathBuf>,

    /// Print application logging to stdout.
    #[arg(short, long)]
    print: bool,

    /// Turn on debugging output (with --print).
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only output critical information (with --print).
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn log_directive(&self) -> &'static str {
        if !self.print {
            "warn"
        } else if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }

    /// Resolve a possibly relative path against --etc.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            if let Some(etc) = &self.etc {
                let candidate = etc.join(path);
                if candidate.exists() {
                    return candidate;
                }
            }
        }
        path.to_path_buf()
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_directive())),
        )
        .with(fmt::layer())
        .init();

    let code = match run(args).await {
        Ok(ExitReason::Shutdown) => 0,
        Ok(ExitReason::ExitFile) => EXIT_FILE_CODE,
        Err(err) => {
            error!(error = ?err, "Fatal startup error");
            2
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<ExitReason> {
    info!("Importing configuration");
    let configs: Vec<PathBuf> = args.configs.iter().map(|p| args.resolve(p)).collect();
    let cfg = ArbiterConfig::load(&configs)?;

    let specs = SystemSpecs::detect()?;
    info!(
        hostname = %specs.hostname,
        cpus = specs.cpu_count,
        mem_gb = specs.total_mem_bytes / (1024 * 1024 * 1024),
        "Detected machine specs"
    );
    if cfg.general.debug_mode {
        info!("Debug mode is on; quotas will not be written and emails go to admins only");
    }

    startup_checks(&args, &cfg).await?;

    let accounting = args
        .account_uid
        .map(|uid| AccountingSlice::new(uid, args.sudo));

    let statusdb_url = if cfg.database.statusdb_url.is_empty() {
        format!(
            "sqlite://{}/statuses.db?mode=rwc",
            cfg.database.log_location
        )
    } else {
        cfg.database.statusdb_url.clone()
    };
    let statusdb = StatusDb::connect(
        &statusdb_url,
        &specs.hostname,
        &cfg.database.statusdb_sync_group,
        cfg.badness.imported_badness_timeout,
    )
    .await
    .context("The status store must be reachable at startup")?;

    let exit_file = match &args.exit_file {
        Some(path) => {
            info!(path = %path.display(), "Watching exit file");
            Some(ExitFileWatcher::new(path, &cfg.daemon.groupname).await)
        }
        None => None,
    };

    let collector = Collector::new(&cfg, specs.clone());
    let enforcer = Enforcer::new(&cfg, args.sudo);

    let mut control_loop = ControlLoop::new(
        cfg,
        specs,
        collector,
        enforcer,
        Some(statusdb),
        Arc::new(LogNotifier),
        Arc::new(NullEventLog),
        exit_file,
        accounting,
        CGROUP_ROOT,
    )?;
    control_loop
        .bootstrap(epoch_now())
        .await
        .context("Failed to rehydrate state from the status store")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(wait_for_termination(shutdown_tx));

    control_loop.run(shutdown_rx).await
}

/// Checks that must pass before the first tick; all fatal.
async fn startup_checks(args: &Args, cfg: &ArbiterConfig) -> Result<()> {
    let cgroup_root = Path::new(CGROUP_ROOT);

    if let Some(uid) = args.account_uid {
        info!(uid, "Turning on cgroup accounting");
        AccountingSlice::new(uid, args.sudo)
            .create_if_needed(cgroup_root)
            .await
            .context("Failed to turn on cgroup accounting")?;
    } else {
        verify_cgroup_accounting(cgroup_root, cfg.general.min_uid).await?;
    }

    if !cfg.general.debug_mode {
        verify_write_permissions(
            cgroup_root,
            cfg.general.min_uid,
            cfg.processes.memsw,
            args.sudo,
        )
        .await?;
    }

    if cfg.processes.pss {
        verify_pss_readable(Path::new("/proc")).await?;
    }
    Ok(())
}

async fn wait_for_termination(shutdown_tx: broadcast::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(error = %err, "Failed to install the SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    let _ = shutdown_tx.send(());
}

fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["arbiterd", "--config", "/etc/arbiter/config.toml"]);
        assert_eq!(args.configs.len(), 1);
        assert!(!args.sudo);
        assert_eq!(args.log_directive(), "warn");
    }

    #[test]
    fn test_args_cascaded_configs_and_flags() {
        let args = Args::parse_from([
            "arbiterd",
            "--config",
            "base.toml",
            "site.toml",
            "--sudo",
            "--account-uid",
            "999",
            "--exit-file",
            "/run/arbiter/exit",
            "--print",
            "--verbose",
        ]);
        assert_eq!(args.configs.len(), 2);
        assert!(args.sudo);
        assert_eq!(args.account_uid, Some(999));
        assert_eq!(args.log_directive(), "debug");
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        let result = Args::try_parse_from([
            "arbiterd",
            "--config",
            "c.toml",
            "--verbose",
            "--quiet",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_prefers_etc_when_present() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "").unwrap();
        let args = Args::parse_from([
            "arbiterd",
            "--config",
            "config.toml",
            "--etc",
            dir.path().to_str().unwrap(),
        ]);
        assert_eq!(
            args.resolve(Path::new("config.toml")),
            dir.path().join("config.toml")
        );
        // absolute paths are untouched
        assert_eq!(
            args.resolve(Path::new("/etc/arbiter/config.toml")),
            PathBuf::from("/etc/arbiter/config.toml")
        );
    }
}
