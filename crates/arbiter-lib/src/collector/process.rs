//! Per-process usage from /proc
//!
//! Each read produces an instantaneous [`ProcessInstant`]; the collector
//! pairs two of them to derive a CPU percentage. Reading smaps for PSS is
//! expensive, so it only happens for processes whose shared memory
//! (RssShmem + RssFile) crosses the configured threshold.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::fs;

/// One instantaneous observation of a process.
#[derive(Debug, Clone)]
pub struct ProcessInstant {
    pub pid: u32,
    /// Kernel comm, at most 15 bytes.
    pub name: String,
    /// Effective owner uid.
    pub owner_uid: u32,
    /// Cumulative utime + stime in clock ticks.
    pub cputime_ticks: u64,
    pub mem_bytes: u64,
}

/// Reads process usage out of a /proc tree.
#[derive(Debug, Clone)]
pub struct ProcReader {
    proc_root: PathBuf,
    pss: bool,
    pss_threshold: u64,
    memsw: bool,
}

impl ProcReader {
    pub fn new(proc_root: impl Into<PathBuf>, pss: bool, pss_threshold: u64, memsw: bool) -> Self {
        Self {
            proc_root: proc_root.into(),
            pss,
            pss_threshold,
            memsw,
        }
    }

    /// Read one process. Any error means the process vanished or is
    /// unreadable; the caller drops the datum.
    pub async fn read(&self, pid: u32) -> Result<ProcessInstant> {
        let dir = self.proc_root.join(pid.to_string());

        let comm = fs::read_to_string(dir.join("comm"))
            .await
            .with_context(|| format!("Failed to read comm for pid {}", pid))?;
        let name = truncate_comm(comm.trim());

        let status = fs::read_to_string(dir.join("status"))
            .await
            .with_context(|| format!("Failed to read status for pid {}", pid))?;
        let fields = parse_status(&status);

        let stat = fs::read_to_string(dir.join("stat"))
            .await
            .with_context(|| format!("Failed to read stat for pid {}", pid))?;
        let cputime_ticks =
            parse_stat_cputime(&stat).with_context(|| format!("Malformed stat for pid {}", pid))?;

        let mut mem_bytes = fields.vmrss_bytes;
        if self.memsw {
            mem_bytes += fields.vmswap_bytes;
        }

        // RSS overcounts shared pages once per process. Swap to PSS when the
        // shared portion is large enough to matter.
        if self.pss && fields.shared_bytes() >= self.pss_threshold {
            if let Some(pss) = self.read_pss(pid).await {
                mem_bytes = pss;
            }
        }

        Ok(ProcessInstant {
            pid,
            name,
            owner_uid: fields.owner_uid,
            cputime_ticks,
            mem_bytes,
        })
    }

    /// Sum of Pss (and SwapPss under memsw) from smaps_rollup, falling back
    /// to smaps on kernels without the rollup file. None when unreadable,
    /// in which case the RSS figure stands.
    async fn read_pss(&self, pid: u32) -> Option<u64> {
        let dir = self.proc_root.join(pid.to_string());
        let content = match fs::read_to_string(dir.join("smaps_rollup")).await {
            Ok(content) => content,
            Err(_) => fs::read_to_string(dir.join("smaps")).await.ok()?,
        };
        Some(sum_pss_bytes(&content, self.memsw))
    }
}

/// Fields pulled from /proc/<pid>/status.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusFields {
    pub owner_uid: u32,
    pub vmrss_bytes: u64,
    pub vmswap_bytes: u64,
    pub rss_shmem_bytes: u64,
    pub rss_file_bytes: u64,
}

impl StatusFields {
    /// Shared memory that inflates plain RSS: pure shared plus file-backed.
    pub fn shared_bytes(&self) -> u64 {
        self.rss_shmem_bytes + self.rss_file_bytes
    }
}

/// Parse the interesting lines of /proc/<pid>/status. Missing lines (e.g.
/// VmRSS on kernel threads) read as zero.
pub fn parse_status(content: &str) -> StatusFields {
    let mut fields = StatusFields::default();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            // real, effective, saved, fs
            if let Some(effective) = rest.split_whitespace().nth(1) {
                fields.owner_uid = effective.parse().unwrap_or(0);
            }
        } else if let Some(kb) = parse_kb_line(line, "VmRSS:") {
            fields.vmrss_bytes = kb * 1024;
        } else if let Some(kb) = parse_kb_line(line, "VmSwap:") {
            fields.vmswap_bytes = kb * 1024;
        } else if let Some(kb) = parse_kb_line(line, "RssShmem:") {
            fields.rss_shmem_bytes = kb * 1024;
        } else if let Some(kb) = parse_kb_line(line, "RssFile:") {
            fields.rss_file_bytes = kb * 1024;
        }
    }
    fields
}

fn parse_kb_line(line: &str, prefix: &str) -> Option<u64> {
    line.strip_prefix(prefix)?
        .trim()
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Cumulative CPU time (utime + stime, clock ticks) from /proc/<pid>/stat.
/// The comm field may contain spaces and parentheses, so fields are counted
/// from the last closing paren.
pub fn parse_stat_cputime(content: &str) -> Option<u64> {
    let after_comm = &content[content.rfind(')')? + 1..];
    let mut fields = after_comm.split_whitespace();
    // After the comm, utime and stime are fields 12 and 13 (state is 1).
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

/// Sum `Pss:` lines from smaps or smaps_rollup, in bytes. With swap, the
/// `SwapPss:` lines are added as well.
pub fn sum_pss_bytes(content: &str, include_swap: bool) -> u64 {
    let mut total_kb = 0u64;
    for line in content.lines() {
        if let Some(kb) = parse_kb_line(line, "Pss:") {
            total_kb += kb;
        } else if include_swap {
            if let Some(kb) = parse_kb_line(line, "SwapPss:") {
                total_kb += kb;
            }
        }
    }
    total_kb * 1024
}

/// The kernel caps comm at 15 bytes; mirror that for names read elsewhere.
pub fn truncate_comm(name: &str) -> String {
    name.as_bytes()
        .iter()
        .take(15)
        .map(|&b| b as char)
        .collect()
}
