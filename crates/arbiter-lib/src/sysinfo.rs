//! Machine facts and account lookups
//!
//! Everything here is read once at startup (`SystemSpecs::detect`) or cached
//! aggressively (passwd lookups), since the control loop asks for these
//! values on every tick.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// How long a cached passwd record stays valid.
const PASSWD_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Facts about the machine that never change while the daemon runs.
#[derive(Debug, Clone)]
pub struct SystemSpecs {
    /// Total physical memory in bytes.
    pub total_mem_bytes: u64,
    /// Total swap in bytes.
    pub total_swap_bytes: u64,
    /// Number of logical CPUs.
    pub cpu_count: u32,
    /// Hyperthreads per physical core (1 when hyperthreading is off).
    pub threads_per_core: u32,
    /// Kernel clock ticks per second (USER_HZ).
    pub clockticks_per_sec: u64,
    /// This machine's hostname, fixed at startup.
    pub hostname: String,
}

impl SystemSpecs {
    /// Detect the machine's specs from /proc and libc.
    pub fn detect() -> Result<Self> {
        let meminfo =
            std::fs::read_to_string("/proc/meminfo").context("Failed to read /proc/meminfo")?;
        let cpuinfo =
            std::fs::read_to_string("/proc/cpuinfo").context("Failed to read /proc/cpuinfo")?;

        Ok(Self {
            total_mem_bytes: parse_meminfo_field(&meminfo, "MemTotal")
                .context("/proc/meminfo has no MemTotal")?,
            total_swap_bytes: parse_meminfo_field(&meminfo, "SwapTotal").unwrap_or(0),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            threads_per_core: parse_threads_per_core(&cpuinfo),
            clockticks_per_sec: clockticks_per_sec(),
            hostname: hostname(),
        })
    }

    /// Total memory in bytes expressed as a percent of the machine.
    pub fn bytes_to_pct(&self, bytes: u64) -> f64 {
        bytes as f64 / self.total_mem_bytes as f64 * 100.0
    }

    /// A percent of the machine's memory expressed in bytes.
    pub fn pct_to_bytes(&self, pct: f64) -> u64 {
        (pct / 100.0 * self.total_mem_bytes as f64) as u64
    }

    /// Gigabytes of memory expressed as a percent of the machine.
    pub fn gb_to_pct(&self, gb: f64) -> f64 {
        gb * 1024.0 * 1024.0 * 1024.0 / self.total_mem_bytes as f64 * 100.0
    }
}

/// Parse a `Field:   1234 kB` line out of /proc/meminfo, returning bytes.
pub fn parse_meminfo_field(meminfo: &str, field: &str) -> Option<u64> {
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            let rest = rest.trim_start_matches(':').trim();
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Derive threads-per-core from the `siblings` and `cpu cores` fields of
/// /proc/cpuinfo. Falls back to 1 when either field is missing (e.g. ARM).
pub fn parse_threads_per_core(cpuinfo: &str) -> u32 {
    let mut siblings = None;
    let mut cores = None;
    for line in cpuinfo.lines() {
        if siblings.is_some() && cores.is_some() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim();
            match key.trim() {
                "siblings" => siblings = value.parse::<u32>().ok(),
                "cpu cores" => cores = value.parse::<u32>().ok(),
                _ => {}
            }
        }
    }
    match (siblings, cores) {
        (Some(s), Some(c)) if c > 0 => (s / c).max(1),
        _ => 1,
    }
}

/// Kernel clock ticks per second (USER_HZ), used to convert /proc/<pid>/stat
/// CPU times into seconds.
pub fn clockticks_per_sec() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

/// The machine's hostname. Linux caps hostnames at 64 bytes (man 2
/// gethostname).
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// A passwd record for a uid.
#[derive(Debug, Clone)]
pub struct PasswdEntry {
    pub name: String,
    pub primary_gid: u32,
}

fn passwd_cache() -> &'static Mutex<HashMap<u32, (Instant, Option<PasswdEntry>)>> {
    static CACHE: OnceLock<Mutex<HashMap<u32, (Instant, Option<PasswdEntry>)>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Look up the passwd entry for a uid, with caching. Returns None for uids
/// without an entry (e.g. sessions left behind after LDAP removal).
pub fn passwd_entry(uid: u32) -> Option<PasswdEntry> {
    {
        let cache = passwd_cache().lock().unwrap();
        if let Some((ts, entry)) = cache.get(&uid) {
            if ts.elapsed() < PASSWD_CACHE_TTL {
                return entry.clone();
            }
        }
    }

    let entry = getpwuid(uid);
    passwd_cache()
        .lock()
        .unwrap()
        .insert(uid, (Instant::now(), entry.clone()));
    entry
}

fn getpwuid(uid: u32) -> Option<PasswdEntry> {
    let mut buf = vec![0u8; 4096];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    loop {
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            let len = buf.len() * 2;
            buf.resize(len, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        break;
    }

    let name = unsafe { CStr::from_ptr(pwd.pw_name) }
        .to_string_lossy()
        .into_owned();
    Some(PasswdEntry {
        name,
        primary_gid: pwd.pw_gid,
    })
}

/// All gids the user belongs to, primary group included. Empty when the user
/// has no passwd entry.
pub fn group_gids(uid: u32) -> Vec<u32> {
    let Some(entry) = passwd_entry(uid) else {
        return Vec::new();
    };
    let Ok(cname) = CString::new(entry.name.as_str()) else {
        return vec![entry.primary_gid];
    };

    let mut ngroups: libc::c_int = 32;
    let mut groups = vec![0 as libc::gid_t; ngroups as usize];
    loop {
        let rc = unsafe {
            libc::getgrouplist(
                cname.as_ptr(),
                entry.primary_gid as libc::gid_t,
                groups.as_mut_ptr(),
                &mut ngroups,
            )
        };
        if rc == -1 && (ngroups as usize) > groups.len() {
            groups.resize(ngroups as usize, 0);
            continue;
        }
        groups.truncate(ngroups.max(0) as usize);
        break;
    }
    groups.into_iter().map(|g| g as u32).collect()
}

/// The gid of a named group, or None if the group does not exist.
pub fn gid_of_group(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    let mut buf = vec![0u8; 4096];
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();

    loop {
        let rc = unsafe {
            libc::getgrnam_r(
                cname.as_ptr(),
                &mut grp,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            let len = buf.len() * 2;
            buf.resize(len, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        break;
    }
    Some(grp.gr_gid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo_field() {
        let meminfo = "MemTotal:       8043084 kB\nMemFree:         500000 kB\nSwapTotal:      2097148 kB\n";
        assert_eq!(
            parse_meminfo_field(meminfo, "MemTotal"),
            Some(8043084 * 1024)
        );
        assert_eq!(
            parse_meminfo_field(meminfo, "SwapTotal"),
            Some(2097148 * 1024)
        );
        assert_eq!(parse_meminfo_field(meminfo, "Missing"), None);
    }

    #[test]
    fn test_parse_threads_per_core_hyperthreaded() {
        let cpuinfo = "processor\t: 0\nsiblings\t: 16\ncpu cores\t: 8\n";
        assert_eq!(parse_threads_per_core(cpuinfo), 2);
    }

    #[test]
    fn test_parse_threads_per_core_no_smt() {
        let cpuinfo = "processor\t: 0\nsiblings\t: 8\ncpu cores\t: 8\n";
        assert_eq!(parse_threads_per_core(cpuinfo), 1);
    }

    #[test]
    fn test_parse_threads_per_core_missing_fields() {
        assert_eq!(parse_threads_per_core("processor\t: 0\n"), 1);
    }

    #[test]
    fn test_hostname_nonempty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn test_specs_conversions() {
        let specs = SystemSpecs {
            total_mem_bytes: 8 * 1024 * 1024 * 1024,
            total_swap_bytes: 0,
            cpu_count: 8,
            threads_per_core: 2,
            clockticks_per_sec: 100,
            hostname: "test".to_string(),
        };
        assert_eq!(specs.bytes_to_pct(4 * 1024 * 1024 * 1024), 50.0);
        assert_eq!(specs.pct_to_bytes(50.0), 4 * 1024 * 1024 * 1024);
        assert_eq!(specs.gb_to_pct(4.0), 50.0);
    }
}
