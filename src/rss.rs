//! Resident-set-size probe: fast `/proc` path on Linux, portable `ps`
//! fallback everywhere else and on any failure. Never raises past its
//! boundary; callers get a best-effort reading.

use std::process::Command;
use tracing::warn;

#[cfg(target_os = "linux")]
use crate::error::WardenError;

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Current RSS of `pid` in MB. Errors on the fast path are swallowed and
/// masked by the portable probe, which is assumed available on any POSIX
/// system; if even that fails the probe reports 0 rather than erroring.
pub fn rss_mb(pid: u32) -> u64 {
    #[cfg(target_os = "linux")]
    {
        match rss_status(pid) {
            Ok(bytes) => return bytes / BYTES_PER_MB,
            Err(err) => warn!("RSS probe via /proc failed for pid {}: {}, falling back to ps", pid, err),
        }
    }
    rss_ps(pid)
}

/// Read VmRSS out of `/proc/<pid>/status`. Roughly 100x cheaper than
/// forking `ps` and allocation-free apart from the status read.
#[cfg(target_os = "linux")]
fn rss_status(pid: u32) -> Result<u64, WardenError> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status"))?;
    parse_vm_rss(&status)
        .ok_or_else(|| WardenError::Probe(format!("no parsable VmRSS line in /proc/{pid}/status")))
}

/// Parse the `VmRSS: <value> <unit>` record into bytes. The kernel reports
/// kB today, but the unit is normalized through the full 1024-based table.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS"))?;
    let mut fields = line.split_whitespace();
    fields.next(); // label
    let value: u64 = fields.next()?.parse().ok()?;
    let multiplier: u64 = match fields.next()?.to_ascii_lowercase().as_str() {
        "b" => 1,
        "kb" => 1024,
        "mb" => 1024 * 1024,
        "gb" => 1024 * 1024 * 1024,
        "tb" => 1024 * 1024 * 1024 * 1024,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Fork/exec `ps` and parse its output (RSS in KB). Works on any system
/// with a POSIX `ps`; costs a few milliseconds, so callers sample instead
/// of probing every request.
fn rss_ps(pid: u32) -> u64 {
    let output = match Command::new("ps").args(["-o", "rss=", "-p", &pid.to_string()]).output() {
        Ok(output) => output,
        Err(err) => {
            warn!("RSS probe via ps failed for pid {}: {}", pid, err);
            return 0;
        }
    };
    match String::from_utf8_lossy(&output.stdout).trim().parse::<u64>() {
        Ok(kb) => kb / 1024,
        Err(_) => {
            warn!("ps returned no RSS for pid {} (process may have exited)", pid);
            0
        }
    }
}
