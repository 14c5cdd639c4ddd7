//! TERM remapping for blanket signal delivery.
//!
//! Orchestrators often deliver TERM to the whole process group at once.
//! The host's native reaction is an immediate stop, which truncates
//! in-flight requests. Here the master remaps TERM into the host's
//! graceful QUIT, and workers ignore TERM that they did not send
//! themselves, staying on duty until the master's own drain fan-out.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use signal_hook::consts::{SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use signal_hook::low_level;
use tracing::{info, warn};

use crate::error::WardenError;

/// Set right before a worker sends itself TERM; never cleared, the process
/// is expected to die. Lets the TERM handler tell self-initiated recycling
/// apart from an orchestrator's group-wide delivery.
static SELF_TERMINATION: AtomicBool = AtomicBool::new(false);

/// Pid that installed the handlers. A forked child inherits the parent's
/// statics, so a plain boolean would wrongly skip worker-side installation.
static INSTALLED_BY: AtomicU32 = AtomicU32::new(0);

/// Which side of the prefork split this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TermAction {
    /// Master: re-deliver as the host's graceful-drain signal.
    RemapToQuit,
    /// Worker that asked to die: run the default TERM action.
    DefaultAction,
    /// Worker hit by a group-wide delivery meant for the master: keep
    /// serving until the master's drain broadcast arrives.
    KeepServing,
}

pub(crate) fn term_action(role: Role, self_initiated: bool) -> TermAction {
    match (role, self_initiated) {
        (Role::Master, _) => TermAction::RemapToQuit,
        (Role::Worker, true) => TermAction::DefaultAction,
        (Role::Worker, false) => TermAction::KeepServing,
    }
}

pub fn self_termination_requested() -> bool {
    SELF_TERMINATION.load(Ordering::SeqCst)
}

/// A worker asks itself to die: flag first, then TERM to its own pid.
/// Delivery is best-effort and no cleanup is attempted beyond this; the
/// process is expected to exit shortly after.
pub fn request_self_termination() {
    SELF_TERMINATION.store(true, Ordering::SeqCst);
    if let Err(err) = kill(Pid::this(), Signal::SIGTERM) {
        warn!("Failed to deliver TERM to own pid {}: {}", std::process::id(), err);
    }
}

/// Install the TERM disposition for this process role.
///
/// The registered handler body only marks delivery; logging and signal
/// sending are not safe in that context and run on a dedicated drain
/// thread instead. Registration adds to whatever handler the host already
/// installed rather than replacing it, which is why the fork hooks call
/// this only after the host's own handlers are in place.
///
/// Idempotent per process: hooks fire on every fork, but the pid guard
/// makes repeat calls no-ops while still letting a freshly forked worker
/// (new pid, inherited statics, no inherited threads) install its own.
pub fn install_term_handlers(role: Role) -> Result<(), WardenError> {
    let pid = std::process::id();
    if INSTALLED_BY.swap(pid, Ordering::SeqCst) == pid {
        return Ok(());
    }

    let mut signals =
        Signals::new([SIGTERM]).map_err(|err| WardenError::SignalSetup(err.to_string()))?;

    thread::Builder::new()
        .name("warden-term".into())
        .spawn(move || {
            for _signal in signals.forever() {
                match term_action(role, self_termination_requested()) {
                    TermAction::RemapToQuit => {
                        info!("Master {} received TERM, remapping to QUIT for a graceful drain", pid);
                        if let Err(err) = low_level::raise(SIGQUIT) {
                            warn!("Failed to raise QUIT on master {}: {}", pid, err);
                        }
                    }
                    TermAction::DefaultAction => {
                        info!("Worker {} exiting for self-initiated recycling", pid);
                        let _ = low_level::emulate_default_handler(SIGTERM);
                    }
                    TermAction::KeepServing => {
                        info!("Worker {} ignoring TERM, waiting for the master's QUIT", pid);
                    }
                }
            }
        })
        .map_err(|err| WardenError::SignalSetup(err.to_string()))?;

    Ok(())
}
