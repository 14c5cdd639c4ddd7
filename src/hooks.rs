//! Composable lifecycle hooks. The host forwards its own before-fork /
//! after-fork extension points here; registration appends, so the
//! supervisor's hooks and any operator-supplied ones all run.

use std::fmt;

type Hook = Box<dyn Fn() + Send + Sync>;

/// Host lifecycle events the supervisor taps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    /// Master side, before a worker is forked.
    BeforeFork,
    /// Worker side, immediately after a new worker starts.
    AfterFork,
}

/// Ordered callback lists per lifecycle event. Callbacks run in
/// registration order; registering never replaces an earlier callback.
#[derive(Default)]
pub struct HookTable {
    before_fork: Vec<Hook>,
    after_fork: Vec<Hook>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event: HookEvent, hook: impl Fn() + Send + Sync + 'static) {
        self.slot(event).push(Box::new(hook));
    }

    pub fn perform(&self, event: HookEvent) {
        let hooks = match event {
            HookEvent::BeforeFork => &self.before_fork,
            HookEvent::AfterFork => &self.after_fork,
        };
        for hook in hooks {
            hook();
        }
    }

    fn slot(&mut self, event: HookEvent) -> &mut Vec<Hook> {
        match event {
            HookEvent::BeforeFork => &mut self.before_fork,
            HookEvent::AfterFork => &mut self.after_fork,
        }
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookTable")
            .field("before_fork", &self.before_fork.len())
            .field("after_fork", &self.after_fork.len())
            .finish()
    }
}
