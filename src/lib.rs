//! Worker lifecycle supervision for prefork request-serving hosts.
//!
//! A long-running worker process accumulates leaked and fragmented memory,
//! and an automatic memory reclaimer pauses it at unpredictable points
//! mid-request. This crate wraps every request a worker serves and decides
//! when the worker should retire itself (too many requests, too much RSS)
//! and when a collection pass should run (between requests, on a cadence of
//! cumulative in-request time). It also remaps a blanket TERM delivered to
//! the whole process group into the host's graceful QUIT so in-flight
//! requests finish.
//!
//! The host keeps its own forking, accept loop and request dispatch; it
//! feeds this crate three things: request execution (through
//! [`Warden::wrap_request`]), its fork extension points (through
//! [`Warden::perform_hook`]), and optionally a metrics sink and a
//! [`Collector`] binding.
//!
//! ```rust,ignore
//! let warden = Warden::new(Config::default(), Some(statsd), Some(runtime_gc))?;
//! // in the host's fork callbacks:
//! warden.perform_hook(HookEvent::BeforeFork);  // master side
//! warden.perform_hook(HookEvent::AfterFork);   // worker side
//! // around every request:
//! let response = warden.wrap_request(|| handle(request));
//! ```

mod config;
mod counters;
mod error;
mod gc;
mod hooks;
mod metrics;
mod policy;
mod rss;

#[cfg(unix)]
mod signals;

pub use config::{Config, MemoryLimit};
pub use counters::RequestCounters;
pub use error::WardenError;
pub use gc::{Collector, OutOfBandGc};
pub use hooks::{HookEvent, HookTable};
pub use metrics::MetricsSink;
pub use policy::{KillReason, MemoryPolicy, RequestCountPolicy, RequestHandler, Terminator};

#[cfg(unix)]
pub use signals::{
    install_term_handlers, request_self_termination, self_termination_requested, Role,
};

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::policy::SelfTerminator;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The per-worker supervisor: accounting, the policy pipeline and the fork
/// hook table. One `Warden` per worker process, matching the
/// one-worker-per-OS-process execution model of a prefork host.
pub struct Warden {
    counters: RequestCounters,
    handlers: Vec<Box<dyn RequestHandler>>,
    hooks: HookTable,
}

impl Warden {
    /// Build the supervisor from a validated config. Fails fast on
    /// misconfiguration so nothing is caught mid-traffic.
    ///
    /// `metrics` is optional; without it all metric emission is skipped
    /// silently. `collector` is required only when
    /// `gc_after_request_time` is enabled.
    pub fn new(
        config: Config,
        metrics: Option<Arc<dyn MetricsSink>>,
        collector: Option<Arc<dyn Collector>>,
    ) -> Result<Self, WardenError> {
        config.validate()?;

        if metrics.is_some() {
            info!("Reporting metrics under the warden namespace");
        }

        let terminator: Arc<dyn Terminator> = Arc::new(SelfTerminator::new(metrics.clone()));

        let mut handlers: Vec<Box<dyn RequestHandler>> = Vec::new();
        if let Some(max_requests) = config.kill_after_requests {
            handlers.push(Box::new(RequestCountPolicy::new(
                max_requests,
                terminator.clone(),
            )));
        }
        if let Some(limit) = &config.kill_on_too_much_memory {
            handlers.push(Box::new(MemoryPolicy::new(
                limit,
                terminator.clone(),
                metrics.clone(),
            )));
        }
        match (config.gc_after_request_time, collector) {
            (Some(threshold), Some(collector)) if !threshold.is_zero() => {
                handlers.push(Box::new(OutOfBandGc::new(collector, threshold, metrics)));
            }
            (Some(threshold), None) if !threshold.is_zero() => {
                return Err(WardenError::Config(
                    "gc_after_request_time is enabled but no collector was supplied".into(),
                ));
            }
            _ => {}
        }

        let mut hooks = HookTable::new();
        if config.map_term_to_quit {
            #[cfg(unix)]
            {
                hooks.register(HookEvent::BeforeFork, || {
                    if let Err(err) = signals::install_term_handlers(signals::Role::Master) {
                        tracing::warn!("TERM remapping not installed on master: {}", err);
                    }
                });
                hooks.register(HookEvent::AfterFork, || {
                    if let Err(err) = signals::install_term_handlers(signals::Role::Worker) {
                        tracing::warn!("TERM remapping not installed on worker: {}", err);
                    }
                });
            }
            #[cfg(not(unix))]
            return Err(WardenError::Config(
                "map_term_to_quit requires a Unix host".into(),
            ));
        }

        Ok(Self {
            counters: RequestCounters::new(),
            handlers,
            hooks,
        })
    }

    /// Append a custom policy to the pipeline; it runs after the built-in
    /// ones, in registration order, with the same counters.
    pub fn register_handler(&mut self, handler: Box<dyn RequestHandler>) {
        self.handlers.push(handler);
    }

    /// Append a callback to a fork lifecycle event. The supervisor's own
    /// hooks were registered first, so both run.
    pub fn register_hook(&mut self, event: HookEvent, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.register(event, hook);
    }

    /// The host forwards its fork extension points here.
    pub fn perform_hook(&self, event: HookEvent) {
        self.hooks.perform(event);
    }

    pub fn counters(&self) -> &RequestCounters {
        &self.counters
    }

    /// Wrap one request execution. The request's outcome propagates
    /// unchanged; accounting and the policy pipeline run afterwards on
    /// every exit path, including a panicking request, so the policies
    /// stay accurate.
    pub fn wrap_request<R>(&self, request: impl FnOnce() -> R) -> R {
        let _accounting = AccountingGuard {
            warden: self,
            started: Instant::now(),
        };
        request()
    }
}

/// Runs on drop, which is what makes `wrap_request` a `finally`: the
/// counters are bumped and the pipeline sees the post-increment snapshot
/// whether the request returned or unwound.
struct AccountingGuard<'a> {
    warden: &'a Warden,
    started: Instant,
}

impl Drop for AccountingGuard<'_> {
    fn drop(&mut self) {
        let (requests, request_time) = self.warden.counters.record(self.started.elapsed());
        for handler in &self.warden.handlers {
            handler.after_request(requests, request_time);
        }
    }
}
