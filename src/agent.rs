//! The long-running poll loop shared by every role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info};

use crate::clock::Clock;
use crate::error::ExitError;
use crate::lifecycle::{Outcome, RoleAgent};

/// Longest single sleep, so an interrupt is noticed promptly.
const SLICE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    pub poll_interval: Duration,
    pub backoff: Duration,
    /// Run one cycle and return, propagating its error.
    pub once: bool,
}

/// Run `agent` cycle after cycle until `shutdown` is set.
///
/// A failed cycle is logged and followed by the longer backoff sleep; the
/// loop itself only ends on interrupt (or after one cycle with `once`).
pub fn run_loop(
    agent: &mut dyn RoleAgent,
    clock: &dyn Clock,
    options: LoopOptions,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    let role = agent.role();
    info!(%role, "agent started");
    let mut cycles: u64 = 0;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!(%role, cycles, "interrupted; stopping");
            return Err(ExitError::Interrupted.into());
        }
        cycles += 1;
        let pause = match agent.run_cycle() {
            Ok(report) => {
                for recovery in &report.recovered {
                    info!(item = recovery.item, from = %recovery.from, to = %recovery.to, "stale lock recovered");
                }
                for (item, outcome) in report.outcomes.iter().filter(|(_, o)| *o != Outcome::Skipped) {
                    info!(item, %outcome, "item handled");
                }
                if options.once {
                    return Ok(());
                }
                options.poll_interval
            }
            Err(e) if options.once => return Err(e),
            Err(e) => {
                error!(%role, "cycle failed: {e:#}");
                options.backoff
            }
        };
        if !sleep_unless(clock, pause, shutdown) {
            info!(%role, cycles, "interrupted; stopping");
            return Err(ExitError::Interrupted.into());
        }
    }
}

/// Sleep `total` in short slices. Returns false if `shutdown` was raised.
fn sleep_unless(clock: &dyn Clock, total: Duration, shutdown: &AtomicBool) -> bool {
    let mut left = total;
    while !left.is_zero() {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let step = left.min(SLICE);
        clock.sleep(step);
        left -= step;
    }
    !shutdown.load(Ordering::SeqCst)
}
