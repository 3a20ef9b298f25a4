//! Timed well cycling.
//!
//! Visits a fixed list of well positions in order, one move per interval,
//! wrapping around at the end. Each move is awaited until the stage reports
//! completion before the next tick is taken, so two moves are never in flight
//! at once. A tick that is missed because a move ran long is delayed rather
//! than fired in a burst.

use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::config::CycleConfig;
use crate::error::StageResult;
use crate::protocol::Position;
use crate::session::Session;
use crate::TRACE_TARGET;

/// Wells to visit and how often.
#[derive(Debug, Clone, PartialEq)]
pub struct WellPlan {
    /// Positions in µm, visited in order and repeated
    pub wells: Vec<Position>,
    /// Time between the start of consecutive moves
    pub interval: Duration,
    /// Wait before the first move
    pub settle: Duration,
    /// Stop after this many moves; run until shutdown when `None`
    pub count: Option<usize>,
}

impl WellPlan {
    /// Plan with no settle delay and no move limit.
    pub fn new(wells: Vec<Position>, interval: Duration) -> Self {
        Self {
            wells,
            interval,
            settle: Duration::ZERO,
            count: None,
        }
    }
}

impl From<&CycleConfig> for WellPlan {
    fn from(config: &CycleConfig) -> Self {
        Self {
            wells: config.positions(),
            interval: Duration::from_secs(config.interval_secs),
            settle: Duration::from_secs(config.settle_secs),
            count: config.count,
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CycleReport {
    /// Completed moves
    pub moves: usize,
    /// Target of the last completed move
    pub last: Option<Position>,
}

/// Cycle through `plan` until its move count is reached or `shutdown`
/// resolves.
///
/// Shutdown is checked between moves; a move already sent is always allowed to
/// finish.
///
/// # Errors
/// Stops at the first failed move and returns its error.
pub async fn run<F>(session: &Session, plan: &WellPlan, shutdown: F) -> StageResult<CycleReport>
where
    F: Future<Output = ()>,
{
    let mut report = CycleReport::default();
    if plan.wells.is_empty() || plan.count == Some(0) {
        return Ok(report);
    }

    tokio::pin!(shutdown);

    if !plan.settle.is_zero() {
        info!(target: TRACE_TARGET, "Waiting {:?} before the first move", plan.settle);
        tokio::select! {
            _ = &mut shutdown => return Ok(report),
            _ = tokio::time::sleep(plan.settle) => {}
        }
    }

    let mut ticker = tokio::time::interval(plan.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for (index, well) in plan.wells.iter().copied().enumerate().cycle() {
        if plan.count.is_some_and(|limit| report.moves >= limit) {
            break;
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!(target: TRACE_TARGET, "Stopping well cycle after {} moves", report.moves);
                break;
            }
            _ = ticker.tick() => {}
        }

        info!(target: TRACE_TARGET, "Well {}/{}: {}", index + 1, plan.wells.len(), well);
        session.move_to(well).await?;
        report.moves += 1;
        report.last = Some(well);
    }

    Ok(report)
}
