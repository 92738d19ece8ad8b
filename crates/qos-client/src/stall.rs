//! Detects callers that do not pump the client often enough.

use std::time::Duration;

use qos_core::Timestamp;
use qos_rpc::ClientModifiers;

/// Which counters a stall is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StallPhase {
    Coordinator,
    Probe,
    /// Stalls are not counted.
    Other,
}

#[derive(Debug, Default)]
pub(crate) struct StallTracker {
    last_update: Option<Timestamp>,
}

impl StallTracker {
    /// Records an update at `now`. A gap of at least `window` since the
    /// previous update is added to the counters of `phase`.
    pub(crate) fn record(
        &mut self,
        now: Timestamp,
        window: Duration,
        phase: StallPhase,
        modifiers: &mut ClientModifiers,
    ) -> Option<Duration> {
        let last = self.last_update.replace(now)?;
        let gap = now.duration_since(last);
        if window.is_zero() || gap < window {
            return None;
        }

        match phase {
            StallPhase::Coordinator => {
                modifiers.stall_count_comm += 1;
                modifiers.stall_duration_comm += gap;
            }
            StallPhase::Probe => {
                modifiers.stall_count_probe += 1;
                modifiers.stall_duration_probe += gap;
            }
            StallPhase::Other => return None,
        }

        Some(gap)
    }
}
