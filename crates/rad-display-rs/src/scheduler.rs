use crate::navigation::NavigationSink;
use rad_core::NavigationTarget;
use std::time::Duration;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info};

pub const REVERT_DELAY: Duration = Duration::from_secs(30);

/// Outstanding revert. Dropping it cancels the sleeping task.
pub struct RevertTimer {
    pub armed_at: Instant,
    pub deadline: Instant,
    pub target: NavigationTarget,
    generation: u64,
    handle: JoinHandle<()>,
}

impl Drop for RevertTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed {
        armed_at: Instant,
        deadline: Instant,
        target: NavigationTarget,
    },
}

/// Single-slot revert timer for one display.
///
/// The scheduler itself holds no lock; its owner serializes `on_transient`,
/// `fire` and `cancel` under the display's state lock. The sleeping task calls
/// back through `on_fire` with the generation it was armed with, and a stale
/// generation is ignored, so a timer that lost the race to a newer card never
/// reverts the display.
pub struct RevertScheduler {
    delay: Duration,
    slot: Option<RevertTimer>,
    next_generation: u64,
}

impl RevertScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            slot: None,
            next_generation: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        match &self.slot {
            None => SchedulerState::Idle,
            Some(timer) => SchedulerState::Armed {
                armed_at: timer.armed_at,
                deadline: timer.deadline,
                target: timer.target.clone(),
            },
        }
    }

    /// Idle -> Armed and Armed -> Armed: drop any outstanding timer, show the
    /// card, then start a fresh countdown towards `default_target`.
    pub fn on_transient<F>(
        &mut self,
        sink: &dyn NavigationSink,
        transient: &NavigationTarget,
        default_target: NavigationTarget,
        on_fire: F,
    ) where
        F: FnOnce(u64) + Send + 'static,
    {
        let replaced = self.cancel();
        sink.navigate(transient);
        self.arm(default_target, on_fire);
        debug!(
            event = "revert_armed",
            url = %transient.url,
            replaced,
            delay_ms = self.delay.as_millis() as u64
        );
    }

    /// Armed -> Idle. Returns `false` when `generation` no longer owns the
    /// slot.
    pub fn fire(&mut self, generation: u64, sink: &dyn NavigationSink) -> bool {
        let current = self
            .slot
            .as_ref()
            .map(|timer| timer.generation == generation)
            .unwrap_or(false);
        if !current {
            return false;
        }
        if let Some(timer) = self.slot.take() {
            info!(event = "revert_fired", url = %timer.target.url);
            sink.navigate(&timer.target);
        }
        true
    }

    pub fn cancel(&mut self) -> bool {
        self.slot.take().is_some()
    }

    fn arm<F>(&mut self, target: NavigationTarget, on_fire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.next_generation += 1;
        let generation = self.next_generation;
        let armed_at = Instant::now();
        let deadline = armed_at + self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire(generation);
        });
        self.slot = Some(RevertTimer {
            armed_at,
            deadline,
            target,
            generation,
            handle,
        });
    }
}
