use std::time::{Duration, Instant};

use crate::classifier::SmokingVerdict;

pub const DEFAULT_STABLE_FRAMES: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// How many consecutive smoking frames make an alert, and how far apart alerts must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityPolicy {
    pub stable_frames: u32,
    pub cooldown: Duration,
}

impl StabilityPolicy {
    /// A zero frame requirement is treated as one.
    pub fn new(stable_frames: u32, cooldown: Duration) -> Self {
        Self {
            stable_frames: stable_frames.max(1),
            cooldown,
        }
    }
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_STABLE_FRAMES, DEFAULT_COOLDOWN)
    }
}

/// Time of the last alert for one camera.
///
/// Measured on the monotonic clock, so wall-clock steps neither extend nor shorten a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CooldownWindow {
    last_alert_at: Option<Instant>,
}

impl CooldownWindow {
    pub fn last_alert_at(&self) -> Option<Instant> {
        self.last_alert_at
    }

    /// Claims the window at `now` when more than `cooldown` has passed since the last claim.
    /// A `now` earlier than the last claim counts as inside the window.
    pub fn try_claim(&mut self, now: Instant, cooldown: Duration) -> bool {
        let open = match self.last_alert_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) > cooldown,
        };
        if open {
            self.last_alert_at = Some(now);
        }
        open
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StabilityState {
    consecutive_positive_frames: u32,
    window: CooldownWindow,
}

impl StabilityState {
    pub fn consecutive_positive_frames(&self) -> u32 {
        self.consecutive_positive_frames
    }

    /// Last alert claimed through this filter's own window.
    pub fn last_alert_at(&self) -> Option<Instant> {
        self.window.last_alert_at()
    }
}

/// Debounces raw per-frame verdicts for one camera session.
///
/// Owned by the session task; it is never shared, so it carries no synchronisation. The
/// streak always starts at zero. The cooldown is either kept locally ([`observe`]) or
/// claimed from a window the caller shares between sessions ([`observe_claiming`]).
///
/// [`observe`]: StabilityFilter::observe
/// [`observe_claiming`]: StabilityFilter::observe_claiming
#[derive(Debug, Clone)]
pub struct StabilityFilter {
    policy: StabilityPolicy,
    state: StabilityState,
}

impl StabilityFilter {
    pub fn new(policy: StabilityPolicy) -> Self {
        Self {
            policy,
            state: StabilityState::default(),
        }
    }

    pub fn policy(&self) -> StabilityPolicy {
        self.policy
    }

    pub fn state(&self) -> StabilityState {
        self.state
    }

    /// Feeds one verdict and returns `true` when an alert should fire for it.
    pub fn observe(&mut self, verdict: &SmokingVerdict, now: Instant) -> bool {
        self.observe_smoking(verdict.is_smoking, now)
    }

    pub fn observe_smoking(&mut self, is_smoking: bool, now: Instant) -> bool {
        let mut window = self.state.window;
        let fired = self.observe_claiming(is_smoking, |cooldown| window.try_claim(now, cooldown));
        self.state.window = window;
        fired
    }

    /// Like [`observe_smoking`](Self::observe_smoking), but once the streak is long enough the
    /// alert is only raised if `claim` grants the cooldown. `claim` receives the policy's
    /// cooldown and must check and take the window in one step.
    pub fn observe_claiming<F>(&mut self, is_smoking: bool, claim: F) -> bool
    where
        F: FnOnce(Duration) -> bool,
    {
        if !is_smoking {
            self.state.consecutive_positive_frames = 0;
            return false;
        }

        self.state.consecutive_positive_frames =
            self.state.consecutive_positive_frames.saturating_add(1);
        if self.state.consecutive_positive_frames < self.policy.stable_frames {
            return false;
        }

        if !claim(self.policy.cooldown) {
            return false;
        }

        self.state.consecutive_positive_frames = 0;
        true
    }
}
