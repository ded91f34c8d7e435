//! Pure scaling policy.

use std::time::Duration;

use tokio::time::Instant;

use vmscale_core::{ScaleConfig, ScaleInTrigger};

/// Policy parameters, fixed for the duration of a test.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    /// Throughput at or above which capacity is sufficient.
    pub rps_target: f64,
    pub min_size: u32,
    pub max_size: u32,
    pub scale_out_step: u32,
    pub scale_in_step: u32,
    pub scale_out_cooldown: Duration,
    pub scale_in_cooldown: Duration,
    pub scale_out_evaluation_periods: u32,
    pub scale_in_evaluation_periods: u32,
    pub scale_in_trigger: ScaleInTrigger,
}

impl ScalingPolicy {
    pub fn from_config(config: &ScaleConfig) -> Self {
        let s = &config.scaling;
        Self {
            rps_target: s.rps_target,
            min_size: s.min_size,
            max_size: s.max_size,
            scale_out_step: s.scale_out_step,
            scale_in_step: s.scale_in_step,
            scale_out_cooldown: s.scale_out_cooldown(),
            scale_in_cooldown: s.scale_in_cooldown(),
            scale_out_evaluation_periods: s.scale_out_evaluation_periods,
            scale_in_evaluation_periods: s.scale_in_evaluation_periods,
            scale_in_trigger: config.effective_scale_in_trigger(),
        }
    }

    fn cooldown(&self, direction: ScaleDirection) -> Duration {
        match direction {
            ScaleDirection::Out => self.scale_out_cooldown,
            ScaleDirection::In => self.scale_in_cooldown,
        }
    }

    fn wants_out(&self, rps: f64) -> bool {
        rps < self.rps_target
    }

    fn wants_in(&self, rps: f64) -> bool {
        match self.scale_in_trigger {
            ScaleInTrigger::Disabled => false,
            ScaleInTrigger::Headroom { ratio } => rps >= self.rps_target * ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScaleDirection {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    NoAction,
    ScaleOut(u32),
    ScaleIn(u32),
}

impl ScaleAction {
    pub fn direction(self) -> Option<ScaleDirection> {
        match self {
            ScaleAction::NoAction => None,
            ScaleAction::ScaleOut(_) => Some(ScaleDirection::Out),
            ScaleAction::ScaleIn(_) => Some(ScaleDirection::In),
        }
    }
}

/// A decision and the moment it was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingDecision {
    pub action: ScaleAction,
    pub at: Instant,
}

/// Last action time per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CooldownState {
    pub last_scale_out: Option<Instant>,
    pub last_scale_in: Option<Instant>,
}

impl CooldownState {
    pub fn last(&self, direction: ScaleDirection) -> Option<Instant> {
        match direction {
            ScaleDirection::Out => self.last_scale_out,
            ScaleDirection::In => self.last_scale_in,
        }
    }

    /// Never moves a timestamp backwards.
    pub fn record(&mut self, direction: ScaleDirection, at: Instant) {
        let slot = match direction {
            ScaleDirection::Out => &mut self.last_scale_out,
            ScaleDirection::In => &mut self.last_scale_in,
        };
        *slot = Some(slot.map_or(at, |prev| prev.max(at)));
    }

    pub fn elapsed(&self, direction: ScaleDirection, cooldown: Duration, now: Instant) -> bool {
        self.last(direction)
            .is_none_or(|last| now.saturating_duration_since(last) >= cooldown)
    }

    /// Time since the most recent action of either direction.
    pub fn since_last_change(&self, now: Instant) -> Option<Duration> {
        self.last_scale_out
            .into_iter()
            .chain(self.last_scale_in)
            .max()
            .map(|last| now.saturating_duration_since(last))
    }
}

/// Everything `decide` needs to remember between samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyState {
    pub cooldown: CooldownState,
    /// Consecutive samples below target.
    pub scale_out_streak: u32,
    /// Consecutive samples satisfying the scale-in trigger.
    pub scale_in_streak: u32,
}

/// One poll's reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestMetricSample {
    pub rps: f64,
    pub since_last_change: Option<Duration>,
    pub finished: bool,
}

impl TestMetricSample {
    pub fn new(rps: f64, finished: bool, cooldown: &CooldownState, now: Instant) -> Self {
        Self {
            rps,
            since_last_change: cooldown.since_last_change(now),
            finished,
        }
    }
}

/// Map one sample to an action.
///
/// Streaks are updated for every sample. An action resets its own
/// direction's streak and stamps its cooldown at `now`; the caller may
/// later push the stamp forward to the action's completion time.
pub fn decide(
    rps: f64,
    instance_count: u32,
    state: &PolicyState,
    policy: &ScalingPolicy,
    now: Instant,
) -> (ScalingDecision, PolicyState) {
    let mut next = *state;
    next.scale_out_streak = if policy.wants_out(rps) {
        state.scale_out_streak.saturating_add(1)
    } else {
        0
    };
    next.scale_in_streak = if policy.wants_in(rps) {
        state.scale_in_streak.saturating_add(1)
    } else {
        0
    };

    let mut action = ScaleAction::NoAction;

    if next.scale_out_streak >= policy.scale_out_evaluation_periods
        && instance_count < policy.max_size
        && next
            .cooldown
            .elapsed(ScaleDirection::Out, policy.cooldown(ScaleDirection::Out), now)
    {
        let n = policy.scale_out_step.min(policy.max_size - instance_count);
        if n > 0 {
            action = ScaleAction::ScaleOut(n);
        }
    } else if next.scale_in_streak >= policy.scale_in_evaluation_periods
        && instance_count > policy.min_size
        && next
            .cooldown
            .elapsed(ScaleDirection::In, policy.cooldown(ScaleDirection::In), now)
    {
        let n = policy.scale_in_step.min(instance_count - policy.min_size);
        if n > 0 {
            action = ScaleAction::ScaleIn(n);
        }
    }

    match action.direction() {
        Some(ScaleDirection::Out) => {
            next.scale_out_streak = 0;
            next.cooldown.record(ScaleDirection::Out, now);
        }
        Some(ScaleDirection::In) => {
            next.scale_in_streak = 0;
            next.cooldown.record(ScaleDirection::In, now);
        }
        None => {}
    }

    (ScalingDecision { action, at: now }, next)
}
