//! vmscale-autoscale: scaling decisions for the web-service fleet.
//!
//! [`decide`] is a pure function over the latest throughput sample, the
//! live fleet size and explicit timing state. [`Autoscaler`] wraps it with
//! the state bookkeeping the controller needs between polls.
//!
//! # Scaling Algorithm
//!
//! ```text
//! target = scaling.rps_target
//!
//! out streak += 1 if rps < target, else 0
//! in  streak += 1 if trigger = headroom(r) and rps >= target * r, else 0
//!
//! if out streak >= out periods and count < max and out cooldown elapsed:
//!     ScaleOut(min(scale_out_step, max - count))
//!
//! elif in streak >= in periods and count > min and in cooldown elapsed:
//!     ScaleIn(min(scale_in_step, count - min))
//!
//! else:
//!     NoAction
//! ```
//!
//! Cooldowns are tracked per direction. A scale-out never delays a
//! scale-in and vice versa.

pub mod policy;
pub mod scaler;

pub use policy::{
    CooldownState, PolicyState, ScaleAction, ScaleDirection, ScalingDecision, ScalingPolicy,
    TestMetricSample, decide,
};
pub use scaler::Autoscaler;
