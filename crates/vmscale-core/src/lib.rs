//! vmscale-core: shared types for the elastic capacity controller.
//!
//! - [`config`]: the `vmscale.toml` document, parsed once and passed by
//!   value into the controller
//! - [`types`]: `ResourceConfig`, the instance lifecycle, ownership tags
//! - [`retry`]: the single retry-until-success primitive used by every
//!   polling and RPC call site

pub mod config;
pub mod retry;
pub mod types;

pub use config::{
    AlarmsConfig, ConfigError, NamesConfig, SandboxConfig, ScaleConfig, ScaleInTrigger,
    ScalingConfig, TagsConfig, TestMode, TimingConfig, parse_duration,
};
pub use retry::{RetryError, RetryPolicy, Retryable, StopFlag, retry_until};
pub use types::*;
