//! vmscale-provider: cloud capacity operations.
//!
//! The controller never talks to a cloud SDK directly. It goes through
//! [`CapacityProvider`], which turns the raw capability traits into
//! idempotent, name-keyed operations that are safe to repeat.
//!
//! # Architecture
//!
//! ```text
//! CapacityProvider
//!   ├── find-or-create by name (security groups, target group, balancer)
//!   ├── membership checks before register / deregister
//!   ├── NotFound on delete/terminate → success
//!   ├── Throttled / Timeout / DependencyViolation → bounded retry
//!   └── CloudHandles
//!       ├── NetworkApi   (default network, security groups, ingress)
//!       ├── ComputeApi   (run, describe, terminate)
//!       ├── BalancerApi  (target groups, balancers, listeners, targets)
//!       └── AlarmApi     (metric alarms)
//! ```
//!
//! [`SandboxCloud`] implements all four traits in memory.

pub mod api;
pub mod capacity;
pub mod error;
pub mod sandbox;

pub use api::{
    AlarmApi, AlarmSpec, BalancerApi, CloudHandles, CloudInstance, CloudInstanceState, Comparison,
    ComputeApi, HTTP_PORT, IngressRule, LaunchRequest, LoadBalancer, Network, NetworkApi,
    ResourceKind, SecurityGroup, Tags, TargetGroup,
};
pub use capacity::CapacityProvider;
pub use error::{ProviderError, ProviderResult};
pub use sandbox::SandboxCloud;
