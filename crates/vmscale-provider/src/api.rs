//! Cloud capability traits.
//!
//! The control plane is split into four sub-capabilities, each behind its
//! own trait, so a provider can be assembled from separate clients and a
//! test can substitute any of them. Implementations report conflicts
//! (`AlreadyExists`, `NotFound`) as errors; absorbing them is the job of
//! [`CapacityProvider`](crate::CapacityProvider).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderResult;

/// Kinds of resource the controller creates, for errors and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Network,
    SecurityGroup,
    Instance,
    TargetGroup,
    LoadBalancer,
    Listener,
    Alarm,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Network => "network",
            ResourceKind::SecurityGroup => "security group",
            ResourceKind::Instance => "instance",
            ResourceKind::TargetGroup => "target group",
            ResourceKind::LoadBalancer => "load balancer",
            ResourceKind::Listener => "listener",
            ResourceKind::Alarm => "alarm",
        };
        f.write_str(s)
    }
}

/// Ordered `(key, value)` tag pairs.
pub type Tags = [(String, String)];

/// Service HTTP port opened on every security group.
pub const HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: String,
    pub port: u16,
    pub cidr: String,
}

impl IngressRule {
    /// TCP on the HTTP port from anywhere.
    pub fn http_from_anywhere() -> Self {
        Self {
            protocol: "tcp".to_string(),
            port: HTTP_PORT,
            cidr: "0.0.0.0/0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub network_id: String,
    pub ingress: Vec<IngressRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudInstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
}

/// An instance as the provider describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInstance {
    pub id: String,
    pub state: CloudInstanceState,
    pub public_dns: Option<String>,
    pub tags: Vec<(String, String)>,
}

impl CloudInstance {
    /// Running with a public address assigned.
    pub fn is_ready(&self) -> bool {
        self.state == CloudInstanceState::Running && self.public_dns.is_some()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub image: String,
    pub instance_type: String,
    pub security_group_id: String,
    pub tags: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetGroup {
    pub arn: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    pub arn: String,
    pub name: String,
    pub dns_name: String,
    pub security_group_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    GreaterThanOrEqual,
    LessThanOrEqual,
}

/// A CPU alarm attached to the web-service fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmSpec {
    pub name: String,
    pub metric: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub period: Duration,
    pub evaluation_periods: u32,
    /// Fleet the alarm watches (the scaling group name).
    pub dimension: String,
    pub tags: Vec<(String, String)>,
}

#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn default_network(&self) -> ProviderResult<Network>;

    async fn find_security_group(
        &self,
        name: &str,
        network_id: &str,
    ) -> ProviderResult<Option<SecurityGroup>>;

    /// Fails with `AlreadyExists` when the name is taken in the network.
    async fn create_security_group(
        &self,
        name: &str,
        network_id: &str,
        tags: &Tags,
    ) -> ProviderResult<SecurityGroup>;

    /// Fails with `AlreadyExists` when the rule is already present.
    async fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> ProviderResult<()>;

    async fn delete_security_group(&self, group_id: &str) -> ProviderResult<()>;
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn run_instance(&self, request: &LaunchRequest) -> ProviderResult<CloudInstance>;

    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<CloudInstance>;

    /// Terminating an already-terminated instance succeeds.
    async fn terminate_instance(&self, instance_id: &str) -> ProviderResult<()>;
}

#[async_trait]
pub trait BalancerApi: Send + Sync {
    async fn find_target_group(&self, name: &str) -> ProviderResult<Option<TargetGroup>>;

    async fn create_target_group(
        &self,
        name: &str,
        network_id: &str,
        port: u16,
        tags: &Tags,
    ) -> ProviderResult<TargetGroup>;

    async fn find_load_balancer(&self, name: &str) -> ProviderResult<Option<LoadBalancer>>;

    async fn create_load_balancer(
        &self,
        name: &str,
        security_group_ids: &[String],
        tags: &Tags,
    ) -> ProviderResult<LoadBalancer>;

    /// HTTP listener on `port` forwarding to the target group. Returns the
    /// existing listener when one is already attached.
    async fn create_listener(
        &self,
        load_balancer_arn: &str,
        target_group_arn: &str,
        port: u16,
    ) -> ProviderResult<String>;

    async fn register_target(&self, target_group_arn: &str, instance_id: &str)
    -> ProviderResult<()>;

    async fn deregister_target(
        &self,
        target_group_arn: &str,
        instance_id: &str,
    ) -> ProviderResult<()>;

    async fn target_members(&self, target_group_arn: &str) -> ProviderResult<Vec<String>>;

    async fn delete_load_balancer(&self, load_balancer_arn: &str) -> ProviderResult<()>;

    async fn delete_target_group(&self, target_group_arn: &str) -> ProviderResult<()>;
}

#[async_trait]
pub trait AlarmApi: Send + Sync {
    /// Create or replace an alarm by name.
    async fn put_alarm(&self, spec: &AlarmSpec) -> ProviderResult<()>;

    async fn delete_alarms(&self, names: &[String]) -> ProviderResult<()>;
}

/// The four sub-capabilities, composed.
#[derive(Clone)]
pub struct CloudHandles {
    pub network: Arc<dyn NetworkApi>,
    pub compute: Arc<dyn ComputeApi>,
    pub balancer: Arc<dyn BalancerApi>,
    pub alarms: Arc<dyn AlarmApi>,
}

impl CloudHandles {
    /// Use one value for every capability.
    pub fn from_provider<P>(provider: Arc<P>) -> Self
    where
        P: NetworkApi + ComputeApi + BalancerApi + AlarmApi + 'static,
    {
        Self {
            network: provider.clone(),
            compute: provider.clone(),
            balancer: provider.clone(),
            alarms: provider,
        }
    }
}

impl fmt::Debug for CloudHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudHandles").finish_non_exhaustive()
    }
}
