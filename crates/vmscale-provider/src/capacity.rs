//! Idempotent lifecycle operations over the capability traits.
//!
//! Every operation here can be repeated after a crash or a partial
//! failure without duplicating resources: lookups by name come before
//! creation, `AlreadyExists` falls back to the lookup, and `NotFound`
//! during cleanup counts as done. Transient provider errors are retried
//! with a bounded policy; every call carries the provider timeout.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use vmscale_core::{RetryError, RetryPolicy, Retryable, retry_until};

use crate::api::{
    AlarmSpec, CloudHandles, CloudInstance, CloudInstanceState, HTTP_PORT, IngressRule,
    LaunchRequest, LoadBalancer, Network, ResourceKind, SecurityGroup, Tags, TargetGroup,
};
use crate::error::{ProviderError, ProviderResult};

#[derive(Debug, Clone)]
pub struct CapacityProvider {
    cloud: CloudHandles,
    /// Upper bound for a single call and for each wait.
    timeout: Duration,
    /// Interval between describe calls while waiting on a state change.
    poll_interval: Duration,
    /// Applied to transient errors (throttling, timeouts, dependency
    /// violations).
    retry: RetryPolicy,
}

impl CapacityProvider {
    pub fn new(cloud: CloudHandles, timeout: Duration) -> Self {
        Self {
            cloud,
            timeout,
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::bounded(Duration::from_secs(1), 30),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cloud(&self) -> &CloudHandles {
        &self.cloud
    }

    // ── Network ──────────────────────────────────────────────────

    pub async fn default_network(&self) -> ProviderResult<Network> {
        let network = self
            .call("default_network", || self.cloud.network.default_network())
            .await?;
        debug!(network = %network.id, "using default network");
        Ok(network)
    }

    /// Look up `name` in the network, creating it if absent. Returns the
    /// same group on every call. Ingress is left as found.
    pub async fn ensure_security_group(
        &self,
        name: &str,
        network_id: &str,
        tags: &Tags,
    ) -> ProviderResult<SecurityGroup> {
        let (group, created) = self
            .find_or_create(
                ResourceKind::SecurityGroup,
                name,
                async || {
                    self.call("find_security_group", || {
                        self.cloud.network.find_security_group(name, network_id)
                    })
                    .await
                },
                async || {
                    self.call("create_security_group", || {
                        self.cloud
                            .network
                            .create_security_group(name, network_id, tags)
                    })
                    .await
                },
            )
            .await?;

        if created {
            info!(name, id = %group.id, network = network_id, "created security group");
        } else {
            debug!(name, id = %group.id, "reusing security group");
        }
        Ok(group)
    }

    /// Make sure `group` admits HTTP from anywhere.
    pub async fn allow_http_ingress(&self, group: &SecurityGroup) -> ProviderResult<()> {
        let rule = IngressRule::http_from_anywhere();
        if group.ingress.contains(&rule) {
            return Ok(());
        }
        match self
            .call("authorize_ingress", || {
                self.cloud.network.authorize_ingress(&group.id, &rule)
            })
            .await
        {
            Ok(()) => {
                debug!(id = %group.id, port = rule.port, "authorized http ingress");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_security_group(&self, group_id: &str) -> ProviderResult<()> {
        self.delete(ResourceKind::SecurityGroup, group_id, "delete_security_group", || {
            self.cloud.network.delete_security_group(group_id)
        })
        .await
    }

    // ── Compute ──────────────────────────────────────────────────

    /// Issue a single launch. Never retried: a launch that timed out may
    /// still have happened.
    pub async fn request_instance(&self, request: &LaunchRequest) -> ProviderResult<CloudInstance> {
        let instance = self
            .timed("run_instance", self.cloud.compute.run_instance(request))
            .await?;
        info!(
            instance = %instance.id,
            image = %request.image,
            instance_type = %request.instance_type,
            "instance requested"
        );
        Ok(instance)
    }

    /// Block until the provider reports the instance Running with a
    /// public address. Reachability of the service is not checked.
    pub async fn wait_until_running(&self, instance_id: &str) -> ProviderResult<CloudInstance> {
        let wait = async {
            loop {
                match self.cloud.compute.describe_instance(instance_id).await {
                    Ok(instance) if instance.is_ready() => return Ok(instance),
                    Ok(instance)
                        if matches!(
                            instance.state,
                            CloudInstanceState::ShuttingDown | CloudInstanceState::Terminated
                        ) =>
                    {
                        return Err(ProviderError::Rejected {
                            operation: "wait_until_running".to_string(),
                            reason: format!("instance {instance_id} is {:?}", instance.state),
                        });
                    }
                    Ok(instance) => {
                        debug!(instance = instance_id, state = ?instance.state, "waiting for instance");
                    }
                    // A fresh id may not be visible yet.
                    Err(e) if e.is_not_found() || e.is_retryable() => {
                        debug!(instance = instance_id, error = %e, "describe failed, will retry");
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        let instance = self.timed("wait_until_running", wait).await?;
        info!(
            instance = instance_id,
            dns = instance.public_dns.as_deref().unwrap_or_default(),
            "instance running"
        );
        Ok(instance)
    }

    /// Launch one instance and wait for it to be Running.
    pub async fn launch_instance(&self, request: &LaunchRequest) -> ProviderResult<CloudInstance> {
        let requested = self.request_instance(request).await?;
        self.wait_until_running(&requested.id).await
    }

    /// Terminate unless already terminated or gone.
    pub async fn terminate_instance(&self, instance_id: &str) -> ProviderResult<()> {
        match self
            .call("describe_instance", || {
                self.cloud.compute.describe_instance(instance_id)
            })
            .await
        {
            Ok(instance) if instance.state == CloudInstanceState::Terminated => {
                debug!(instance = instance_id, "instance already terminated");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(instance = instance_id, "instance already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match self
            .call("terminate_instance", || {
                self.cloud.compute.terminate_instance(instance_id)
            })
            .await
        {
            Ok(()) => {
                info!(instance = instance_id, "terminating instance");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Block until the instance is Terminated (or no longer known).
    pub async fn await_terminated(&self, instance_id: &str) -> ProviderResult<()> {
        let wait = async {
            loop {
                match self.cloud.compute.describe_instance(instance_id).await {
                    Ok(instance) if instance.state == CloudInstanceState::Terminated => {
                        return Ok(());
                    }
                    Err(e) if e.is_not_found() => return Ok(()),
                    Ok(instance) => {
                        debug!(instance = instance_id, state = ?instance.state, "waiting for termination");
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(instance = instance_id, error = %e, "describe failed, will retry");
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        self.timed("await_terminated", wait).await
    }

    // ── Load balancing ───────────────────────────────────────────

    pub async fn ensure_target_group(
        &self,
        name: &str,
        network_id: &str,
        tags: &Tags,
    ) -> ProviderResult<TargetGroup> {
        let (group, created) = self
            .find_or_create(
                ResourceKind::TargetGroup,
                name,
                async || {
                    self.call("find_target_group", || {
                        self.cloud.balancer.find_target_group(name)
                    })
                    .await
                },
                async || {
                    self.call("create_target_group", || {
                        self.cloud
                            .balancer
                            .create_target_group(name, network_id, HTTP_PORT, tags)
                    })
                    .await
                },
            )
            .await?;
        if created {
            info!(name, arn = %group.arn, "created target group");
        }
        Ok(group)
    }

    pub async fn ensure_load_balancer(
        &self,
        name: &str,
        security_group_ids: &[String],
        tags: &Tags,
    ) -> ProviderResult<LoadBalancer> {
        let (balancer, created) = self
            .find_or_create(
                ResourceKind::LoadBalancer,
                name,
                async || {
                    self.call("find_load_balancer", || {
                        self.cloud.balancer.find_load_balancer(name)
                    })
                    .await
                },
                async || {
                    self.call("create_load_balancer", || {
                        self.cloud
                            .balancer
                            .create_load_balancer(name, security_group_ids, tags)
                    })
                    .await
                },
            )
            .await?;
        if created {
            info!(name, arn = %balancer.arn, dns = %balancer.dns_name, "created load balancer");
        }
        Ok(balancer)
    }

    /// Attach an HTTP listener on `load_balancer_arn` that forwards to
    /// `target_group_arn`. Returns the listener id.
    pub async fn attach_listener(
        &self,
        load_balancer_arn: &str,
        target_group_arn: &str,
    ) -> ProviderResult<String> {
        let listener = self
            .call("create_listener", || {
                self.cloud
                    .balancer
                    .create_listener(load_balancer_arn, target_group_arn, HTTP_PORT)
            })
            .await?;
        debug!(listener = %listener, target_group = target_group_arn, "listener attached");
        Ok(listener)
    }

    /// Register unless already a member.
    pub async fn register_with_balancer(
        &self,
        target_group_arn: &str,
        instance_id: &str,
    ) -> ProviderResult<()> {
        let members = self
            .call("target_members", || {
                self.cloud.balancer.target_members(target_group_arn)
            })
            .await?;
        if members.iter().any(|m| m == instance_id) {
            debug!(instance = instance_id, "already registered");
            return Ok(());
        }

        self.call("register_target", || {
            self.cloud.balancer.register_target(target_group_arn, instance_id)
        })
        .await?;
        info!(instance = instance_id, target_group = target_group_arn, "registered with balancer");
        Ok(())
    }

    /// Deregister if currently a member. A missing target group means
    /// there is nothing to leave.
    pub async fn deregister_from_balancer(
        &self,
        target_group_arn: &str,
        instance_id: &str,
    ) -> ProviderResult<()> {
        let members = match self
            .call("target_members", || {
                self.cloud.balancer.target_members(target_group_arn)
            })
            .await
        {
            Ok(members) => members,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !members.iter().any(|m| m == instance_id) {
            debug!(instance = instance_id, "not a member, nothing to deregister");
            return Ok(());
        }

        match self
            .call("deregister_target", || {
                self.cloud
                    .balancer
                    .deregister_target(target_group_arn, instance_id)
            })
            .await
        {
            Ok(()) => {
                info!(instance = instance_id, target_group = target_group_arn, "deregistered from balancer");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_load_balancer(&self, load_balancer_arn: &str) -> ProviderResult<()> {
        self.delete(
            ResourceKind::LoadBalancer,
            load_balancer_arn,
            "delete_load_balancer",
            || self.cloud.balancer.delete_load_balancer(load_balancer_arn),
        )
        .await
    }

    pub async fn delete_target_group(&self, target_group_arn: &str) -> ProviderResult<()> {
        self.delete(
            ResourceKind::TargetGroup,
            target_group_arn,
            "delete_target_group",
            || self.cloud.balancer.delete_target_group(target_group_arn),
        )
        .await
    }

    // ── Alarms ───────────────────────────────────────────────────

    /// Create or replace each alarm. Returns the names now in place.
    pub async fn ensure_alarms(&self, specs: &[AlarmSpec]) -> ProviderResult<Vec<String>> {
        let mut names = Vec::with_capacity(specs.len());
        for spec in specs {
            self.call("put_alarm", || self.cloud.alarms.put_alarm(spec))
                .await?;
            info!(alarm = %spec.name, threshold = spec.threshold, "alarm in place");
            names.push(spec.name.clone());
        }
        Ok(names)
    }

    pub async fn delete_alarms(&self, names: &[String]) -> ProviderResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        match self
            .call("delete_alarms", || self.cloud.alarms.delete_alarms(names))
            .await
        {
            Ok(()) => {
                info!(alarms = ?names, "deleted alarms");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────

    async fn timed<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = ProviderResult<T>>,
    ) -> ProviderResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                operation: operation.to_string(),
                after: self.timeout,
            }),
        }
    }

    /// One provider call with timeout and transient-error retry.
    async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        retry_until(
            &self.retry,
            async || self.timed(operation, f()).await,
            async || false,
        )
        .await
        .map_err(|e| match e {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { attempts, last } => {
                warn!(operation, attempts, error = %last, "provider call kept failing");
                last
            }
            RetryError::Stopped => ProviderError::Rejected {
                operation: operation.to_string(),
                reason: "stopped".to_string(),
            },
        })
    }

    /// Look up first; create when absent; on a creation race, look up
    /// again. The flag is true when this call created the resource.
    async fn find_or_create<T, Find, Create>(
        &self,
        kind: ResourceKind,
        name: &str,
        mut find: Find,
        mut create: Create,
    ) -> ProviderResult<(T, bool)>
    where
        Find: AsyncFnMut() -> ProviderResult<Option<T>>,
        Create: AsyncFnMut() -> ProviderResult<T>,
    {
        if let Some(found) = find().await? {
            return Ok((found, false));
        }
        match create().await {
            Ok(created) => Ok((created, true)),
            Err(e) if e.is_already_exists() => {
                debug!(%kind, name, "lost creation race, looking up again");
                find().await?.map(|found| (found, false)).ok_or_else(|| {
                    ProviderError::NotFound {
                        kind,
                        id: name.to_string(),
                    }
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Delete, treating "already absent" as success.
    async fn delete<F, Fut>(
        &self,
        kind: ResourceKind,
        id: &str,
        operation: &str,
        f: F,
    ) -> ProviderResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<()>>,
    {
        match self.call(operation, f).await {
            Ok(()) => {
                info!(%kind, id, "deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(%kind, id, "already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
