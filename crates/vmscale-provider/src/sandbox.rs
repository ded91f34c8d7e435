//! In-memory cloud.
//!
//! Implements every capability trait over one mutex-guarded state. It
//! behaves like the real control plane where the controller cares:
//! duplicate names are rejected, in-use resources refuse deletion,
//! instances pass through Pending and ShuttingDown, and terminated
//! instances stay describable. Every call is recorded, failures can be
//! queued per operation, and instances can be terminated behind the
//! controller's back.
//!
//! Instance addresses come from the `[sandbox]` address plan so the load
//! generator and web services can be real local processes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use vmscale_core::{LOAD_GENERATOR_NAME, SandboxConfig};

use crate::api::{
    AlarmApi, AlarmSpec, BalancerApi, CloudInstance, CloudInstanceState, ComputeApi, IngressRule,
    LaunchRequest, LoadBalancer, Network, NetworkApi, ResourceKind, SecurityGroup, Tags,
    TargetGroup,
};
use crate::error::{ProviderError, ProviderResult};

const SANDBOX_NETWORK: &str = "vpc-sandbox";

struct SandboxInstance {
    instance: CloudInstance,
    security_group_id: String,
    address: String,
    /// Describe calls left before a Pending instance turns Running.
    polls_left: u32,
}

struct SandboxTargetGroup {
    group: TargetGroup,
    members: BTreeSet<String>,
}

struct Listener {
    load_balancer_arn: String,
    target_group_arn: String,
    port: u16,
}

#[derive(Default)]
struct SandboxState {
    next_id: u64,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<ProviderError>>,
    tags: BTreeMap<String, Vec<(String, String)>>,
    security_groups: BTreeMap<String, SecurityGroup>,
    instances: BTreeMap<String, SandboxInstance>,
    target_groups: BTreeMap<String, SandboxTargetGroup>,
    load_balancers: BTreeMap<String, LoadBalancer>,
    listeners: BTreeMap<String, Listener>,
    alarms: BTreeMap<String, AlarmSpec>,
    web_service_addresses: VecDeque<String>,
}

impl SandboxState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn drop_membership(&mut self, instance_id: &str) {
        for tg in self.target_groups.values_mut() {
            tg.members.remove(instance_id);
        }
    }
}

pub struct SandboxCloud {
    state: Mutex<SandboxState>,
    load_generator_address: Option<String>,
    load_balancer_address: Option<String>,
    pending_polls: u32,
}

impl SandboxCloud {
    pub fn new(plan: &SandboxConfig) -> Self {
        let state = SandboxState {
            web_service_addresses: plan.web_services.iter().cloned().collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            load_generator_address: plan.load_generator.clone(),
            load_balancer_address: plan.load_balancer.clone(),
            pending_polls: 0,
        }
    }

    /// Keep new instances Pending for `polls` describe calls.
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// Make the next call to `operation` fail with `error`. Queued errors
    /// are returned in order.
    pub async fn fail_next(&self, operation: &str, error: ProviderError) {
        self.state
            .lock()
            .await
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Terminate an instance without going through the API, as an
    /// operator or a spot reclaim would. Returns false for unknown ids.
    pub async fn terminate_out_of_band(&self, instance_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.instances.get_mut(instance_id) else {
            return false;
        };
        entry.instance.state = CloudInstanceState::Terminated;
        entry.instance.public_dns = None;
        state.drop_membership(instance_id);
        true
    }

    /// Operation names in call order.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    pub async fn security_groups(&self) -> Vec<SecurityGroup> {
        self.state.lock().await.security_groups.values().cloned().collect()
    }

    pub async fn instance(&self, instance_id: &str) -> Option<CloudInstance> {
        self.state
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|e| e.instance.clone())
    }

    pub async fn instances(&self) -> Vec<CloudInstance> {
        self.state
            .lock()
            .await
            .instances
            .values()
            .map(|e| e.instance.clone())
            .collect()
    }

    pub async fn members(&self, target_group_arn: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .target_groups
            .get(target_group_arn)
            .map(|tg| tg.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn alarm_names(&self) -> Vec<String> {
        self.state.lock().await.alarms.keys().cloned().collect()
    }

    /// Tags recorded for a resource id or ARN.
    pub async fn tags_of(&self, id: &str) -> Option<Vec<(String, String)>> {
        self.state.lock().await.tags.get(id).cloned()
    }

    /// Everything still present: non-terminated instances and every other
    /// resource that has not been deleted.
    pub async fn leftovers(&self) -> Vec<(ResourceKind, String)> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        out.extend(
            state
                .instances
                .values()
                .filter(|e| e.instance.state != CloudInstanceState::Terminated)
                .map(|e| (ResourceKind::Instance, e.instance.id.clone())),
        );
        out.extend(state.alarms.keys().map(|n| (ResourceKind::Alarm, n.clone())));
        out.extend(
            state
                .listeners
                .keys()
                .map(|a| (ResourceKind::Listener, a.clone())),
        );
        out.extend(
            state
                .load_balancers
                .keys()
                .map(|a| (ResourceKind::LoadBalancer, a.clone())),
        );
        out.extend(
            state
                .target_groups
                .keys()
                .map(|a| (ResourceKind::TargetGroup, a.clone())),
        );
        out.extend(
            state
                .security_groups
                .keys()
                .map(|id| (ResourceKind::SecurityGroup, id.clone())),
        );
        out
    }

    /// Record the call and pop a queued failure for it.
    async fn enter(&self, operation: &str) -> ProviderResult<MutexGuard<'_, SandboxState>> {
        let mut state = self.state.lock().await;
        state.calls.push(operation.to_string());
        if let Some(err) = state
            .failures
            .get_mut(operation)
            .and_then(|queue| queue.pop_front())
        {
            debug!(operation, error = %err, "sandbox injected failure");
            return Err(err);
        }
        Ok(state)
    }
}

fn not_found(kind: ResourceKind, id: &str) -> ProviderError {
    ProviderError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn already_exists(kind: ResourceKind, name: &str) -> ProviderError {
    ProviderError::AlreadyExists {
        kind,
        name: name.to_string(),
    }
}

#[async_trait]
impl NetworkApi for SandboxCloud {
    async fn default_network(&self) -> ProviderResult<Network> {
        self.enter("default_network").await?;
        Ok(Network {
            id: SANDBOX_NETWORK.to_string(),
        })
    }

    async fn find_security_group(
        &self,
        name: &str,
        network_id: &str,
    ) -> ProviderResult<Option<SecurityGroup>> {
        let state = self.enter("find_security_group").await?;
        Ok(state
            .security_groups
            .values()
            .find(|g| g.name == name && g.network_id == network_id)
            .cloned())
    }

    async fn create_security_group(
        &self,
        name: &str,
        network_id: &str,
        tags: &Tags,
    ) -> ProviderResult<SecurityGroup> {
        let mut state = self.enter("create_security_group").await?;
        if network_id != SANDBOX_NETWORK {
            return Err(not_found(ResourceKind::Network, network_id));
        }
        if state
            .security_groups
            .values()
            .any(|g| g.name == name && g.network_id == network_id)
        {
            return Err(already_exists(ResourceKind::SecurityGroup, name));
        }
        let id = format!("sg-{:08x}", state.next_id());
        let group = SecurityGroup {
            id: id.clone(),
            name: name.to_string(),
            network_id: network_id.to_string(),
            ingress: Vec::new(),
        };
        state.security_groups.insert(id.clone(), group.clone());
        state.tags.insert(id, tags.to_vec());
        Ok(group)
    }

    async fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> ProviderResult<()> {
        let mut state = self.enter("authorize_ingress").await?;
        let group = state
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found(ResourceKind::SecurityGroup, group_id))?;
        if group.ingress.contains(rule) {
            return Err(already_exists(
                ResourceKind::SecurityGroup,
                &format!("{group_id} {}/{} {}", rule.protocol, rule.port, rule.cidr),
            ));
        }
        group.ingress.push(rule.clone());
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> ProviderResult<()> {
        let mut state = self.enter("delete_security_group").await?;
        if !state.security_groups.contains_key(group_id) {
            return Err(not_found(ResourceKind::SecurityGroup, group_id));
        }
        if let Some(user) = state.instances.values().find(|e| {
            e.security_group_id == group_id && e.instance.state != CloudInstanceState::Terminated
        }) {
            return Err(ProviderError::DependencyViolation {
                kind: ResourceKind::SecurityGroup,
                id: group_id.to_string(),
                reason: format!("used by instance {}", user.instance.id),
            });
        }
        if let Some(lb) = state
            .load_balancers
            .values()
            .find(|lb| lb.security_group_ids.iter().any(|g| g == group_id))
        {
            return Err(ProviderError::DependencyViolation {
                kind: ResourceKind::SecurityGroup,
                id: group_id.to_string(),
                reason: format!("used by load balancer {}", lb.name),
            });
        }
        state.security_groups.remove(group_id);
        state.tags.remove(group_id);
        Ok(())
    }
}

#[async_trait]
impl ComputeApi for SandboxCloud {
    async fn run_instance(&self, request: &LaunchRequest) -> ProviderResult<CloudInstance> {
        let mut state = self.enter("run_instance").await?;
        if !state.security_groups.contains_key(&request.security_group_id) {
            return Err(not_found(
                ResourceKind::SecurityGroup,
                &request.security_group_id,
            ));
        }
        let id = format!("i-{:08x}", state.next_id());
        let is_load_generator = request
            .tags
            .iter()
            .any(|(k, v)| k == "Name" && v == LOAD_GENERATOR_NAME);
        let planned = if is_load_generator {
            self.load_generator_address.clone()
        } else {
            state.web_service_addresses.pop_front()
        };
        let address = planned.unwrap_or_else(|| format!("{id}.sandbox.internal"));

        let instance = CloudInstance {
            id: id.clone(),
            state: CloudInstanceState::Pending,
            public_dns: None,
            tags: request.tags.clone(),
        };
        state.instances.insert(
            id.clone(),
            SandboxInstance {
                instance: instance.clone(),
                security_group_id: request.security_group_id.clone(),
                address,
                polls_left: self.pending_polls,
            },
        );
        state.tags.insert(id, request.tags.clone());
        Ok(instance)
    }

    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<CloudInstance> {
        let mut state = self.enter("describe_instance").await?;
        let entry = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| not_found(ResourceKind::Instance, instance_id))?;
        match entry.instance.state {
            CloudInstanceState::Pending if entry.polls_left > 0 => entry.polls_left -= 1,
            CloudInstanceState::Pending => {
                entry.instance.state = CloudInstanceState::Running;
                entry.instance.public_dns = Some(entry.address.clone());
            }
            CloudInstanceState::ShuttingDown => {
                entry.instance.state = CloudInstanceState::Terminated;
            }
            CloudInstanceState::Running | CloudInstanceState::Terminated => {}
        }
        Ok(entry.instance.clone())
    }

    async fn terminate_instance(&self, instance_id: &str) -> ProviderResult<()> {
        let mut state = self.enter("terminate_instance").await?;
        let entry = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| not_found(ResourceKind::Instance, instance_id))?;
        if entry.instance.state == CloudInstanceState::Terminated {
            return Ok(());
        }
        entry.instance.state = CloudInstanceState::ShuttingDown;
        entry.instance.public_dns = None;
        state.drop_membership(instance_id);
        Ok(())
    }
}

#[async_trait]
impl BalancerApi for SandboxCloud {
    async fn find_target_group(&self, name: &str) -> ProviderResult<Option<TargetGroup>> {
        let state = self.enter("find_target_group").await?;
        Ok(state
            .target_groups
            .values()
            .find(|tg| tg.group.name == name)
            .map(|tg| tg.group.clone()))
    }

    async fn create_target_group(
        &self,
        name: &str,
        network_id: &str,
        _port: u16,
        tags: &Tags,
    ) -> ProviderResult<TargetGroup> {
        let mut state = self.enter("create_target_group").await?;
        if network_id != SANDBOX_NETWORK {
            return Err(not_found(ResourceKind::Network, network_id));
        }
        if state.target_groups.values().any(|tg| tg.group.name == name) {
            return Err(already_exists(ResourceKind::TargetGroup, name));
        }
        let arn = format!(
            "arn:sandbox:elasticloadbalancing:targetgroup/{name}/{:08x}",
            state.next_id()
        );
        let group = TargetGroup {
            arn: arn.clone(),
            name: name.to_string(),
        };
        state.target_groups.insert(
            arn.clone(),
            SandboxTargetGroup {
                group: group.clone(),
                members: BTreeSet::new(),
            },
        );
        state.tags.insert(arn, tags.to_vec());
        Ok(group)
    }

    async fn find_load_balancer(&self, name: &str) -> ProviderResult<Option<LoadBalancer>> {
        let state = self.enter("find_load_balancer").await?;
        Ok(state
            .load_balancers
            .values()
            .find(|lb| lb.name == name)
            .cloned())
    }

    async fn create_load_balancer(
        &self,
        name: &str,
        security_group_ids: &[String],
        tags: &Tags,
    ) -> ProviderResult<LoadBalancer> {
        let mut state = self.enter("create_load_balancer").await?;
        if state.load_balancers.values().any(|lb| lb.name == name) {
            return Err(already_exists(ResourceKind::LoadBalancer, name));
        }
        if let Some(missing) = security_group_ids
            .iter()
            .find(|id| !state.security_groups.contains_key(id.as_str()))
        {
            return Err(not_found(ResourceKind::SecurityGroup, missing));
        }
        let arn = format!(
            "arn:sandbox:elasticloadbalancing:loadbalancer/app/{name}/{:08x}",
            state.next_id()
        );
        let balancer = LoadBalancer {
            arn: arn.clone(),
            name: name.to_string(),
            dns_name: self
                .load_balancer_address
                .clone()
                .unwrap_or_else(|| format!("{name}.elb.sandbox.internal")),
            security_group_ids: security_group_ids.to_vec(),
        };
        state.load_balancers.insert(arn.clone(), balancer.clone());
        state.tags.insert(arn, tags.to_vec());
        Ok(balancer)
    }

    async fn create_listener(
        &self,
        load_balancer_arn: &str,
        target_group_arn: &str,
        port: u16,
    ) -> ProviderResult<String> {
        let mut state = self.enter("create_listener").await?;
        if !state.load_balancers.contains_key(load_balancer_arn) {
            return Err(not_found(ResourceKind::LoadBalancer, load_balancer_arn));
        }
        if !state.target_groups.contains_key(target_group_arn) {
            return Err(not_found(ResourceKind::TargetGroup, target_group_arn));
        }
        if let Some((arn, _)) = state
            .listeners
            .iter()
            .find(|(_, l)| l.load_balancer_arn == load_balancer_arn && l.port == port)
        {
            return Ok(arn.clone());
        }
        let arn = format!("{load_balancer_arn}/listener/{:08x}", state.next_id());
        state.listeners.insert(
            arn.clone(),
            Listener {
                load_balancer_arn: load_balancer_arn.to_string(),
                target_group_arn: target_group_arn.to_string(),
                port,
            },
        );
        Ok(arn)
    }

    async fn register_target(
        &self,
        target_group_arn: &str,
        instance_id: &str,
    ) -> ProviderResult<()> {
        let mut state = self.enter("register_target").await?;
        let running = match state.instances.get(instance_id) {
            Some(e) => e.instance.state == CloudInstanceState::Running,
            None => return Err(not_found(ResourceKind::Instance, instance_id)),
        };
        if !running {
            return Err(ProviderError::Rejected {
                operation: "register_target".to_string(),
                reason: format!("instance {instance_id} is not running"),
            });
        }
        let tg = state
            .target_groups
            .get_mut(target_group_arn)
            .ok_or_else(|| not_found(ResourceKind::TargetGroup, target_group_arn))?;
        tg.members.insert(instance_id.to_string());
        Ok(())
    }

    async fn deregister_target(
        &self,
        target_group_arn: &str,
        instance_id: &str,
    ) -> ProviderResult<()> {
        let mut state = self.enter("deregister_target").await?;
        let tg = state
            .target_groups
            .get_mut(target_group_arn)
            .ok_or_else(|| not_found(ResourceKind::TargetGroup, target_group_arn))?;
        tg.members.remove(instance_id);
        Ok(())
    }

    async fn target_members(&self, target_group_arn: &str) -> ProviderResult<Vec<String>> {
        let state = self.enter("target_members").await?;
        state
            .target_groups
            .get(target_group_arn)
            .map(|tg| tg.members.iter().cloned().collect())
            .ok_or_else(|| not_found(ResourceKind::TargetGroup, target_group_arn))
    }

    async fn delete_load_balancer(&self, load_balancer_arn: &str) -> ProviderResult<()> {
        let mut state = self.enter("delete_load_balancer").await?;
        if state.load_balancers.remove(load_balancer_arn).is_none() {
            return Err(not_found(ResourceKind::LoadBalancer, load_balancer_arn));
        }
        state
            .listeners
            .retain(|_, l| l.load_balancer_arn != load_balancer_arn);
        state.tags.remove(load_balancer_arn);
        Ok(())
    }

    async fn delete_target_group(&self, target_group_arn: &str) -> ProviderResult<()> {
        let mut state = self.enter("delete_target_group").await?;
        if !state.target_groups.contains_key(target_group_arn) {
            return Err(not_found(ResourceKind::TargetGroup, target_group_arn));
        }
        if let Some((arn, _)) = state
            .listeners
            .iter()
            .find(|(_, l)| l.target_group_arn == target_group_arn)
        {
            return Err(ProviderError::DependencyViolation {
                kind: ResourceKind::TargetGroup,
                id: target_group_arn.to_string(),
                reason: format!("used by listener {arn}"),
            });
        }
        state.target_groups.remove(target_group_arn);
        state.tags.remove(target_group_arn);
        Ok(())
    }
}

#[async_trait]
impl AlarmApi for SandboxCloud {
    async fn put_alarm(&self, spec: &AlarmSpec) -> ProviderResult<()> {
        let mut state = self.enter("put_alarm").await?;
        state.alarms.insert(spec.name.clone(), spec.clone());
        state.tags.insert(spec.name.clone(), spec.tags.clone());
        Ok(())
    }

    async fn delete_alarms(&self, names: &[String]) -> ProviderResult<()> {
        let mut state = self.enter("delete_alarms").await?;
        for name in names {
            state.alarms.remove(name);
            state.tags.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(name: &str) -> Vec<(String, String)> {
        vec![
            ("Project".to_string(), "vm-scaling".to_string()),
            ("Name".to_string(), name.to_string()),
        ]
    }

    async fn group(cloud: &SandboxCloud, name: &str) -> String {
        cloud
            .create_security_group(name, SANDBOX_NETWORK, &[])
            .await
            .unwrap()
            .id
    }

    fn launch(sg: &str, name: &str) -> LaunchRequest {
        LaunchRequest {
            image: "ami-1".to_string(),
            instance_type: "m5.large".to_string(),
            security_group_id: sg.to_string(),
            tags: tags(name),
        }
    }

    #[tokio::test]
    async fn duplicate_security_group_is_rejected() {
        let cloud = SandboxCloud::new(&SandboxConfig::default());
        group(&cloud, "lg").await;
        let err = cloud
            .create_security_group("lg", SANDBOX_NETWORK, &[])
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn instances_pass_through_pending() {
        let cloud = SandboxCloud::new(&SandboxConfig::default()).with_pending_polls(2);
        let sg = group(&cloud, "ws").await;
        let inst = cloud.run_instance(&launch(&sg, "Web Service")).await.unwrap();
        assert_eq!(inst.state, CloudInstanceState::Pending);

        assert_eq!(
            cloud.describe_instance(&inst.id).await.unwrap().state,
            CloudInstanceState::Pending
        );
        assert_eq!(
            cloud.describe_instance(&inst.id).await.unwrap().state,
            CloudInstanceState::Pending
        );
        let running = cloud.describe_instance(&inst.id).await.unwrap();
        assert!(running.is_ready());
    }

    #[tokio::test]
    async fn addresses_follow_the_plan() {
        let plan = SandboxConfig {
            load_generator: Some("127.0.0.1:7000".to_string()),
            load_balancer: Some("127.0.0.1:7100".to_string()),
            web_services: vec!["127.0.0.1:8001".to_string()],
        };
        let cloud = SandboxCloud::new(&plan);
        let sg = group(&cloud, "sg").await;

        let ws = cloud.run_instance(&launch(&sg, "Web Service")).await.unwrap();
        let lg = cloud.run_instance(&launch(&sg, LOAD_GENERATOR_NAME)).await.unwrap();
        let extra = cloud.run_instance(&launch(&sg, "Web Service")).await.unwrap();

        let dns = |i: CloudInstance| i.public_dns.unwrap();
        assert_eq!(dns(cloud.describe_instance(&lg.id).await.unwrap()), "127.0.0.1:7000");
        assert_eq!(dns(cloud.describe_instance(&ws.id).await.unwrap()), "127.0.0.1:8001");
        assert!(dns(cloud.describe_instance(&extra.id).await.unwrap()).ends_with(".sandbox.internal"));

        let lb = cloud.create_load_balancer("lb", &[sg], &[]).await.unwrap();
        assert_eq!(lb.dns_name, "127.0.0.1:7100");
    }

    #[tokio::test]
    async fn security_group_in_use_refuses_deletion() {
        let cloud = SandboxCloud::new(&SandboxConfig::default());
        let sg = group(&cloud, "ws").await;
        let inst = cloud.run_instance(&launch(&sg, "Web Service")).await.unwrap();

        let err = cloud.delete_security_group(&sg).await.unwrap_err();
        assert!(matches!(err, ProviderError::DependencyViolation { .. }));

        cloud.terminate_instance(&inst.id).await.unwrap();
        // Still shutting down.
        assert!(cloud.delete_security_group(&sg).await.is_err());
        cloud.describe_instance(&inst.id).await.unwrap();
        cloud.delete_security_group(&sg).await.unwrap();
        assert!(cloud.delete_security_group(&sg).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn target_group_behind_listener_refuses_deletion() {
        let cloud = SandboxCloud::new(&SandboxConfig::default());
        let sg = group(&cloud, "ws").await;
        let tg = cloud
            .create_target_group("tg", SANDBOX_NETWORK, 80, &[])
            .await
            .unwrap();
        let lb = cloud.create_load_balancer("lb", &[sg], &[]).await.unwrap();
        let first = cloud.create_listener(&lb.arn, &tg.arn, 80).await.unwrap();
        let second = cloud.create_listener(&lb.arn, &tg.arn, 80).await.unwrap();
        assert_eq!(first, second);

        assert!(cloud.delete_target_group(&tg.arn).await.is_err());
        cloud.delete_load_balancer(&lb.arn).await.unwrap();
        cloud.delete_target_group(&tg.arn).await.unwrap();
    }

    #[tokio::test]
    async fn register_requires_running_instance() {
        let cloud = SandboxCloud::new(&SandboxConfig::default());
        let sg = group(&cloud, "ws").await;
        let tg = cloud
            .create_target_group("tg", SANDBOX_NETWORK, 80, &[])
            .await
            .unwrap();
        let inst = cloud.run_instance(&launch(&sg, "Web Service")).await.unwrap();

        let err = cloud.register_target(&tg.arn, &inst.id).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { .. }));

        cloud.describe_instance(&inst.id).await.unwrap();
        cloud.register_target(&tg.arn, &inst.id).await.unwrap();
        assert_eq!(cloud.members(&tg.arn).await, vec![inst.id.clone()]);

        cloud.terminate_out_of_band(&inst.id).await;
        assert!(cloud.members(&tg.arn).await.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_fire_once_in_order() {
        let cloud = SandboxCloud::new(&SandboxConfig::default());
        cloud
            .fail_next("default_network", ProviderError::Throttled("slow down".into()))
            .await;

        assert!(cloud.default_network().await.is_err());
        assert!(cloud.default_network().await.is_ok());
        assert_eq!(cloud.call_count("default_network").await, 2);
    }

    #[tokio::test]
    async fn leftovers_list_undeleted_resources() {
        let cloud = SandboxCloud::new(&SandboxConfig::default());
        let sg = group(&cloud, "ws").await;
        let inst = cloud.run_instance(&launch(&sg, "Web Service")).await.unwrap();
        assert_eq!(cloud.leftovers().await.len(), 2);
        assert_eq!(cloud.tags_of(&inst.id).await.unwrap(), tags("Web Service"));

        cloud.terminate_out_of_band(&inst.id).await;
        assert_eq!(
            cloud.leftovers().await,
            vec![(ResourceKind::SecurityGroup, sg)]
        );
    }
}
