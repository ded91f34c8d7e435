//! Elastic capacity controller: drives one run from provisioning to
//! teardown.
//!
//! A single control loop owns the [`ResourceConfig`]. Each iteration polls
//! the test log, feeds the sample to the [`Autoscaler`], and carries out
//! the resulting action to completion before the next poll, so no two
//! scale actions are ever in flight together.

use std::path::PathBuf;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use vmscale_autoscale::{Autoscaler, ScaleAction, ScaleDirection, ScalingPolicy, TestMetricSample};
use vmscale_core::{
    InstanceId, InstanceRecord, InstanceRole, InstanceState, LOAD_GENERATOR_NAME, OwnershipTags,
    ResourceConfig, RetryError, RetryPolicy, Retryable, ScaleConfig, StopFlag, TestMode,
    WEB_SERVICE_NAME,
};
use vmscale_loadgen::{LoadGenClient, TestId, TestLogPoller};
use vmscale_provider::{AlarmSpec, CapacityProvider, CloudInstance, Comparison, LaunchRequest};

use crate::error::{ControllerError, ControllerResult};
use crate::phase::ControllerPhase;
use crate::teardown::{TeardownReport, teardown};

/// Metric the CPU alarms watch.
const CPU_METRIC: &str = "CPUUtilization";

/// What the measured test produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSummary {
    pub test_id: TestId,
    /// Last throughput reading seen before the test finished.
    pub final_rps: Option<f64>,
    pub instances_added: u32,
    pub instances_removed: u32,
    pub peak_fleet: u32,
    /// Local copy of the status artifact.
    pub log_path: PathBuf,
}

/// Outcome of [`ElasticController::run`].
#[derive(Debug)]
pub struct RunReport {
    pub summary: Option<TestSummary>,
    pub error: Option<ControllerError>,
    pub teardown: TeardownReport,
    pub final_phase: ControllerPhase,
    /// Resource record after teardown; anything still present is a leftover.
    pub resources: ResourceConfig,
}

impl RunReport {
    /// The test completed and nothing was left behind.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.teardown.is_clean()
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }
}

pub struct ElasticController {
    config: ScaleConfig,
    provider: CapacityProvider,
    tags: OwnershipTags,
    resources: ResourceConfig,
    scaler: Autoscaler,
    phase: ControllerPhase,
    stop: StopFlag,
}

impl ElasticController {
    /// Validate `config` and build a controller. Nothing is created until
    /// [`run`](Self::run).
    pub fn new(config: ScaleConfig, provider: CapacityProvider, stop: StopFlag) -> ControllerResult<Self> {
        config.validate()?;
        let tags = OwnershipTags::from(&config.tags);
        let scaler = Autoscaler::new(ScalingPolicy::from_config(&config));
        Ok(Self {
            config,
            provider,
            tags,
            resources: ResourceConfig::new(),
            scaler,
            phase: ControllerPhase::Provisioning,
            stop,
        })
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn resources(&self) -> &ResourceConfig {
        &self.resources
    }

    pub fn config(&self) -> &ScaleConfig {
        &self.config
    }

    /// Run to completion. Teardown always runs, whether the test finished,
    /// failed, or was stopped.
    pub async fn run(mut self) -> RunReport {
        let (summary, error) = match self.drive().await {
            Ok(summary) => (Some(summary), None),
            Err(e) if e.is_stopped() => {
                warn!(phase = %self.phase, "stopped by operator, tearing down");
                (None, Some(e))
            }
            Err(e) => {
                error!(phase = %self.phase, error = %e, "run failed, tearing down");
                (None, Some(e))
            }
        };

        self.enter(ControllerPhase::Draining);
        let report = teardown(&self.provider, &mut self.resources).await;
        self.enter(ControllerPhase::Terminated);

        RunReport {
            summary,
            error,
            teardown: report,
            final_phase: self.phase,
            resources: self.resources,
        }
    }

    async fn drive(&mut self) -> ControllerResult<TestSummary> {
        info!(mode = ?self.config.mode, phase = %self.phase, "run started");
        self.provision().await?;
        self.check_stop()?;

        let poller = self.poller()?;
        if self.config.mode == TestMode::Balanced {
            self.enter(ControllerPhase::WarmingUp);
            self.warm_up(&poller).await?;
        }

        self.enter(ControllerPhase::Testing);
        let test_id = self.start_test(&poller).await?;
        self.run_test(&poller, test_id).await
    }

    fn enter(&mut self, next: ControllerPhase) {
        if !self.phase.can_advance_to(next) {
            return;
        }
        info!(from = %self.phase, to = %next, "phase change");
        self.phase = next;
    }

    fn check_stop(&self) -> ControllerResult<()> {
        if self.stop.is_set() {
            return Err(ControllerError::Stopped);
        }
        Ok(())
    }

    // ── Provisioning ─────────────────────────────────────────────

    async fn provision(&mut self) -> ControllerResult<()> {
        let network = self.provider.default_network().await?;
        self.resources.network_id = Some(network.id.clone());
        let tags = self.tags.to_pairs(None);

        // Each group is recorded before its ingress rule is added, so a
        // failed authorization still leaves it for teardown.
        let lg_sg = self
            .provider
            .ensure_security_group(
                &self.config.names.load_generator_security_group,
                &network.id,
                &tags,
            )
            .await?;
        self.resources.load_generator_security_group_id = Some(lg_sg.id.clone());
        self.provider.allow_http_ingress(&lg_sg).await?;

        let ws_sg = self
            .provider
            .ensure_security_group(
                &self.config.names.web_service_security_group,
                &network.id,
                &tags,
            )
            .await?;
        self.resources.web_service_security_group_id = Some(ws_sg.id.clone());
        self.provider.allow_http_ingress(&ws_sg).await?;

        self.launch_load_generator(&lg_sg.id).await?;

        if self.config.mode == TestMode::Balanced {
            let group = self
                .provider
                .ensure_target_group(&self.config.names.target_group, &network.id, &tags)
                .await?;
            self.resources.target_group_arn = Some(group.arn.clone());

            let balancer = self
                .provider
                .ensure_load_balancer(
                    &self.config.names.load_balancer,
                    std::slice::from_ref(&ws_sg.id),
                    &tags,
                )
                .await?;
            self.resources.load_balancer_arn = Some(balancer.arn.clone());
            self.resources.load_balancer_dns = Some(balancer.dns_name);

            let listener = self
                .provider
                .attach_listener(&balancer.arn, &group.arn)
                .await?;
            self.resources.listener_arn = Some(listener);
        }

        if self.config.alarms.enabled {
            let specs = self.alarm_specs();
            // Recorded up front so a partial failure is still cleaned up.
            self.resources.alarm_names = specs.iter().map(|s| s.name.clone()).collect();
            self.provider.ensure_alarms(&specs).await?;
        }

        for _ in 0..self.config.scaling.initial_size {
            let id = self.launch_web_service().await?;
            if self.config.mode == TestMode::Balanced {
                self.register(&id).await?;
            }
        }

        info!(
            load_generator = self.resources.load_generator_dns().unwrap_or_default(),
            load_balancer = self.resources.load_balancer_dns.as_deref().unwrap_or_default(),
            web_services = self.resources.fleet_size(),
            "provisioning complete"
        );
        Ok(())
    }

    fn alarm_specs(&self) -> Vec<AlarmSpec> {
        let alarms = &self.config.alarms;
        let group = &self.config.names.auto_scaling_group;
        let tags = self.tags.to_pairs(None);
        vec![
            AlarmSpec {
                name: format!("{group}-scale-out"),
                metric: CPU_METRIC.to_string(),
                comparison: Comparison::GreaterThanOrEqual,
                threshold: alarms.cpu_upper_threshold,
                period: alarms.period(),
                evaluation_periods: alarms.evaluation_periods_scale_out,
                dimension: group.clone(),
                tags: tags.clone(),
            },
            AlarmSpec {
                name: format!("{group}-scale-in"),
                metric: CPU_METRIC.to_string(),
                comparison: Comparison::LessThanOrEqual,
                threshold: alarms.cpu_lower_threshold,
                period: alarms.period(),
                evaluation_periods: alarms.evaluation_periods_scale_in,
                dimension: group.clone(),
                tags,
            },
        ]
    }

    async fn launch_load_generator(&mut self, security_group_id: &str) -> ControllerResult<()> {
        let request = LaunchRequest {
            image: self.config.load_generator_ami.clone(),
            instance_type: self.config.instance_type.clone(),
            security_group_id: security_group_id.to_string(),
            tags: self.tags.to_pairs(Some(LOAD_GENERATOR_NAME)),
        };
        let requested = self.provider.request_instance(&request).await?;
        self.resources.load_generator = Some(InstanceRecord::requested(
            requested.id.clone(),
            InstanceRole::LoadGenerator,
        ));

        let running = self.provider.wait_until_running(&requested.id).await?;
        self.record_running(&running)
    }

    /// Launch one web service and wait for it to run. The instance is
    /// recorded as soon as the launch is issued.
    async fn launch_web_service(&mut self) -> ControllerResult<InstanceId> {
        let security_group_id = self
            .resources
            .web_service_security_group_id
            .clone()
            .ok_or(ControllerError::Incomplete("web service security group"))?;
        let request = LaunchRequest {
            image: self.config.web_service_ami.clone(),
            instance_type: self.config.instance_type.clone(),
            security_group_id,
            tags: self.tags.to_pairs(Some(WEB_SERVICE_NAME)),
        };
        let requested = self.provider.request_instance(&request).await?;
        self.resources.web_services.push(InstanceRecord::requested(
            requested.id.clone(),
            InstanceRole::WebService,
        ));

        let running = match self.provider.wait_until_running(&requested.id).await {
            Ok(running) => running,
            Err(e) => {
                self.abandon_launch(&requested.id).await;
                return Err(e.into());
            }
        };
        self.record_running(&running)?;
        Ok(running.id)
    }

    /// Terminate a web service that never came up, so it stops counting
    /// toward the fleet. If that fails too the record stays for teardown.
    async fn abandon_launch(&mut self, instance_id: &str) {
        warn!(instance = instance_id, "web service did not start, terminating it");
        let terminated = match self.provider.terminate_instance(instance_id).await {
            Ok(()) => self.provider.await_terminated(instance_id).await,
            Err(e) => Err(e),
        };
        match terminated {
            Ok(()) => {
                if let Err(e) = self.resources.mark(instance_id, InstanceState::Terminated) {
                    warn!(instance = instance_id, error = %e, "ignoring out-of-order lifecycle update");
                }
            }
            Err(e) => {
                error!(instance = instance_id, error = %e, "could not terminate stalled web service");
            }
        }
    }

    fn record_running(&mut self, instance: &CloudInstance) -> ControllerResult<()> {
        self.resources.mark(&instance.id, InstanceState::Running)?;
        let is_load_generator = self
            .resources
            .load_generator
            .as_ref()
            .is_some_and(|lg| lg.id == instance.id);
        let record = if is_load_generator {
            self.resources.load_generator.as_mut()
        } else {
            self.resources.web_service_mut(&instance.id)
        };
        if let Some(record) = record {
            record.public_dns = instance.public_dns.clone();
        }
        Ok(())
    }

    async fn register(&mut self, instance_id: &str) -> ControllerResult<()> {
        let target_group = self
            .resources
            .target_group_arn
            .clone()
            .ok_or(ControllerError::Incomplete("target group"))?;
        self.provider
            .register_with_balancer(&target_group, instance_id)
            .await?;
        self.resources.mark(instance_id, InstanceState::Registered)?;
        Ok(())
    }

    // ── Load generator ───────────────────────────────────────────

    fn poller(&self) -> ControllerResult<TestLogPoller> {
        let address = self
            .resources
            .load_generator_dns()
            .ok_or(ControllerError::Incomplete("load generator address"))?;
        let timing = &self.config.timing;
        let client = LoadGenClient::new(
            address,
            timing.request_timeout(),
            RetryPolicy {
                delay: timing.retry_delay(),
                max_attempts: timing.rpc_max_attempts,
            },
        );
        Ok(TestLogPoller::new(client, timing.log_dir.clone()))
    }

    fn balancer_dns(&self) -> ControllerResult<String> {
        self.resources
            .load_balancer_dns
            .clone()
            .ok_or(ControllerError::Incomplete("load balancer address"))
    }

    fn web_service_dns(&self, instance_id: &str) -> ControllerResult<String> {
        self.resources
            .web_services
            .iter()
            .find(|ws| ws.id == instance_id)
            .and_then(|ws| ws.public_dns.clone())
            .ok_or(ControllerError::Incomplete("web service address"))
    }

    async fn warm_up(&self, poller: &TestLogPoller) -> ControllerResult<()> {
        let dns = self.balancer_dns()?;
        let stop = self.stop.clone();
        let body = poller
            .client()
            .start_warmup(&dns, async || stop.is_set())
            .await?;
        let test_id = TestLogPoller::test_id(&body)?;
        info!(test = %test_id, "warm-up started");

        poller
            .wait_until_finished(&test_id, self.config.timing.poll_interval(), &self.stop)
            .await?;
        info!(test = %test_id, "warm-up finished");
        Ok(())
    }

    async fn start_test(&mut self, poller: &TestLogPoller) -> ControllerResult<TestId> {
        let stop = self.stop.clone();
        let test_id = match self.config.mode {
            TestMode::Balanced => {
                let dns = self.balancer_dns()?;
                let body = poller
                    .client()
                    .start_autoscaling(&dns, async || stop.is_set())
                    .await?;
                TestLogPoller::test_id(&body)?
            }
            TestMode::Horizontal => {
                let initial: Vec<InstanceId> = self
                    .resources
                    .web_services
                    .iter()
                    .map(|ws| ws.id.clone())
                    .collect();
                let (first, rest) = initial
                    .split_first()
                    .ok_or(ControllerError::Incomplete("initial web service"))?;

                let dns = self.web_service_dns(first)?;
                let body = poller
                    .client()
                    .start_horizontal(&dns, async || stop.is_set())
                    .await?;
                let test_id = TestLogPoller::test_id(&body)?;
                self.resources.mark(first, InstanceState::Registered)?;

                for id in rest {
                    self.submit_to_load_generator(id, poller, &test_id).await?;
                }
                test_id
            }
        };

        self.scaler
            .start_test(Instant::now(), self.config.scaling.cooldown_from_test_start);
        info!(test = %test_id, instances = self.resources.fleet_size(), "test started");
        Ok(test_id)
    }

    /// Hand a web service to a running horizontal test. Retries until the
    /// load generator accepts it or the test finishes.
    async fn submit_to_load_generator(
        &mut self,
        instance_id: &str,
        poller: &TestLogPoller,
        test_id: &TestId,
    ) -> ControllerResult<()> {
        let dns = self.web_service_dns(instance_id)?;
        let stop = self.stop.clone();
        let test_over = async || {
            stop.is_set() || matches!(poller.fetch(test_id).await, Ok(log) if log.finished)
        };

        match poller.client().add_horizontal(&dns, test_over).await {
            Ok(_) => {
                self.resources.mark(instance_id, InstanceState::Registered)?;
                Ok(())
            }
            Err(RetryError::Stopped) if !self.stop.is_set() => {
                info!(
                    instance = instance_id,
                    "new web service not submitted because test already completed"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Test loop ────────────────────────────────────────────────

    async fn run_test(
        &mut self,
        poller: &TestLogPoller,
        test_id: TestId,
    ) -> ControllerResult<TestSummary> {
        let interval = self.config.timing.poll_interval();
        let mut summary = TestSummary {
            test_id: test_id.clone(),
            final_rps: None,
            instances_added: 0,
            instances_removed: 0,
            peak_fleet: self.resources.fleet_size(),
            log_path: poller.local_path(&test_id),
        };
        let mut start_logged = false;

        loop {
            self.check_stop()?;

            match poller.fetch(&test_id).await {
                Ok(log) => {
                    if !start_logged
                        && let Some(start) = log.artifact.section_value("Test", "starttime")
                    {
                        info!(test = %test_id, starttime = start, "test start time");
                        start_logged = true;
                    }
                    if log.current_rps.is_some() {
                        summary.final_rps = log.current_rps;
                    }
                    if log.finished {
                        info!(
                            test = %test_id,
                            rps = ?summary.final_rps,
                            added = summary.instances_added,
                            removed = summary.instances_removed,
                            peak = summary.peak_fleet,
                            "test finished"
                        );
                        return Ok(summary);
                    }
                    if let Some(rps) = log.current_rps {
                        let now = Instant::now();
                        let sample =
                            TestMetricSample::new(rps, false, &self.scaler.state().cooldown, now);
                        let decision =
                            self.scaler
                                .evaluate(&sample, self.resources.fleet_size(), now);
                        self.apply(decision.action, poller, &test_id, &mut summary)
                            .await?;
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(test = %test_id, error = %e, "polling test log failed, will retry");
                }
                Err(e) => return Err(e.into()),
            }

            if self.stop.sleep(interval).await {
                return Err(ControllerError::Stopped);
            }
        }
    }

    /// Carry out one decision. Failures other than a stop are logged and
    /// the test goes on. The cooldown already started when the decision
    /// was made; when the fleet changed it restarts at completion.
    async fn apply(
        &mut self,
        action: ScaleAction,
        poller: &TestLogPoller,
        test_id: &TestId,
        summary: &mut TestSummary,
    ) -> ControllerResult<()> {
        let before = self.resources.fleet_size();
        let (direction, result) = match action {
            ScaleAction::NoAction => return Ok(()),
            ScaleAction::ScaleOut(n) => (ScaleDirection::Out, self.scale_out(n, poller, test_id).await),
            ScaleAction::ScaleIn(n) => (ScaleDirection::In, self.scale_in(n).await),
        };
        let after = self.resources.fleet_size();

        let changed = match direction {
            ScaleDirection::Out => {
                let added = after.saturating_sub(before);
                summary.instances_added += added;
                added
            }
            ScaleDirection::In => {
                let removed = before.saturating_sub(after);
                summary.instances_removed += removed;
                removed
            }
        };
        summary.peak_fleet = summary.peak_fleet.max(after);

        if changed > 0 {
            self.scaler.record_action(direction, Instant::now());
        }

        match result {
            Ok(()) => {
                info!(?direction, changed, instances = after, "scale action complete");
                Ok(())
            }
            Err(e) if e.is_stopped() => Err(e),
            Err(e) => {
                error!(?direction, changed, error = %e, "scale action failed, continuing test");
                Ok(())
            }
        }
    }

    async fn scale_out(
        &mut self,
        count: u32,
        poller: &TestLogPoller,
        test_id: &TestId,
    ) -> ControllerResult<()> {
        for _ in 0..count {
            let id = self.launch_web_service().await?;
            match self.config.mode {
                TestMode::Balanced => self.register(&id).await?,
                TestMode::Horizontal => self.submit_to_load_generator(&id, poller, test_id).await?,
            }
        }
        Ok(())
    }

    async fn scale_in(&mut self, count: u32) -> ControllerResult<()> {
        let candidates: Vec<InstanceId> = self
            .resources
            .scale_in_candidates()
            .into_iter()
            .take(count as usize)
            .collect();
        for id in candidates {
            self.remove_web_service(&id).await?;
        }
        Ok(())
    }

    /// Deregister first, so the balancer stops routing before the
    /// instance goes away.
    async fn remove_web_service(&mut self, instance_id: &str) -> ControllerResult<()> {
        let registered = self
            .resources
            .registered_ids()
            .iter()
            .any(|id| id == instance_id);
        if registered && let Some(target_group) = self.resources.target_group_arn.clone() {
            self.provider
                .deregister_from_balancer(&target_group, instance_id)
                .await?;
        }
        self.resources.mark(instance_id, InstanceState::Deregistered)?;

        self.provider.terminate_instance(instance_id).await?;
        self.provider.await_terminated(instance_id).await?;
        self.resources.mark(instance_id, InstanceState::Terminated)?;
        debug!(instance = instance_id, "web service removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use vmscale_core::SandboxConfig;
    use vmscale_provider::{CloudHandles, SandboxCloud};

    use super::*;

    fn config() -> ScaleConfig {
        let mut config = ScaleConfig::from_toml_str(
            r#"
load_generator_ami = "ami-lg"
web_service_ami = "ami-ws"
instance_type = "m5.large"
"#,
        )
        .unwrap();
        config.scaling.initial_size = 2;
        config
    }

    fn controller(config: ScaleConfig) -> (Arc<SandboxCloud>, ElasticController) {
        let cloud = Arc::new(SandboxCloud::new(&SandboxConfig::default()));
        let provider = CapacityProvider::new(CloudHandles::from_provider(cloud.clone()), Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(1))
            .with_retry(RetryPolicy::bounded(Duration::from_millis(1), 3));
        let controller = ElasticController::new(config, provider, StopFlag::never()).unwrap();
        (cloud, controller)
    }

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = config();
        config.scaling.min_size = 9;
        let cloud = Arc::new(SandboxCloud::new(&SandboxConfig::default()));
        let provider = CapacityProvider::new(CloudHandles::from_provider(cloud), Duration::from_secs(1));
        let err = ElasticController::new(config, provider, StopFlag::never()).err().unwrap();
        assert!(matches!(err, ControllerError::Config(_)));
    }

    #[test]
    fn report_exit_codes() {
        let mut report = RunReport {
            summary: None,
            error: None,
            teardown: TeardownReport::default(),
            final_phase: ControllerPhase::Terminated,
            resources: ResourceConfig::new(),
        };
        assert_eq!(report.exit_code(), 0);
        report.error = Some(ControllerError::Stopped);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn provision_balanced_records_every_resource() {
        let (cloud, mut controller) = controller(config());
        controller.provision().await.unwrap();

        let rc = controller.resources();
        assert_eq!(rc.network_id.as_deref(), Some("vpc-sandbox"));
        assert!(rc.load_generator_security_group_id.is_some());
        assert!(rc.web_service_security_group_id.is_some());
        assert!(rc.load_generator_dns().is_some());
        assert!(rc.listener_arn.is_some());
        assert!(rc.alarm_names.is_empty());
        assert_eq!(rc.registered_ids().len(), 2);

        let tg = rc.target_group_arn.clone().unwrap();
        assert_eq!(cloud.members(&tg).await.len(), 2);
        let lg = rc.load_generator.as_ref().unwrap();
        let lg_tags = cloud.tags_of(&lg.id).await.unwrap();
        assert!(lg_tags.contains(&("Name".to_string(), LOAD_GENERATOR_NAME.to_string())));
    }

    #[tokio::test]
    async fn provision_horizontal_skips_balancer() {
        let mut config = config();
        config.mode = TestMode::Horizontal;
        let (cloud, mut controller) = controller(config);
        controller.provision().await.unwrap();

        let rc = controller.resources();
        assert!(rc.target_group_arn.is_none());
        assert!(rc.load_balancer_arn.is_none());
        assert_eq!(rc.fleet_size(), 2);
        assert!(rc.registered_ids().is_empty());
        assert_eq!(cloud.call_count("create_load_balancer").await, 0);
    }

    #[tokio::test]
    async fn provision_creates_alarms_when_enabled() {
        let mut config = config();
        config.alarms.enabled = true;
        let (cloud, mut controller) = controller(config);
        controller.provision().await.unwrap();

        assert_eq!(
            cloud.alarm_names().await,
            vec!["vm-scaling-asg-scale-in", "vm-scaling-asg-scale-out"]
        );
        assert_eq!(controller.resources().alarm_names.len(), 2);
    }

    #[tokio::test]
    async fn scale_in_deregisters_before_terminating() {
        let (cloud, mut controller) = controller(config());
        controller.provision().await.unwrap();
        let newest = controller.resources().web_services[1].id.clone();

        controller.scale_in(1).await.unwrap();

        let rc = controller.resources();
        assert_eq!(rc.fleet_size(), 1);
        assert_eq!(rc.web_services[1].state, InstanceState::Terminated);
        assert_eq!(rc.web_services[1].id, newest);

        let calls = cloud.calls().await;
        let dereg = calls.iter().position(|c| c == "deregister_target").unwrap();
        let term = calls.iter().position(|c| c == "terminate_instance").unwrap();
        assert!(dereg < term);
    }

    #[tokio::test]
    async fn rejected_launch_records_nothing() {
        let (cloud, mut controller) = controller(config());
        controller.provision().await.unwrap();

        // Launches are single-shot, so even a transient failure surfaces.
        cloud
            .fail_next(
                "run_instance",
                vmscale_provider::ProviderError::Throttled("slow down".into()),
            )
            .await;
        assert!(controller.launch_web_service().await.is_err());
        assert_eq!(controller.resources().web_services.len(), 2);
        assert_eq!(controller.resources().fleet_size(), 2);
    }

    #[tokio::test]
    async fn stalled_launch_is_terminated_and_frees_its_slot() {
        let mut config = config();
        config.scaling.initial_size = 1;
        config.scaling.max_size = 2;
        let (cloud, mut controller) = controller(config);
        controller.provision().await.unwrap();

        cloud
            .fail_next(
                "describe_instance",
                vmscale_provider::ProviderError::Rejected {
                    operation: "describe_instance".into(),
                    reason: "access denied".into(),
                },
            )
            .await;
        assert!(controller.launch_web_service().await.is_err());

        let rc = controller.resources();
        assert_eq!(rc.web_services.len(), 2);
        assert_eq!(rc.web_services[1].state, InstanceState::Terminated);
        assert_eq!(rc.fleet_size(), 1);
        let stalled = cloud.instance(&rc.web_services[1].id).await.unwrap();
        assert_eq!(stalled.state, vmscale_provider::CloudInstanceState::Terminated);

        // The freed slot can be filled again.
        let id = controller.launch_web_service().await.unwrap();
        controller.register(&id).await.unwrap();
        assert_eq!(controller.resources().fleet_size(), 2);
        assert_eq!(controller.resources().registered_ids().len(), 2);
    }

    #[tokio::test]
    async fn failed_listener_leaves_balancer_recorded() {
        let (cloud, mut controller) = controller(config());
        cloud
            .fail_next(
                "create_listener",
                vmscale_provider::ProviderError::Rejected {
                    operation: "create_listener".into(),
                    reason: "quota exceeded".into(),
                },
            )
            .await;

        assert!(controller.provision().await.is_err());
        let rc = controller.resources();
        assert!(rc.load_balancer_arn.is_some());
        assert!(rc.load_balancer_dns.is_some());
        assert!(rc.listener_arn.is_none());
    }

    #[tokio::test]
    async fn failed_ingress_leaves_group_recorded() {
        let (cloud, mut controller) = controller(config());
        cloud
            .fail_next(
                "authorize_ingress",
                vmscale_provider::ProviderError::Rejected {
                    operation: "authorize_ingress".into(),
                    reason: "access denied".into(),
                },
            )
            .await;

        assert!(controller.provision().await.is_err());
        let rc = controller.resources();
        assert!(rc.load_generator_security_group_id.is_some());
        assert!(rc.web_service_security_group_id.is_none());
        assert_eq!(cloud.security_groups().await.len(), 1);
    }
}
