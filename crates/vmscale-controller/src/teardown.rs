//! Best-effort teardown in reverse-of-creation order.
//!
//! Every recorded resource is attempted. A failure is recorded as a
//! leftover and the remaining steps still run; nothing is skipped because
//! an earlier step failed.
//!
//! ```text
//! alarms → deregister targets → terminate instances → load balancer
//!        → target group → wait for terminations → security groups
//! ```

use tracing::{error, info, warn};

use vmscale_core::{InstanceState, ResourceConfig};
use vmscale_provider::{CapacityProvider, ProviderError, ResourceKind};

/// A resource that could not be confirmed deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leftover {
    pub kind: ResourceKind,
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub deleted: Vec<(ResourceKind, String)>,
    pub leftovers: Vec<Leftover>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.leftovers.is_empty()
    }

    fn deleted(&mut self, kind: ResourceKind, id: &str) {
        self.deleted.push((kind, id.to_string()));
    }

    fn leftover(&mut self, kind: ResourceKind, id: &str, err: &ProviderError) {
        error!(%kind, id, error = %err, "resource not confirmed deleted");
        self.leftovers.push(Leftover {
            kind,
            id: id.to_string(),
            error: err.to_string(),
        });
    }
}

/// Tear down everything recorded in `resources`, clearing each entry once
/// the provider confirms it gone.
pub async fn teardown(provider: &CapacityProvider, resources: &mut ResourceConfig) -> TeardownReport {
    let mut report = TeardownReport::default();
    let unterminated = resources.unterminated_instances();
    info!(
        instances = unterminated.len(),
        alarms = resources.alarm_names.len(),
        load_balancer = resources.load_balancer_arn.is_some(),
        target_group = resources.target_group_arn.is_some(),
        "tearing down"
    );

    // Alarms.
    if !resources.alarm_names.is_empty() {
        let names = resources.alarm_names.clone();
        match provider.delete_alarms(&names).await {
            Ok(()) => {
                for name in &names {
                    report.deleted(ResourceKind::Alarm, name);
                }
                resources.alarm_names.clear();
            }
            Err(e) => {
                for name in &names {
                    report.leftover(ResourceKind::Alarm, name, &e);
                }
            }
        }
    }

    // Deregister before terminating so the balancer stops routing first.
    if let Some(tg) = resources.target_group_arn.clone() {
        for id in resources.registered_ids() {
            match provider.deregister_from_balancer(&tg, &id).await {
                Ok(()) => mark(resources, &id, InstanceState::Deregistered),
                Err(e) => warn!(instance = %id, error = %e, "deregistration failed, terminating anyway"),
            }
        }
    }

    let mut terminating = Vec::new();
    for id in unterminated {
        match provider.terminate_instance(&id).await {
            Ok(()) => terminating.push(id),
            Err(e) => report.leftover(ResourceKind::Instance, &id, &e),
        }
    }

    if let Some(arn) = resources.load_balancer_arn.clone() {
        match provider.delete_load_balancer(&arn).await {
            Ok(()) => {
                report.deleted(ResourceKind::LoadBalancer, &arn);
                resources.load_balancer_arn = None;
                resources.load_balancer_dns = None;
                resources.listener_arn = None;
            }
            Err(e) => report.leftover(ResourceKind::LoadBalancer, &arn, &e),
        }
    }

    if let Some(arn) = resources.target_group_arn.clone() {
        match provider.delete_target_group(&arn).await {
            Ok(()) => {
                report.deleted(ResourceKind::TargetGroup, &arn);
                resources.target_group_arn = None;
            }
            Err(e) => report.leftover(ResourceKind::TargetGroup, &arn, &e),
        }
    }

    // Security groups refuse deletion while an instance still uses them.
    for id in terminating {
        match provider.await_terminated(&id).await {
            Ok(()) => {
                report.deleted(ResourceKind::Instance, &id);
                mark(resources, &id, InstanceState::Terminated);
            }
            Err(e) => report.leftover(ResourceKind::Instance, &id, &e),
        }
    }

    for slot in [
        &mut resources.web_service_security_group_id,
        &mut resources.load_generator_security_group_id,
    ] {
        let Some(id) = slot.clone() else { continue };
        match provider.delete_security_group(&id).await {
            Ok(()) => {
                report.deleted(ResourceKind::SecurityGroup, &id);
                *slot = None;
            }
            Err(e) => report.leftover(ResourceKind::SecurityGroup, &id, &e),
        }
    }

    if report.is_clean() {
        info!(deleted = report.deleted.len(), "teardown complete");
    } else {
        error!(
            deleted = report.deleted.len(),
            leftovers = report.leftovers.len(),
            "teardown incomplete, tagged resources remain"
        );
    }
    report
}

fn mark(resources: &mut ResourceConfig, id: &str, state: InstanceState) {
    if let Err(e) = resources.mark(id, state) {
        warn!(error = %e, "ignoring out-of-order lifecycle update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_is_clean() {
        let mut report = TeardownReport::default();
        assert!(report.is_clean());
        report.leftover(
            ResourceKind::SecurityGroup,
            "sg-1",
            &ProviderError::Throttled("busy".into()),
        );
        assert!(!report.is_clean());
        assert_eq!(report.leftovers[0].id, "sg-1");
    }
}
