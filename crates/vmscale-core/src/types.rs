//! Domain types shared by the provider, the policy engine and the
//! controller.
//!
//! `ResourceConfig` is the one record of everything the controller has
//! created. It is written during provisioning and scaling, and read back
//! during teardown; anything missing from it will not be cleaned up.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TagsConfig;

/// Provider-assigned instance identifier.
pub type InstanceId = String;

/// `Name` tag value for the load generator instance.
pub const LOAD_GENERATOR_NAME: &str = "Load Generator";

/// `Name` tag value for web-service instances.
pub const WEB_SERVICE_NAME: &str = "Web Service";

// ── Instance lifecycle ────────────────────────────────────────────

/// Lifecycle of an instance as seen by the controller.
///
/// Ordering matters: transitions only ever move to a later variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Launch issued, provider has not reported Running yet.
    Requested,
    Running,
    /// Member of the target group / submitted to the load generator.
    Registered,
    Deregistered,
    Terminated,
}

impl InstanceState {
    /// Whether the instance may be picked for scale-in.
    pub fn is_scale_in_candidate(self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Registered)
    }

    /// Whether the instance still counts toward fleet size.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            InstanceState::Requested | InstanceState::Running | InstanceState::Registered
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("instance {id} cannot move from {from:?} back to {to:?}")]
pub struct LifecycleError {
    pub id: InstanceId,
    pub from: InstanceState,
    pub to: InstanceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    LoadGenerator,
    WebService,
}

/// An instance the controller launched and must eventually terminate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub role: InstanceRole,
    /// Public DNS name, known once the instance is Running.
    pub public_dns: Option<String>,
    pub state: InstanceState,
}

impl InstanceRecord {
    pub fn requested(id: impl Into<InstanceId>, role: InstanceRole) -> Self {
        Self {
            id: id.into(),
            role,
            public_dns: None,
            state: InstanceState::Requested,
        }
    }

    /// Move the instance forward. Re-entering the current state is a no-op.
    pub fn advance(&mut self, next: InstanceState) -> Result<(), LifecycleError> {
        if next < self.state {
            return Err(LifecycleError {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

// ── Ownership tags ────────────────────────────────────────────────

/// Fixed label set attached to every created resource so that leftovers
/// can be found and cleaned up externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipTags {
    pub project: String,
    pub kind: String,
    pub role: String,
    pub eol: String,
}

impl OwnershipTags {
    /// Key/value pairs, with an optional `Name` tag appended.
    pub fn to_pairs(&self, name: Option<&str>) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("Project".to_string(), self.project.clone()),
            ("Type".to_string(), self.kind.clone()),
            ("Role".to_string(), self.role.clone()),
            ("EOL".to_string(), self.eol.clone()),
        ];
        if let Some(name) = name {
            pairs.push(("Name".to_string(), name.to_string()));
        }
        pairs
    }
}

impl From<&TagsConfig> for OwnershipTags {
    fn from(cfg: &TagsConfig) -> Self {
        Self {
            project: cfg.project.clone(),
            kind: cfg.kind.clone(),
            role: cfg.role.clone(),
            eol: cfg.eol.clone(),
        }
    }
}

// ── Resource configuration ────────────────────────────────────────

/// Identifiers produced during setup and consumed during teardown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub network_id: Option<String>,
    pub load_generator_security_group_id: Option<String>,
    pub web_service_security_group_id: Option<String>,
    pub load_generator: Option<InstanceRecord>,
    pub target_group_arn: Option<String>,
    pub load_balancer_arn: Option<String>,
    pub load_balancer_dns: Option<String>,
    pub listener_arn: Option<String>,
    pub alarm_names: Vec<String>,
    /// Web-service instances in launch order.
    pub web_services: Vec<InstanceRecord>,
}

impl ResourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_generator_dns(&self) -> Option<&str> {
        self.load_generator
            .as_ref()
            .and_then(|lg| lg.public_dns.as_deref())
    }

    /// Web services that count toward fleet size (not yet on their way out).
    pub fn fleet_size(&self) -> u32 {
        self.web_services
            .iter()
            .filter(|ws| ws.state.is_live())
            .count() as u32
    }

    /// Ids currently registered with the target group / load generator.
    pub fn registered_ids(&self) -> Vec<InstanceId> {
        self.web_services
            .iter()
            .filter(|ws| ws.state == InstanceState::Registered)
            .map(|ws| ws.id.clone())
            .collect()
    }

    /// Scale-in candidates, most recently launched first. Requested
    /// instances are never candidates.
    pub fn scale_in_candidates(&self) -> Vec<InstanceId> {
        self.web_services
            .iter()
            .rev()
            .filter(|ws| ws.state.is_scale_in_candidate())
            .map(|ws| ws.id.clone())
            .collect()
    }

    pub fn web_service_mut(&mut self, id: &str) -> Option<&mut InstanceRecord> {
        self.web_services.iter_mut().find(|ws| ws.id == id)
    }

    /// Every instance that has not been confirmed terminated, load
    /// generator last.
    pub fn unterminated_instances(&self) -> Vec<InstanceId> {
        self.web_services
            .iter()
            .chain(self.load_generator.iter())
            .filter(|i| i.state != InstanceState::Terminated)
            .map(|i| i.id.clone())
            .collect()
    }

    /// Record a state change for any tracked instance.
    pub fn mark(&mut self, id: &str, state: InstanceState) -> Result<(), LifecycleError> {
        if let Some(lg) = self.load_generator.as_mut()
            && lg.id == id
        {
            return lg.advance(state);
        }
        match self.web_service_mut(id) {
            Some(ws) => ws.advance(state),
            None => Ok(()),
        }
    }

    /// True when nothing was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.load_generator_security_group_id.is_none()
            && self.web_service_security_group_id.is_none()
            && self.load_generator.is_none()
            && self.target_group_arn.is_none()
            && self.load_balancer_arn.is_none()
            && self.alarm_names.is_empty()
            && self.web_services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws(id: &str, state: InstanceState) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            role: InstanceRole::WebService,
            public_dns: Some(format!("{id}.example")),
            state,
        }
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let mut rec = InstanceRecord::requested("i-1", InstanceRole::WebService);
        rec.advance(InstanceState::Running).unwrap();
        rec.advance(InstanceState::Registered).unwrap();

        let err = rec.advance(InstanceState::Running).unwrap_err();
        assert_eq!(err.from, InstanceState::Registered);
        assert_eq!(err.to, InstanceState::Running);
        assert_eq!(rec.state, InstanceState::Registered);
    }

    #[test]
    fn lifecycle_same_state_is_noop() {
        let mut rec = InstanceRecord::requested("i-1", InstanceRole::WebService);
        rec.advance(InstanceState::Running).unwrap();
        rec.advance(InstanceState::Running).unwrap();
        assert_eq!(rec.state, InstanceState::Running);
    }

    #[test]
    fn lifecycle_may_skip_forward() {
        let mut rec = InstanceRecord::requested("i-1", InstanceRole::WebService);
        rec.advance(InstanceState::Terminated).unwrap();
        assert_eq!(rec.state, InstanceState::Terminated);
    }

    #[test]
    fn requested_instances_are_not_scale_in_candidates() {
        let mut rc = ResourceConfig::new();
        rc.web_services.push(ws("i-1", InstanceState::Registered));
        rc.web_services.push(ws("i-2", InstanceState::Registered));
        rc.web_services.push(ws("i-3", InstanceState::Requested));

        assert_eq!(rc.scale_in_candidates(), vec!["i-2", "i-1"]);
        assert_eq!(rc.fleet_size(), 3);
    }

    #[test]
    fn fleet_size_excludes_departing_instances() {
        let mut rc = ResourceConfig::new();
        rc.web_services.push(ws("i-1", InstanceState::Registered));
        rc.web_services.push(ws("i-2", InstanceState::Deregistered));
        rc.web_services.push(ws("i-3", InstanceState::Terminated));
        assert_eq!(rc.fleet_size(), 1);
        assert_eq!(rc.registered_ids(), vec!["i-1"]);
    }

    #[test]
    fn unterminated_lists_load_generator_last() {
        let mut rc = ResourceConfig::new();
        rc.load_generator = Some(InstanceRecord {
            id: "i-lg".to_string(),
            role: InstanceRole::LoadGenerator,
            public_dns: Some("lg.example".to_string()),
            state: InstanceState::Running,
        });
        rc.web_services.push(ws("i-1", InstanceState::Registered));
        rc.web_services.push(ws("i-2", InstanceState::Terminated));

        assert_eq!(rc.unterminated_instances(), vec!["i-1", "i-lg"]);
        assert_eq!(rc.load_generator_dns(), Some("lg.example"));
    }

    #[test]
    fn mark_updates_load_generator_and_web_services() {
        let mut rc = ResourceConfig::new();
        rc.load_generator = Some(InstanceRecord::requested("i-lg", InstanceRole::LoadGenerator));
        rc.web_services.push(ws("i-1", InstanceState::Running));

        rc.mark("i-lg", InstanceState::Terminated).unwrap();
        rc.mark("i-1", InstanceState::Registered).unwrap();
        rc.mark("i-unknown", InstanceState::Terminated).unwrap();

        assert_eq!(rc.load_generator.as_ref().unwrap().state, InstanceState::Terminated);
        assert_eq!(rc.web_services[0].state, InstanceState::Registered);
        assert!(rc.mark("i-1", InstanceState::Requested).is_err());
    }

    #[test]
    fn empty_config_reports_empty() {
        let mut rc = ResourceConfig::new();
        assert!(rc.is_empty());
        rc.alarm_names.push("scale-out".to_string());
        assert!(!rc.is_empty());
    }

    #[test]
    fn ownership_tags_include_name_when_given() {
        let tags = OwnershipTags::from(&TagsConfig::default());
        let pairs = tags.to_pairs(Some(LOAD_GENERATOR_NAME));
        assert_eq!(pairs.len(), 5);
        assert_eq!(pairs[0], ("Project".to_string(), "vm-scaling".to_string()));
        assert_eq!(pairs[4], ("Name".to_string(), "Load Generator".to_string()));
        assert_eq!(tags.to_pairs(None).len(), 4);
    }
}
