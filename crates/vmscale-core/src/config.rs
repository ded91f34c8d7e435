//! vmscale.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the load generator is pointed at the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    /// Web services are submitted to the load generator one by one.
    Horizontal,
    /// Web services sit behind a load balancer; the load generator only
    /// sees the balancer's DNS name.
    #[default]
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleConfig {
    #[serde(default)]
    pub mode: TestMode,
    pub load_generator_ami: String,
    pub web_service_ami: String,
    pub instance_type: String,
    pub region: Option<String>,
    #[serde(default)]
    pub names: NamesConfig,
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub alarms: AlarmsConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamesConfig {
    pub load_generator_security_group: String,
    pub web_service_security_group: String,
    pub target_group: String,
    pub load_balancer: String,
    pub launch_template: String,
    pub auto_scaling_group: String,
}

impl Default for NamesConfig {
    fn default() -> Self {
        Self {
            load_generator_security_group: "lg-security-group".to_string(),
            web_service_security_group: "elb-asg-security-group".to_string(),
            target_group: "vm-scaling-tg".to_string(),
            load_balancer: "vm-scaling-lb".to_string(),
            launch_template: "vm-scaling-lt".to_string(),
            auto_scaling_group: "vm-scaling-asg".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TagsConfig {
    pub project: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub eol: String,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            project: "vm-scaling".to_string(),
            kind: "Project".to_string(),
            role: "Test".to_string(),
            eol: "20201230".to_string(),
        }
    }
}

/// Which samples count toward scale-in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScaleInTrigger {
    /// Never scale in.
    Disabled,
    /// A sample counts when `rps >= rps_target * ratio`.
    Headroom { ratio: f64 },
}

impl Default for ScaleInTrigger {
    fn default() -> Self {
        ScaleInTrigger::Headroom { ratio: 1.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub rps_target: f64,
    pub min_size: u32,
    pub max_size: u32,
    pub initial_size: u32,
    pub scale_out_step: u32,
    pub scale_in_step: u32,
    pub scale_out_cooldown: Option<String>,
    pub scale_in_cooldown: Option<String>,
    pub default_cooldown: String,
    pub scale_out_evaluation_periods: u32,
    pub scale_in_evaluation_periods: u32,
    pub scale_in_trigger: ScaleInTrigger,
    pub cooldown_from_test_start: bool,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            rps_target: 50.0,
            min_size: 1,
            max_size: 5,
            initial_size: 1,
            scale_out_step: 1,
            scale_in_step: 1,
            scale_out_cooldown: None,
            scale_in_cooldown: None,
            default_cooldown: "100s".to_string(),
            scale_out_evaluation_periods: 1,
            scale_in_evaluation_periods: 3,
            scale_in_trigger: ScaleInTrigger::default(),
            cooldown_from_test_start: true,
        }
    }
}

impl ScalingConfig {
    pub fn scale_out_cooldown(&self) -> Duration {
        self.cooldown_or_default(self.scale_out_cooldown.as_deref())
    }

    pub fn scale_in_cooldown(&self) -> Duration {
        self.cooldown_or_default(self.scale_in_cooldown.as_deref())
    }

    fn cooldown_or_default(&self, value: Option<&str>) -> Duration {
        value
            .and_then(parse_duration)
            .or_else(|| parse_duration(&self.default_cooldown))
            .unwrap_or(Duration::from_secs(100))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmsConfig {
    pub enabled: bool,
    pub period: String,
    pub cpu_upper_threshold: f64,
    pub cpu_lower_threshold: f64,
    pub evaluation_periods_scale_out: u32,
    pub evaluation_periods_scale_in: u32,
}

impl Default for AlarmsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period: "60s".to_string(),
            cpu_upper_threshold: 80.0,
            cpu_lower_threshold: 20.0,
            evaluation_periods_scale_out: 1,
            evaluation_periods_scale_in: 3,
        }
    }
}

impl AlarmsConfig {
    pub fn period(&self) -> Duration {
        parse_duration(&self.period).unwrap_or(Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval: String,
    pub retry_delay: String,
    pub request_timeout: String,
    pub provider_timeout: String,
    /// Upper bound on load-generator RPC attempts. Unbounded when absent.
    pub rpc_max_attempts: Option<u32>,
    pub log_dir: PathBuf,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: "1s".to_string(),
            retry_delay: "100ms".to_string(),
            request_timeout: "10s".to_string(),
            provider_timeout: "120s".to_string(),
            rpc_max_attempts: None,
            log_dir: PathBuf::from("."),
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn retry_delay(&self) -> Duration {
        parse_duration(&self.retry_delay).unwrap_or(Duration::from_millis(100))
    }

    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn provider_timeout(&self) -> Duration {
        parse_duration(&self.provider_timeout).unwrap_or(Duration::from_secs(120))
    }
}

/// Address plan for the in-memory cloud.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SandboxConfig {
    pub load_generator: Option<String>,
    pub load_balancer: Option<String>,
    pub web_services: Vec<String>,
}

/// Problems found by [`ScaleConfig::validate`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    Missing(&'static str),

    #[error("min_size ({min}) is greater than max_size ({max})")]
    SizeBounds { min: u32, max: u32 },

    #[error("initial_size ({initial}) is outside [{min}, {max}]")]
    InitialSize { initial: u32, min: u32, max: u32 },

    #[error("rps_target must be positive, got {0}")]
    RpsTarget(f64),

    #[error("{0} must be at least 1")]
    ZeroPeriods(&'static str),

    #[error("headroom ratio must be at least 1.0, got {0}")]
    HeadroomRatio(f64),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },
}

impl ScaleConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ScaleConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.load_generator_ami.trim().is_empty() {
            return Err(ConfigError::Missing("load_generator_ami"));
        }
        if self.web_service_ami.trim().is_empty() {
            return Err(ConfigError::Missing("web_service_ami"));
        }
        if self.instance_type.trim().is_empty() {
            return Err(ConfigError::Missing("instance_type"));
        }

        let s = &self.scaling;
        if s.min_size > s.max_size {
            return Err(ConfigError::SizeBounds {
                min: s.min_size,
                max: s.max_size,
            });
        }
        if s.initial_size < s.min_size || s.initial_size > s.max_size || s.initial_size == 0 {
            return Err(ConfigError::InitialSize {
                initial: s.initial_size,
                min: s.min_size,
                max: s.max_size,
            });
        }
        if !(s.rps_target > 0.0) {
            return Err(ConfigError::RpsTarget(s.rps_target));
        }
        if s.scale_out_evaluation_periods == 0 {
            return Err(ConfigError::ZeroPeriods("scale_out_evaluation_periods"));
        }
        if s.scale_in_evaluation_periods == 0 {
            return Err(ConfigError::ZeroPeriods("scale_in_evaluation_periods"));
        }
        if let ScaleInTrigger::Headroom { ratio } = s.scale_in_trigger
            && !(ratio >= 1.0)
        {
            return Err(ConfigError::HeadroomRatio(ratio));
        }

        let durations: [(&'static str, Option<&str>); 8] = [
            ("scaling.scale_out_cooldown", s.scale_out_cooldown.as_deref()),
            ("scaling.scale_in_cooldown", s.scale_in_cooldown.as_deref()),
            ("scaling.default_cooldown", Some(&s.default_cooldown)),
            ("alarms.period", Some(&self.alarms.period)),
            ("timing.poll_interval", Some(&self.timing.poll_interval)),
            ("timing.retry_delay", Some(&self.timing.retry_delay)),
            ("timing.request_timeout", Some(&self.timing.request_timeout)),
            ("timing.provider_timeout", Some(&self.timing.provider_timeout)),
        ];
        for (field, value) in durations {
            if let Some(value) = value
                && parse_duration(value).is_none()
            {
                return Err(ConfigError::Duration {
                    field,
                    value: value.to_string(),
                });
            }
        }

        Ok(())
    }

    /// The scale-in trigger in effect. The load generator has no endpoint
    /// for removing a target in horizontal mode, so scale-in is off there.
    pub fn effective_scale_in_trigger(&self) -> ScaleInTrigger {
        match self.mode {
            TestMode::Horizontal => ScaleInTrigger::Disabled,
            TestMode::Balanced => self.scaling.scale_in_trigger,
        }
    }
}

/// Parse a duration string like "5s", "500ms", "2m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.trim().parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.trim().parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
