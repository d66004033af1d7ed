//! OF-017: Provider configuration.
//!
//! Parsed from the `provider:` block of a declaration. Unset connection
//! fields are filled from `OPENNEBULA_*` environment variables through an
//! injectable lookup.

use crate::error::{Error, Result};
use crate::template::tags::TagMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const ENV_ENDPOINT: &str = "OPENNEBULA_ENDPOINT";
pub const ENV_FLOW_ENDPOINT: &str = "OPENNEBULA_FLOW_ENDPOINT";
pub const ENV_USERNAME: &str = "OPENNEBULA_USERNAME";
pub const ENV_PASSWORD: &str = "OPENNEBULA_PASSWORD";
pub const ENV_INSECURE: &str = "OPENNEBULA_INSECURE";

/// Connection and behaviour settings shared by every resource.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// XML-RPC endpoint URL
    #[serde(default)]
    pub endpoint: Option<String>,

    /// OneFlow endpoint URL
    #[serde(default)]
    pub flow_endpoint: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    /// Never written back out
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Skip TLS verification
    #[serde(default)]
    pub insecure: bool,

    /// Tags merged into every taggable resource
    #[serde(default)]
    pub default_tags: TagMap,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub poll: PollConfig,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("endpoint", &self.endpoint)
            .field("flow_endpoint", &self.flow_endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("insecure", &self.insecure)
            .field("default_tags", &self.default_tags)
            .field("timeouts", &self.timeouts)
            .field("poll", &self.poll)
            .finish()
    }
}

/// Operation timeouts as duration strings (`"90s"`, `"5m"`, `"1h30m"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timeouts {
    #[serde(default = "default_timeout")]
    pub create: String,
    #[serde(default = "default_timeout")]
    pub update: String,
    #[serde(default = "default_timeout")]
    pub delete: String,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: default_timeout(),
            update: default_timeout(),
            delete: default_timeout(),
        }
    }
}

fn default_timeout() -> String {
    "5m".to_string()
}

/// State poller pacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    /// Wait before the first refresh
    #[serde(default = "default_delay")]
    pub delay: String,
    /// Wait between refreshes
    #[serde(default = "default_min_interval")]
    pub min_interval: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            delay: default_delay(),
            min_interval: default_min_interval(),
        }
    }
}

fn default_delay() -> String {
    "10s".to_string()
}

fn default_min_interval() -> String {
    "3s".to_string()
}

/// Which CRUD operation a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn key(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl ProviderConfig {
    /// Fill unset fields from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let fill = |slot: &mut Option<String>, var: &str| {
            if slot.is_none() {
                *slot = lookup(var).filter(|v| !v.is_empty());
            }
        };
        fill(&mut self.endpoint, ENV_ENDPOINT);
        fill(&mut self.flow_endpoint, ENV_FLOW_ENDPOINT);
        fill(&mut self.username, ENV_USERNAME);
        fill(&mut self.password, ENV_PASSWORD);
        if !self.insecure {
            self.insecure = lookup(ENV_INSECURE)
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false);
        }
    }

    /// [`ProviderConfig::apply_env`] against the process environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env(|var| std::env::var(var).ok());
    }

    /// Check URLs and duration strings.
    pub fn validate(&self) -> Result<()> {
        for (field, url) in [
            ("endpoint", &self.endpoint),
            ("flow_endpoint", &self.flow_endpoint),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(Error::Config(format!(
                        "{} must be an http(s) URL, got \"{}\"",
                        field, url
                    )));
                }
            }
        }
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            self.timeout(op)?;
        }
        self.poll_delay()?;
        self.poll_min_interval()?;
        Ok(())
    }

    pub fn timeout(&self, op: Operation) -> Result<Duration> {
        let text = match op {
            Operation::Create => &self.timeouts.create,
            Operation::Update => &self.timeouts.update,
            Operation::Delete => &self.timeouts.delete,
        };
        parse_duration(text)
    }

    pub fn poll_delay(&self) -> Result<Duration> {
        parse_duration(&self.poll.delay)
    }

    pub fn poll_min_interval(&self) -> Result<Duration> {
        parse_duration(&self.poll.min_interval)
    }
}

/// Parse a duration like `"500ms"`, `"90s"`, `"5m"` or `"1h30m"`.
pub fn parse_duration(text: &str) -> Result<Duration> {
    humantime::parse_duration(text.trim())
        .map_err(|e| Error::Config(format!("invalid duration \"{}\": {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_of017_defaults() {
        let config: ProviderConfig = serde_yaml_ng::from_str("endpoint: http://one:2633/RPC2").unwrap();
        assert_eq!(config.timeout(Operation::Create).unwrap(), Duration::from_secs(300));
        assert_eq!(config.poll_delay().unwrap(), Duration::from_secs(10));
        assert_eq!(config.poll_min_interval().unwrap(), Duration::from_secs(3));
        assert!(!config.insecure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_of017_env_fills_unset_fields() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_ENDPOINT, "http://env:2633/RPC2"),
            (ENV_USERNAME, "env-user"),
            (ENV_PASSWORD, "secret"),
            (ENV_INSECURE, "true"),
        ]);
        let mut config = ProviderConfig {
            username: Some("declared".to_string()),
            ..Default::default()
        };
        config.apply_env(|var| env.get(var).map(|v| v.to_string()));
        assert_eq!(config.endpoint.as_deref(), Some("http://env:2633/RPC2"));
        assert_eq!(config.username.as_deref(), Some("declared"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert!(config.insecure);
        assert!(config.flow_endpoint.is_none());
    }

    #[test]
    fn test_of017_password_never_serialized() {
        let config = ProviderConfig {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let yaml = serde_yaml_ng::to_string(&config).unwrap();
        assert!(!yaml.contains("hunter2"));
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_of017_parse_duration() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("soon").is_err());
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(2 * 86400));
    }

    #[test]
    fn test_of017_validate_rejects_bad_values() {
        let config = ProviderConfig {
            endpoint: Some("one:2633".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let mut config = ProviderConfig::default();
        config.timeouts.delete = "soon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_of017_unknown_field_rejected() {
        let err = serde_yaml_ng::from_str::<ProviderConfig>("endpiont: x");
        assert!(err.is_err());
    }
}
