use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub staging: StagingConfig,
    pub domains: DomainsConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_address: String,
    pub port: u16,
    /// Name used in the greeting and EHLO reply
    pub hostname: String,
    pub max_message_size: usize,
    pub max_recipients: usize,
    /// Upper bound on bodies being spooled at the same time
    pub max_concurrent_spools: usize,
    pub command_timeout_seconds: u64,
    /// Classify at RCPT TO and reject domains that are not allow-listed
    #[serde(default = "default_true")]
    pub reject_unknown_at_rcpt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainsConfig {
    /// Allow-listed root domains (`main.tld`)
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub dns: DnsCheckConfig,
    #[serde(default = "default_dkim")]
    pub dkim: ExternalCheckConfig,
    #[serde(default = "default_spf")]
    pub spf: ExternalCheckConfig,
    #[serde(default)]
    pub spam: SpamCheckConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsCheckConfig {
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub check_sender: bool,
    #[serde(default = "default_true")]
    pub check_recipients: bool,
    /// Port probed on each MX host
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_seconds: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCheckConfig {
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamCheckConfig {
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_seconds: u64,
    /// Reject messages scoring at or above this value
    #[serde(default)]
    pub reject_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Http,
    Spool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Broker endpoint receiving `POST`ed jobs (http backend)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Directory receiving job files (spool backend)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_queue_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no allowed domains configured")]
    NoDomains,

    #[error("invalid allowed domain '{0}': expected main.tld")]
    InvalidDomain(String),

    #[error("server.max_concurrent_spools must be greater than zero")]
    NoSpoolCapacity,

    #[error("queue backend '{backend}' requires '{key}'")]
    MissingQueueSetting { backend: &'static str, key: &'static str },

    #[error("invalid queue endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        source: url::ParseError,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    25
}

fn default_lookup_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_tool_timeout() -> u64 {
    10
}

fn default_queue_timeout() -> u64 {
    10
}

fn default_dkim() -> ExternalCheckConfig {
    ExternalCheckConfig {
        enabled: false,
        command: "dkimverify".to_string(),
        args: Vec::new(),
        timeout_seconds: default_tool_timeout(),
    }
}

fn default_spf() -> ExternalCheckConfig {
    ExternalCheckConfig {
        enabled: false,
        command: "spfquery-verify".to_string(),
        args: Vec::new(),
        timeout_seconds: default_tool_timeout(),
    }
}

impl Default for DnsCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_sender: true,
            check_recipients: true,
            port: default_smtp_port(),
            lookup_timeout_seconds: default_lookup_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            dns: DnsCheckConfig::default(),
            dkim: default_dkim(),
            spf: default_spf(),
            spam: SpamCheckConfig::default(),
        }
    }
}

impl Default for SpamCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "spamc".to_string(),
            args: vec!["-c".to_string()],
            timeout_seconds: default_tool_timeout(),
            reject_threshold: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                listen_address: "0.0.0.0".to_string(),
                port: 25,
                hostname: "mailgate.localdomain".to_string(),
                max_message_size: 25 * 1024 * 1024,
                max_recipients: 100,
                max_concurrent_spools: 64,
                command_timeout_seconds: 300,
                reject_unknown_at_rcpt: true,
            },
            staging: StagingConfig {
                dir: PathBuf::from("/var/spool/mailgate/tmp"),
            },
            domains: DomainsConfig {
                allowed: vec!["example.com".to_string()],
            },
            validation: ValidationConfig::default(),
            queue: QueueConfig {
                backend: QueueBackend::Http,
                endpoint: Some("http://127.0.0.1:3000/queues/inbound-mail-parse/jobs".to_string()),
                dir: None,
                timeout_seconds: default_queue_timeout(),
            },
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.normalize();
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Lowercase and trim the allow-list so it compares against classified
    /// root domains.
    pub fn normalize(&mut self) {
        self.domains.allowed = self
            .domains
            .allowed
            .iter()
            .map(|d| d.trim().trim_end_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
    }

    /// Apply `MAILGATE_*` overrides on top of the file values.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("MAILGATE_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "MAILGATE_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(dir) = lookup("MAILGATE_STAGING_DIR") {
            self.staging.dir = PathBuf::from(dir);
        }
        if let Some(domains) = lookup("MAILGATE_DOMAINS") {
            self.domains.allowed = domains.split(',').map(|d| d.to_string()).collect();
        }

        let flag = |key: &str| -> Result<Option<bool>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(value) => match value.to_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Some(true)),
                    "false" | "0" | "no" => Ok(Some(false)),
                    _ => Err(ConfigError::InvalidEnv {
                        key: key.to_string(),
                        value,
                    }),
                },
            }
        };

        if let Some(disabled) = flag("MAILGATE_DISABLE_DNS")? {
            self.validation.dns.enabled = !disabled;
        }
        if let Some(disabled) = flag("MAILGATE_DISABLE_DKIM")? {
            self.validation.dkim.enabled = !disabled;
        }
        if let Some(disabled) = flag("MAILGATE_DISABLE_SPF")? {
            self.validation.spf.enabled = !disabled;
        }
        if let Some(disabled) = flag("MAILGATE_DISABLE_SPAM_SCORE")? {
            self.validation.spam.enabled = !disabled;
        }

        self.normalize();
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domains.allowed.is_empty() {
            return Err(ConfigError::NoDomains);
        }
        for domain in &self.domains.allowed {
            let labels: Vec<&str> = domain.split('.').collect();
            if labels.len() != 2 || labels.iter().any(|l| l.is_empty()) {
                return Err(ConfigError::InvalidDomain(domain.clone()));
            }
        }
        if self.server.max_concurrent_spools == 0 {
            return Err(ConfigError::NoSpoolCapacity);
        }
        match self.queue.backend {
            QueueBackend::Http => {
                let endpoint = self.queue.endpoint.as_ref().ok_or(
                    ConfigError::MissingQueueSetting {
                        backend: "http",
                        key: "endpoint",
                    },
                )?;
                url::Url::parse(endpoint).map_err(|source| ConfigError::InvalidEndpoint {
                    endpoint: endpoint.clone(),
                    source,
                })?;
            }
            QueueBackend::Spool => {
                if self.queue.dir.is_none() {
                    return Err(ConfigError::MissingQueueSetting {
                        backend: "spool",
                        key: "dir",
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.validation.dns.enabled);
        assert!(!config.validation.dkim.enabled);
        assert!(!config.validation.spf.enabled);
        assert!(!config.validation.spam.enabled);
    }

    #[test]
    fn test_yaml_round_trip_and_defaults() {
        let yaml = r#"
server:
  listen_address: 127.0.0.1
  port: 2525
  hostname: mx.example.com
  max_message_size: 1048576
  max_recipients: 10
  max_concurrent_spools: 4
  command_timeout_seconds: 30
staging:
  dir: /tmp/mailgate
domains:
  allowed: ["Example.COM", "test.org."]
validation:
  dns:
    enabled: true
queue:
  backend: spool
  dir: /tmp/mailgate-jobs
"#;
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.normalize();

        assert_eq!(config.server.port, 2525);
        assert!(config.server.reject_unknown_at_rcpt);
        assert_eq!(config.domains.allowed, vec!["example.com", "test.org"]);
        assert!(config.validation.dns.enabled);
        assert_eq!(config.validation.dns.port, 25);
        assert_eq!(config.validation.spam.command, "spamc");
        assert_eq!(config.queue.backend, QueueBackend::Spool);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MAILGATE_PORT", "2626"),
            ("MAILGATE_DOMAINS", "One.com,two.net"),
            ("MAILGATE_DISABLE_DNS", "false"),
            ("MAILGATE_DISABLE_SPAM_SCORE", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 2626);
        assert_eq!(config.domains.allowed, vec!["one.com", "two.net"]);
        assert!(config.validation.dns.enabled);
        assert!(!config.validation.spam.enabled);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|key| {
            (key == "MAILGATE_DISABLE_DKIM").then(|| "maybe".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_setups() {
        let mut config = Config::default();
        config.domains.allowed = vec!["sub.example.com".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDomain(_))));

        let mut config = Config::default();
        config.domains.allowed.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoDomains)));

        let mut config = Config::default();
        config.queue.endpoint = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingQueueSetting { .. })
        ));

        let mut config = Config::default();
        config.queue.endpoint = Some("not a url".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
    }
}
