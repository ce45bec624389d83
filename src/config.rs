use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

use crate::backends::StoreKind;
use crate::rotation::RotationSettings;
use crate::scheduler::DailySchedule;

/// Name of the most privileged rule. It only rotates with an explicit opt-in.
pub const ADMIN_RULE: &str = "AdminAccess";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub namespace: NamespaceConfig,
    #[serde(default)]
    pub secret_store: SecretStoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Explicit rule list; the built-in rule set is used when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default = "default_resource_group")]
    pub resource_group: String,
    #[serde(default = "default_namespace")]
    pub name: String,
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretStoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_vault_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_region: Option<String>,
}

/// Azure credentials. A service principal is used when all three fields are
/// set; otherwise the managed identity of the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rotate_admin_access: bool,
    #[serde(default = "default_secret_prefix")]
    pub secret_prefix: String,
    /// Daily trigger time, `HH:MM[:SS]` in UTC.
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub run_on_startup: bool,
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
    #[serde(default = "default_propagation_delay")]
    pub propagation_delay_seconds: u64,
    #[serde(default = "default_secret_expiry_days")]
    pub secret_expiry_days: u32,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_seconds: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub rule_name: String,
    pub secret_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_secret_name: Option<String>,
}

/// A validated rule/secret pair taking part in rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationRuleSpec {
    pub rule_name: String,
    pub secret_name: String,
    pub enabled: bool,
    /// Destination for the secondary key. Without one the secondary slot is
    /// regenerated for freshness only and its value is discarded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_secret_name: Option<String>,
}

impl AuthorizationRuleSpec {
    pub fn new(rule_name: &str, secret_name: &str, enabled: bool) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            secret_name: secret_name.to_string(),
            enabled,
            secondary_secret_name: None,
        }
    }

    pub fn with_secondary_secret(mut self, secret_name: &str) -> Self {
        self.secondary_secret_name = Some(secret_name.to_string());
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_resource_group() -> String {
    "rg-azpolicy-dev-eastus".to_string()
}

fn default_namespace() -> String {
    "sb-azpolicy-dev-eastus-001".to_string()
}

fn default_management_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_store_kind() -> StoreKind {
    StoreKind::KeyVault
}

fn default_secret_prefix() -> String {
    "servicebus".to_string()
}

fn default_schedule() -> String {
    "00:00".to_string()
}

fn default_grace_period() -> u64 {
    300
}

fn default_propagation_delay() -> u64 {
    30
}

fn default_secret_expiry_days() -> u32 {
    30
}

fn default_lock_ttl() -> u64 {
    300
}

fn default_call_timeout() -> u64 {
    30
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            resource_group: default_resource_group(),
            name: default_namespace(),
            management_endpoint: default_management_endpoint(),
        }
    }
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            key_vault_uri: None,
            aws_region: None,
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rotate_admin_access: false,
            secret_prefix: default_secret_prefix(),
            schedule: default_schedule(),
            run_on_startup: false,
            grace_period_seconds: default_grace_period(),
            propagation_delay_seconds: default_propagation_delay(),
            secret_expiry_days: default_secret_expiry_days(),
            lock_ttl_seconds: default_lock_ttl(),
            call_timeout_seconds: default_call_timeout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable value for {}: {:?}", key, raw);
            default
        }),
        None => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env_string(key)
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

pub(crate) fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Key Vault secret names: 1-127 ASCII alphanumerics and hyphens.
fn validate_secret_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 127 {
        bail!("Secret name '{}' must be 1-127 characters", name);
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        bail!(
            "Secret name '{}' may only contain ASCII letters, digits and hyphens",
            name
        );
    }
    Ok(())
}

/// The built-in rule set for a namespace.
pub fn default_rules(prefix: &str, rotate_admin_access: bool) -> Vec<AuthorizationRuleSpec> {
    vec![
        AuthorizationRuleSpec::new(
            "FunctionAppAccess",
            &format!("{}-function-app-connection-string", prefix),
            true,
        ),
        AuthorizationRuleSpec::new(
            "ReadOnlyAccess",
            &format!("{}-read-only-connection-string", prefix),
            true,
        ),
        AuthorizationRuleSpec::new(
            ADMIN_RULE,
            &format!("{}-admin-connection-string", prefix),
            rotate_admin_access,
        ),
    ]
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let namespace = NamespaceConfig {
            subscription_id: env_string("AZURE_SUBSCRIPTION_ID").unwrap_or_default(),
            resource_group: env_string("SERVICE_BUS_RESOURCE_GROUP")
                .unwrap_or_else(default_resource_group),
            name: env_string("SERVICE_BUS_NAMESPACE").unwrap_or_else(default_namespace),
            management_endpoint: env_string("AZURE_MANAGEMENT_ENDPOINT")
                .unwrap_or_else(default_management_endpoint),
        };

        let kind = match env_string("SECRET_STORE") {
            Some(raw) => raw.parse::<StoreKind>().map_err(anyhow::Error::msg)?,
            None => default_store_kind(),
        };
        let secret_store = SecretStoreConfig {
            kind,
            key_vault_uri: env_string("KEY_VAULT_URI"),
            aws_region: env_string("AWS_REGION"),
        };

        let auth = AuthConfig {
            tenant_id: env_string("AZURE_TENANT_ID"),
            client_id: env_string("AZURE_CLIENT_ID"),
            client_secret: env_string("AZURE_CLIENT_SECRET"),
        };

        let rotation = RotationConfig {
            enabled: env_bool("ROTATION_ENABLED", true),
            rotate_admin_access: env_bool("ROTATE_ADMIN_ACCESS", false),
            secret_prefix: env_string("SECRET_PREFIX").unwrap_or_else(default_secret_prefix),
            schedule: env_string("ROTATION_SCHEDULE").unwrap_or_else(default_schedule),
            run_on_startup: env_bool("ROTATION_RUN_ON_STARTUP", false),
            grace_period_seconds: env_parse("GRACE_PERIOD_SECONDS", default_grace_period()),
            propagation_delay_seconds: env_parse(
                "PROPAGATION_DELAY_SECONDS",
                default_propagation_delay(),
            ),
            secret_expiry_days: env_parse("SECRET_EXPIRY_DAYS", default_secret_expiry_days()),
            lock_ttl_seconds: env_parse("LOCK_TTL_SECONDS", default_lock_ttl()),
            call_timeout_seconds: env_parse("CALL_TIMEOUT_SECONDS", default_call_timeout()),
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", default_retry_max_attempts()),
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", default_retry_base_delay_ms()),
        };

        let server = ServerConfig {
            listen: env_string("LISTEN_ADDR").unwrap_or_else(default_listen),
        };

        Ok(Self {
            namespace,
            secret_store,
            auth,
            rotation,
            server,
            rules: Vec::new(),
        })
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let sample = Self {
            namespace: NamespaceConfig {
                subscription_id: "00000000-0000-0000-0000-000000000000".to_string(),
                ..NamespaceConfig::default()
            },
            secret_store: SecretStoreConfig {
                key_vault_uri: Some("https://kv-azpolicy-dev-eastus.vault.azure.net/".to_string()),
                ..SecretStoreConfig::default()
            },
            ..Self::default()
        };

        let toml_string =
            toml::to_string_pretty(&sample).context("Failed to serialize sample config")?;
        fs::write(path.as_ref(), toml_string)
            .with_context(|| format!("Failed to write sample config to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Build the validated rule list, falling back to the built-in rules.
    pub fn rule_specs(&self) -> Result<Vec<AuthorizationRuleSpec>> {
        let mut specs: Vec<AuthorizationRuleSpec> = if self.rules.is_empty() {
            default_rules(&self.rotation.secret_prefix, self.rotation.rotate_admin_access)
        } else {
            self.rules
                .iter()
                .map(|r| AuthorizationRuleSpec {
                    rule_name: r.rule_name.trim().to_string(),
                    secret_name: r.secret_name.trim().to_string(),
                    enabled: r.enabled,
                    secondary_secret_name: r.secondary_secret_name.clone(),
                })
                .collect()
        };

        let mut seen_rules = HashSet::new();
        let mut seen_secrets = HashSet::new();
        for spec in &mut specs {
            if spec.rule_name.is_empty() {
                bail!("Authorization rule names must not be empty");
            }
            if !seen_rules.insert(spec.rule_name.clone()) {
                bail!("Authorization rule '{}' is configured twice", spec.rule_name);
            }
            validate_secret_name(&spec.secret_name)?;
            if !seen_secrets.insert(spec.secret_name.clone()) {
                bail!("Secret '{}' is mapped to more than one rule", spec.secret_name);
            }
            if let Some(ref secondary) = spec.secondary_secret_name {
                validate_secret_name(secondary)?;
                if !seen_secrets.insert(secondary.clone()) {
                    bail!("Secret '{}' is mapped to more than one rule", secondary);
                }
            }
            if spec.rule_name == ADMIN_RULE && spec.enabled && !self.rotation.rotate_admin_access {
                warn!(
                    "{} is enabled in the rule list but rotate_admin_access is off; leaving it disabled",
                    ADMIN_RULE
                );
                spec.enabled = false;
            }
        }

        Ok(specs)
    }

    /// Check everything that can be checked before touching Azure.
    pub fn validate(&self) -> Result<Vec<AuthorizationRuleSpec>> {
        let rotation = &self.rotation;
        rotation
            .schedule
            .parse::<DailySchedule>()
            .map_err(anyhow::Error::msg)
            .context("Invalid rotation schedule")?;

        if !(1..=365).contains(&rotation.secret_expiry_days) {
            bail!(
                "secret_expiry_days must be between 1 and 365, got {}",
                rotation.secret_expiry_days
            );
        }
        if rotation.lock_ttl_seconds == 0 {
            bail!("lock_ttl_seconds must be greater than zero");
        }
        if rotation.call_timeout_seconds == 0 {
            bail!("call_timeout_seconds must be greater than zero");
        }
        if rotation.retry_max_attempts == 0 {
            bail!("retry_max_attempts must be at least 1");
        }
        let call_window = RotationSettings::from_config(rotation).max_call_window();
        if std::time::Duration::from_secs(rotation.lock_ttl_seconds) <= call_window {
            bail!(
                "lock_ttl_seconds ({}) must exceed the longest retried call ({:?}: call_timeout_seconds x retry_max_attempts plus backoff)",
                rotation.lock_ttl_seconds,
                call_window
            );
        }

        self.rule_specs()
    }

    /// Endpoint of the configured secret store, for display.
    pub fn secret_store_endpoint(&self) -> String {
        match self.secret_store.kind {
            StoreKind::KeyVault => self.secret_store.key_vault_uri.clone().unwrap_or_default(),
            StoreKind::Aws => format!(
                "aws-secretsmanager:{}",
                self.secret_store.aws_region.as_deref().unwrap_or("default-region")
            ),
        }
    }
}
