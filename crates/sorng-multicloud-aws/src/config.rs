//! Adapter configuration, access environments and region handling.
//!
//! The access environment is explicit configuration and is never inferred
//! from a region name: it selects the ARN partition, the endpoint DNS
//! suffix and the default region.

use crate::error::{AwsError, AwsResult};
use crate::retry::{Backoff, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Regions ─────────────────────────────────────────────────────────────

/// Regions of the global partition.
pub const GLOBAL_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "af-south-1",
    "ap-east-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ca-central-1",
    "ca-west-1",
    "eu-central-1",
    "eu-central-2",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-south-1",
    "eu-south-2",
    "eu-north-1",
    "il-central-1",
    "me-south-1",
    "me-central-1",
    "sa-east-1",
    // GovCloud shares the global credentials store
    "us-gov-east-1",
    "us-gov-west-1",
];

/// Regions of the China partition.
pub const CHINA_REGIONS: &[&str] = &["cn-north-1", "cn-northwest-1"];

lazy_static::lazy_static! {
    static ref REGION_NAME: Option<regex::Regex> =
        regex::Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d{1,2}$").ok();
}

/// Whether `region` is shaped like a region name, e.g. `ap-southeast-5`.
pub fn is_region_name(region: &str) -> bool {
    REGION_NAME
        .as_ref()
        .map(|re| re.is_match(region))
        .unwrap_or(false)
}

/// The default role assumed in member accounts.
pub const DEFAULT_ASSUME_ROLE_NAME: &str = "OrganizationAccountAccessRole";

// ── Access environment ──────────────────────────────────────────────────

/// Which provider partition the credentials belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AccessEnvironment {
    #[default]
    #[serde(alias = "InternationalCloud")]
    Global,
    #[serde(alias = "ChinaCloud")]
    China,
}

impl AccessEnvironment {
    /// ARN partition string.
    pub fn partition(&self) -> &'static str {
        match self {
            Self::Global => "aws",
            Self::China => "aws-cn",
        }
    }

    /// DNS suffix of service endpoints.
    pub fn dns_suffix(&self) -> &'static str {
        match self {
            Self::Global => "amazonaws.com",
            Self::China => "amazonaws.com.cn",
        }
    }

    pub fn default_region(&self) -> &'static str {
        match self {
            Self::Global => "us-west-1",
            Self::China => "cn-north-1",
        }
    }

    /// Region that signs requests for partition-global services
    /// (IAM, Route 53, Organizations).
    pub fn global_signing_region(&self) -> &'static str {
        match self {
            Self::Global => "us-east-1",
            Self::China => "cn-northwest-1",
        }
    }

    /// Prefix of provider-managed IAM policy ARNs.
    pub fn managed_policy_prefix(&self) -> String {
        format!("arn:{}:iam::aws:policy/", self.partition())
    }

    /// Built-in region table, used when `DescribeRegions` is unavailable.
    pub fn regions(&self) -> &'static [&'static str] {
        match self {
            Self::Global => GLOBAL_REGIONS,
            Self::China => CHINA_REGIONS,
        }
    }

    /// Whether `region` belongs to this partition. Regions missing from
    /// the built-in table are accepted when their name fits the partition.
    pub fn has_region(&self, region: &str) -> bool {
        if self.regions().contains(&region) {
            return true;
        }
        is_region_name(region) && region.starts_with("cn-") == (*self == Self::China)
    }
}

// ── Credentials ─────────────────────────────────────────────────────────

/// Root credentials. Immutable for the lifetime of a client handle.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Account whose role is assumed when a session asks for it.
    #[serde(default)]
    pub owner_account_id: Option<String>,
    /// Cross-account role; [`DEFAULT_ASSUME_ROLE_NAME`] when absent.
    #[serde(default)]
    pub role_name: Option<String>,
    #[serde(default)]
    pub access_environment: AccessEnvironment,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("owner_account_id", &self.owner_account_id)
            .field("role_name", &self.role_name)
            .field("access_environment", &self.access_environment)
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key_id: &str, secret_access_key: &str, env: AccessEnvironment) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            owner_account_id: None,
            role_name: None,
            access_environment: env,
        }
    }

    pub fn with_owner_account(mut self, account_id: &str) -> Self {
        self.owner_account_id = Some(account_id.to_string());
        self
    }

    pub fn with_role_name(mut self, role_name: &str) -> Self {
        self.role_name = Some(role_name.to_string());
        self
    }

    pub fn role_name(&self) -> &str {
        self.role_name
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_ASSUME_ROLE_NAME)
    }

    /// ARN of the role assumed in the owner account, if one is configured.
    pub fn assume_role_arn(&self) -> Option<String> {
        let owner = self.owner_account_id.as_deref().filter(|o| !o.is_empty())?;
        Some(format!(
            "arn:{}:iam::{}:role/{}",
            self.access_environment.partition(),
            owner,
            self.role_name()
        ))
    }
}

// ── Retry configuration ─────────────────────────────────────────────────

/// Retry settings for the dispatcher's throttling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (default: 3).
    pub max_attempts: u32,
    /// Backoff base in milliseconds (default: 3000).
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds (default: 60000).
    pub max_delay_ms: u64,
    /// Full jitter on the exponential delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 3_000,
            max_delay_ms: 60_000,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            backoff: Backoff::Exponential { jitter: self.jitter },
        }
    }
}

// ── Adapter configuration ───────────────────────────────────────────────

/// Full adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub credentials: Credentials,
    /// Region used when a caller passes an empty region. Falls back to the
    /// access environment's default.
    #[serde(default)]
    pub default_region: Option<String>,
    /// Display name of the cloud account, used to name sub-accounts.
    #[serde(default)]
    pub account_name: String,
    /// Log request and response bodies.
    #[serde(default)]
    pub debug: bool,
    /// Refuse every mutating API before it is signed.
    #[serde(default)]
    pub read_only: bool,
    /// Custom endpoint URL (for LocalStack and similar emulators).
    #[serde(default)]
    pub endpoint_override: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl AdapterConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            default_region: None,
            account_name: String::new(),
            debug: false,
            read_only: false,
            endpoint_override: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn access_environment(&self) -> AccessEnvironment {
        self.credentials.access_environment
    }

    /// Resolve the region a call should use. An empty `region` means the
    /// configured default.
    pub fn resolve_region(&self, region: &str) -> AwsResult<String> {
        let region = if region.is_empty() {
            match self.default_region.as_deref() {
                Some(r) if !r.is_empty() => r,
                _ => self.access_environment().default_region(),
            }
        } else {
            region
        };
        self.check_region(region)?;
        Ok(region.to_string())
    }

    fn check_region(&self, region: &str) -> AwsResult<()> {
        if self.endpoint_override.is_some() {
            return Ok(());
        }
        let env = self.access_environment();
        if !env.has_region(region) {
            return Err(AwsError::configuration(&format!(
                "region '{}' is not part of the {} partition",
                region,
                env.partition()
            )));
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> AwsResult<()> {
        if self.credentials.access_key_id.is_empty() {
            return Err(AwsError::configuration("access key id is required"));
        }
        if self.credentials.secret_access_key.is_empty() {
            return Err(AwsError::configuration("secret access key is required"));
        }
        if let Some(region) = self.default_region.as_deref().filter(|r| !r.is_empty()) {
            self.check_region(region)?;
        }
        let key = &self.credentials.access_key_id;
        if !key.starts_with("AKIA") && !key.starts_with("ASIA") {
            log::warn!(
                "Access key id '{}' has unusual prefix; expected AKIA* or ASIA*",
                key.chars().take(4).collect::<String>()
            );
        }
        Ok(())
    }

    /// Load a JSON configuration document.
    pub fn from_json(json: &str) -> AwsResult<Self> {
        let mut config: Self = serde_json::from_str(json)
            .map_err(|e| AwsError::configuration(&format!("invalid configuration: {}", e)))?;
        if config.default_region.is_none() {
            config.default_region = Some(config.access_environment().default_region().to_string());
        }
        config.validate()?;
        Ok(config)
    }

    /// Resolve credentials from the standard environment variables.
    pub fn from_environment(env: AccessEnvironment) -> AwsResult<Self> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| AwsError::configuration("AWS_ACCESS_KEY_ID is not set"))?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| AwsError::configuration("AWS_SECRET_ACCESS_KEY is not set"))?;
        let region = std::env::var("AWS_DEFAULT_REGION")
            .or_else(|_| std::env::var("AWS_REGION"))
            .unwrap_or_else(|_| env.default_region().to_string());
        let mut config = Self::new(Credentials::new(&access_key, &secret_key, env));
        config.default_region = Some(region);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AdapterConfig {
        AdapterConfig::new(Credentials::new("AKIAEXAMPLE", "secret", AccessEnvironment::Global))
    }

    #[test]
    fn partitions_follow_access_environment() {
        assert_eq!(AccessEnvironment::Global.partition(), "aws");
        assert_eq!(AccessEnvironment::China.partition(), "aws-cn");
        assert_eq!(AccessEnvironment::China.dns_suffix(), "amazonaws.com.cn");
        assert_eq!(
            AccessEnvironment::China.managed_policy_prefix(),
            "arn:aws-cn:iam::aws:policy/"
        );
    }

    #[test]
    fn assume_role_arn_uses_partition_and_default_role() {
        let creds = Credentials::new("AKIA1", "s", AccessEnvironment::China).with_owner_account("123456789012");
        assert_eq!(
            creds.assume_role_arn().as_deref(),
            Some("arn:aws-cn:iam::123456789012:role/OrganizationAccountAccessRole")
        );
        let creds = creds.with_role_name("Ops");
        assert_eq!(
            creds.assume_role_arn().as_deref(),
            Some("arn:aws-cn:iam::123456789012:role/Ops")
        );
    }

    #[test]
    fn no_assume_role_without_owner() {
        let creds = Credentials::new("AKIA1", "s", AccessEnvironment::Global);
        assert!(creds.assume_role_arn().is_none());
    }

    #[test]
    fn empty_region_falls_back_to_partition_default() {
        assert_eq!(config().resolve_region("").unwrap(), "us-west-1");
    }

    #[test]
    fn empty_region_uses_default() {
        let mut cfg = config();
        cfg.default_region = Some("eu-west-1".into());
        assert_eq!(cfg.resolve_region("").unwrap(), "eu-west-1");
        assert_eq!(cfg.resolve_region("us-east-2").unwrap(), "us-east-2");
    }

    #[test]
    fn cross_partition_region_is_rejected() {
        let err = config().resolve_region("cn-north-1").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn regions_outside_the_builtin_table() {
        let cfg = config();
        assert_eq!(cfg.resolve_region("mx-central-1").unwrap(), "mx-central-1");
        assert_eq!(cfg.resolve_region("ap-southeast-7").unwrap(), "ap-southeast-7");
        assert!(cfg.resolve_region("cn-southwest-1").is_err());
        assert!(cfg.resolve_region("moon-base").is_err());
        assert!(cfg.resolve_region("US-EAST-1").is_err());
        assert!(AccessEnvironment::China.has_region("cn-southwest-1"));
        assert!(!AccessEnvironment::China.has_region("eu-west-1"));
    }

    /// Renders every record so log arguments are actually evaluated.
    struct Rendering;

    impl log::Log for Rendering {
        fn enabled(&self, _: &log::Metadata<'_>) -> bool {
            true
        }
        fn log(&self, record: &log::Record<'_>) {
            let _ = record.args().to_string();
        }
        fn flush(&self) {}
    }

    static RENDERING: Rendering = Rendering;

    #[test]
    fn unusual_key_prefix_is_only_a_warning() {
        let _ = log::set_logger(&RENDERING);
        log::set_max_level(log::LevelFilter::Warn);
        let mut cfg = config();
        cfg.credentials.access_key_id = "a\u{e9}\u{e9}".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_requires_keys() {
        let mut cfg = config();
        cfg.credentials.secret_access_key.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_json_fills_default_region() {
        let json = r#"{"credentials":{"access_key_id":"AKIA1","secret_access_key":"s","access_environment":"ChinaCloud"}}"#;
        let cfg = AdapterConfig::from_json(json).unwrap();
        assert_eq!(cfg.access_environment(), AccessEnvironment::China);
        assert_eq!(cfg.default_region.as_deref(), Some("cn-north-1"));
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = Credentials::new("AKIA1", "topsecret", AccessEnvironment::Global);
        assert!(!format!("{:?}", creds).contains("topsecret"));
    }
}
