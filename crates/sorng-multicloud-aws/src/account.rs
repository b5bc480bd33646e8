//! Account-level discovery: the regions the credentials can reach and the
//! identity behind them.
//!
//! Both answers are cached on the [`Dispatcher`]. Regions come from EC2
//! `DescribeRegions` and are kept for two hours; when the call is
//! unavailable the partition's built-in region table is used instead.

use crate::config::AccessEnvironment;
use crate::dispatcher::{ApiCall, Dispatcher};
use crate::error::{AwsError, AwsResult};
use crate::transport::CallContext;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;

/// How long a `DescribeRegions` answer is reused.
pub const REGION_CACHE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// One region as EC2 reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionInfo {
    #[serde(default)]
    pub region_name: String,
    #[serde(default)]
    pub region_endpoint: String,
    /// `opt-in-not-required`, `opted-in` or `not-opted-in`.
    #[serde(default)]
    pub opt_in_status: Option<String>,
}

impl RegionInfo {
    fn builtin(region: &str, env: AccessEnvironment) -> Self {
        Self {
            region_name: region.to_string(),
            region_endpoint: format!("ec2.{}.{}", region, env.dns_suffix()),
            opt_in_status: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeRegionsResult {
    #[serde(default, deserialize_with = "crate::xml::de::one_or_many")]
    region_info: Vec<RegionInfo>,
}

/// Result of STS GetCallerIdentity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallerIdentity {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub arn: String,
    #[serde(default)]
    pub user_id: String,
}

impl CallerIdentity {
    /// Whether the caller is the account's root principal.
    pub fn is_root(&self) -> bool {
        self.arn.ends_with(":root")
    }
}

#[derive(Debug, Default)]
pub(crate) struct AccountCache {
    regions: RwLock<Option<(Instant, Vec<RegionInfo>)>>,
    identity: OnceCell<CallerIdentity>,
}

impl Dispatcher {
    /// Every region of the partition, opted in or not.
    ///
    /// `AuthFailure` means the access key itself is bad and is surfaced.
    /// Other failures fall back to the built-in region table without
    /// caching it.
    pub async fn regions(&self, ctx: &CallContext) -> AwsResult<Vec<RegionInfo>> {
        if let Some((fetched_at, regions)) = &*self.account().regions.read().await {
            if fetched_at.elapsed() < REGION_CACHE_TTL {
                return Ok(regions.clone());
            }
        }

        let call = ApiCall::new("ec2", "DescribeRegions").param("AllRegions", true);
        let described: AwsResult<DescribeRegionsResult> = self.fetch(ctx, &call).await;
        match described {
            Ok(result) if !result.region_info.is_empty() => {
                log::debug!("DescribeRegions returned {} regions", result.region_info.len());
                *self.account().regions.write().await = Some((Instant::now(), result.region_info.clone()));
                Ok(result.region_info)
            }
            Ok(_) => Ok(self.builtin_regions()),
            Err(err) if err.code == "AuthFailure" => Err(AwsError {
                message: format!("invalid access key: {}", err.message),
                ..err
            }),
            Err(err) if ctx.is_cancelled() || ctx.is_expired() => Err(err),
            Err(err) => {
                log::warn!("DescribeRegions failed, using built-in region table: {}", err);
                Ok(self.builtin_regions())
            }
        }
    }

    fn builtin_regions(&self) -> Vec<RegionInfo> {
        let env = self.config().access_environment();
        env.regions()
            .iter()
            .map(|region| RegionInfo::builtin(region, env))
            .collect()
    }

    /// Identity of the root credentials, fetched once.
    pub async fn caller_identity(&self, ctx: &CallContext) -> AwsResult<CallerIdentity> {
        self.account()
            .identity
            .get_or_try_init(|| async {
                self.fetch(ctx, &ApiCall::new("sts", "GetCallerIdentity")).await
            })
            .await
            .cloned()
    }

    /// The account the credentials belong to: the configured owner, or the
    /// caller identity's account when none is configured.
    pub async fn account_id(&self, ctx: &CallContext) -> AwsResult<String> {
        if let Some(owner) = self
            .config()
            .credentials
            .owner_account_id
            .as_deref()
            .filter(|o| !o.is_empty())
        {
            return Ok(owner.to_string());
        }
        let identity = self.caller_identity(ctx).await?;
        if identity.account.is_empty() {
            return Err(AwsError::malformed("sts", "GetCallerIdentity returned no account", 200));
        }
        Ok(identity.account)
    }
}
