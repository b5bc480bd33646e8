//! Sub-account enumeration.
//!
//! Discovery and fallback are two explicit steps: [`OrganizationClient::discover`]
//! returns either the organization or the reason it is unavailable, and
//! [`OrganizationClient::list_sub_accounts`] maps each branch to accounts.

pub use crate::account::CallerIdentity;
use crate::config::AdapterConfig;
use crate::dispatcher::{ApiCall, Dispatcher};
use crate::error::{AwsError, AwsResult, ErrorKind};
use crate::pagination::{collect_pages, Page};
use crate::params::Params;
use crate::transport::CallContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a member account as the caller sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubAccountState {
    Active,
    Pending,
    Suspended,
    /// Root credentials cannot assume member roles.
    NoPermission,
}

impl SubAccountState {
    fn from_provider(status: &str) -> Self {
        match status {
            "ACTIVE" => Self::Active,
            "SUSPENDED" => Self::Suspended,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAccount {
    pub id: String,
    pub name: String,
    pub state: SubAccountState,
    pub is_master: bool,
    pub joined_at: Option<DateTime<Utc>>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Organization {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub arn: String,
    #[serde(default)]
    pub master_account_id: String,
    #[serde(default)]
    pub master_account_email: Option<String>,
    #[serde(default)]
    pub feature_set: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeOrganizationResult {
    #[serde(default)]
    organization: Option<Organization>,
}

/// A member account as listed by the provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrganizationAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub arn: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub status: String,
    /// Epoch seconds.
    #[serde(default)]
    pub joined_timestamp: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListAccountsResult {
    #[serde(default)]
    accounts: Vec<OrganizationAccount>,
    #[serde(default)]
    next_token: Option<String>,
}

/// What discovery found.
#[derive(Debug)]
pub enum OrganizationView {
    Organization {
        organization: Organization,
        accounts: Vec<OrganizationAccount>,
    },
    /// No organization is visible; carries the error that said so.
    Standalone { reason: AwsError },
}

/// Errors that mean "enumerate this account alone".
pub fn degrades_to_standalone(err: &AwsError) -> bool {
    matches!(err.kind, ErrorKind::AccessDenied | ErrorKind::Throttled)
        || err.code == "AWSOrganizationsNotInUseException"
}

pub struct OrganizationClient<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> OrganizationClient<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Identity of the root credentials.
    pub async fn caller_identity(&self, ctx: &CallContext) -> AwsResult<CallerIdentity> {
        self.dispatcher.caller_identity(ctx).await
    }

    /// Step one: look for an organization.
    pub async fn discover(&self, ctx: &CallContext) -> AwsResult<OrganizationView> {
        let described: AwsResult<DescribeOrganizationResult> = self
            .dispatcher
            .fetch(ctx, &ApiCall::new("organizations", "DescribeOrganization"))
            .await;
        let organization = match described {
            Ok(result) => result.organization.unwrap_or_default(),
            Err(err) if degrades_to_standalone(&err) => {
                return Ok(OrganizationView::Standalone { reason: err })
            }
            Err(err) => return Err(err),
        };

        let listed = collect_pages(|token| async move {
            let call = ApiCall::new("organizations", "ListAccounts")
                .params(Params::new().with_opt("NextToken", token));
            let page: ListAccountsResult = self.dispatcher.fetch(ctx, &call).await?;
            Ok(Page {
                items: page.accounts,
                next_token: page.next_token,
            })
        })
        .await;
        match listed {
            Ok(accounts) => Ok(OrganizationView::Organization {
                organization,
                accounts,
            }),
            Err(err) if degrades_to_standalone(&err) => Ok(OrganizationView::Standalone { reason: err }),
            Err(err) => Err(err),
        }
    }

    /// Step two: every account the credentials can see.
    pub async fn list_sub_accounts(&self, ctx: &CallContext) -> AwsResult<Vec<SubAccount>> {
        let identity = match self.caller_identity(ctx).await {
            Ok(identity) => Some(identity),
            Err(err) => {
                log::warn!("GetCallerIdentity failed, using configured account: {}", err);
                None
            }
        };

        let config = self.dispatcher.config();
        match self.discover(ctx).await? {
            OrganizationView::Standalone { reason } => {
                log::warn!(
                    "Organization unavailable ({}), enumerating single account",
                    reason.code
                );
                Ok(vec![standalone_account(config, identity.as_ref())])
            }
            OrganizationView::Organization {
                organization,
                accounts,
            } => Ok(map_accounts(config, &organization, accounts, identity.as_ref())),
        }
    }
}

/// The only account when no organization is visible.
pub fn standalone_account(config: &AdapterConfig, identity: Option<&CallerIdentity>) -> SubAccount {
    let id = identity
        .map(|i| i.account.clone())
        .filter(|a| !a.is_empty())
        .or_else(|| config.credentials.owner_account_id.clone())
        .unwrap_or_default();
    let name = if config.account_name.is_empty() {
        id.clone()
    } else {
        config.account_name.clone()
    };
    SubAccount {
        id,
        name,
        state: SubAccountState::Active,
        is_master: true,
        joined_at: None,
        email: None,
    }
}

/// Map organization members. The master is named after the caller's
/// display name; every other account is `<name>/<id>`.
pub fn map_accounts(
    config: &AdapterConfig,
    organization: &Organization,
    accounts: Vec<OrganizationAccount>,
    identity: Option<&CallerIdentity>,
) -> Vec<SubAccount> {
    let root_caller = identity.map(CallerIdentity::is_root).unwrap_or(false);
    let mut master_seen = false;
    accounts
        .into_iter()
        .map(|acct| {
            let is_master = !master_seen && acct.id == organization.master_account_id;
            master_seen |= is_master;
            let name = if is_master {
                if config.account_name.is_empty() {
                    acct.name.clone()
                } else {
                    format!("{}/{}", config.account_name, acct.name)
                }
            } else {
                format!("{}/{}", acct.name, acct.id)
            };
            let state = if !is_master && root_caller {
                SubAccountState::NoPermission
            } else {
                SubAccountState::from_provider(&acct.status)
            };
            SubAccount {
                id: acct.id,
                name,
                state,
                is_master,
                joined_at: acct
                    .joined_timestamp
                    .and_then(|ts| DateTime::from_timestamp(ts.trunc() as i64, 0)),
                email: acct.email,
            }
        })
        .collect()
}

/// Configuration that dispatches into `account` through the cross-account
/// role. The master keeps the root credentials.
pub fn sub_account_config(config: &AdapterConfig, account: &SubAccount) -> AdapterConfig {
    let mut derived = config.clone();
    derived.account_name = account.name.clone();
    derived.credentials.owner_account_id = if account.is_master {
        None
    } else {
        Some(account.id.clone())
    };
    derived
}
