//! Uniform resource-wrapper contract.
//!
//! Every resource type implements [`CloudResource`] for one object and
//! [`ResourceCollection`] for lookups and creation. Verbs a resource cannot
//! serve keep the default body, which fails with `NotSupported`.

use crate::error::{AwsError, AwsResult};
use crate::params::Params;
use crate::tags::TagMap;
use crate::transport::CallContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical lifecycle state, shared by every resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Provisioned and idle, e.g. a stopped VM that can be started.
    Ready,
    Updating,
    Deleting,
    Deleted,
    Failed,
    Unknown,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Ready => "ready",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Provider state string to canonical state, per resource type.
pub type StatusTable = &'static [(&'static str, ResourceStatus)];

/// Look `state` up in `table`; anything unlisted is `Unknown`.
pub fn map_status(table: StatusTable, state: &str) -> ResourceStatus {
    table
        .iter()
        .find(|(native, _)| *native == state)
        .map(|(_, status)| *status)
        .unwrap_or(ResourceStatus::Unknown)
}

/// The recognized verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
    Refresh,
    SetTags,
    GetTags,
    GetStatus,
    GetGlobalId,
    GetName,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "Get",
            Self::List => "List",
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Refresh => "Refresh",
            Self::SetTags => "SetTags",
            Self::GetTags => "GetTags",
            Self::GetStatus => "GetStatus",
            Self::GetGlobalId => "GetGlobalId",
            Self::GetName => "GetName",
        }
    }
}

/// The error every unsupported verb returns.
pub fn unsupported(resource_type: &str, verb: Verb) -> AwsError {
    AwsError::not_supported(
        resource_type,
        &format!("{} does not support {}", resource_type, verb.as_str()),
    )
    .with_action(verb.as_str())
}

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct ResourcePage<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// A single provider object.
#[async_trait]
pub trait CloudResource: Send + Sync {
    /// Short type name, e.g. `instance`.
    fn resource_type(&self) -> &'static str;

    /// Provider id, unique within the account and region.
    fn global_id(&self) -> String;

    fn name(&self) -> String;

    /// Canonical state as of the last fetch.
    fn status(&self) -> ResourceStatus;

    /// Re-read the object from the provider.
    async fn refresh(&mut self, _ctx: &CallContext) -> AwsResult<()> {
        Err(unsupported(self.resource_type(), Verb::Refresh))
    }

    async fn update(&mut self, _ctx: &CallContext, _changes: &Params) -> AwsResult<()> {
        Err(unsupported(self.resource_type(), Verb::Update))
    }

    async fn delete(&self, _ctx: &CallContext) -> AwsResult<()> {
        Err(unsupported(self.resource_type(), Verb::Delete))
    }

    async fn get_tags(&self, _ctx: &CallContext) -> AwsResult<TagMap> {
        Err(unsupported(self.resource_type(), Verb::GetTags))
    }

    /// Merge `tags` into the current set, or replace it entirely.
    async fn set_tags(&self, _ctx: &CallContext, _tags: &TagMap, _replace: bool) -> AwsResult<()> {
        Err(unsupported(self.resource_type(), Verb::SetTags))
    }
}

/// Lookups and creation for one resource type in one region.
#[async_trait]
pub trait ResourceCollection: Send + Sync {
    type Item: CloudResource;

    fn resource_type(&self) -> &'static str;

    async fn get(&self, _ctx: &CallContext, _id: &str) -> AwsResult<Self::Item> {
        Err(unsupported(self.resource_type(), Verb::Get))
    }

    /// One page; `token` comes from the previous page.
    async fn list_page(
        &self,
        _ctx: &CallContext,
        _token: Option<String>,
        _page_size: Option<i64>,
    ) -> AwsResult<ResourcePage<Self::Item>> {
        Err(unsupported(self.resource_type(), Verb::List))
    }

    /// Every item, following tokens until a page is empty or untokened.
    async fn list(&self, ctx: &CallContext) -> AwsResult<Vec<Self::Item>> {
        let mut items = Vec::new();
        let mut token = None;
        loop {
            let page = self.list_page(ctx, token, None).await?;
            let empty = page.items.is_empty();
            items.extend(page.items);
            match page.next_token.filter(|t| !t.is_empty()) {
                Some(next) if !empty => token = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn create(&self, _ctx: &CallContext, _spec: &Params) -> AwsResult<Self::Item> {
        Err(unsupported(self.resource_type(), Verb::Create))
    }
}
