//! EC2 instances behind the resource-wrapper contract.

use crate::dispatcher::{ApiCall, Dispatcher};
use crate::error::{AwsError, AwsResult};
use crate::params::Params;
use crate::resource::{map_status, CloudResource, ResourceCollection, ResourcePage, ResourceStatus, StatusTable};
use crate::tags::{ec2_resource_arn, TagMap, TaggingClient};
use crate::transport::CallContext;
use crate::wait::wait_until;
use crate::xml::de::one_or_many;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const SERVICE: &str = "ec2";
const RESOURCE_TYPE: &str = "instance";

/// EC2 instance state names. Unlisted states (shutting-down, terminated)
/// map to `Unknown`.
pub const INSTANCE_STATUS: StatusTable = &[
    ("running", ResourceStatus::Running),
    ("pending", ResourceStatus::Starting),
    ("stopping", ResourceStatus::Stopping),
    ("stopped", ResourceStatus::Ready),
];

// ── Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceState {
    #[serde(default, deserialize_with = "crate::xml::de::i64_from_str")]
    pub code: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[serde(default)]
    pub availability_zone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ec2Tag {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// One instance as DescribeInstances reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescription {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub instance_state: InstanceState,
    #[serde(default)]
    pub placement: Option<Placement>,
    #[serde(default)]
    pub private_ip_address: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub launch_time: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub tag_set: Vec<Ec2Tag>,
}

impl InstanceDescription {
    pub fn tags(&self) -> TagMap {
        self.tag_set
            .iter()
            .map(|t| (t.key.clone(), t.value.clone()))
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reservation {
    #[serde(default)]
    owner_id: String,
    #[serde(default, deserialize_with = "one_or_many")]
    instances_set: Vec<InstanceDescription>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeInstancesResult {
    #[serde(default, deserialize_with = "one_or_many")]
    reservation_set: Vec<Reservation>,
    #[serde(default)]
    next_token: Option<String>,
}

// ── Wrapper ─────────────────────────────────────────────────────────────

/// A live instance. Reads are served from the last fetch until
/// [`CloudResource::refresh`].
#[derive(Clone)]
pub struct Ec2Instance {
    dispatcher: Arc<Dispatcher>,
    region: String,
    owner_id: String,
    data: InstanceDescription,
}

impl std::fmt::Debug for Ec2Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ec2Instance")
            .field("region", &self.region)
            .field("owner_id", &self.owner_id)
            .field("data", &self.data)
            .finish()
    }
}

impl Ec2Instance {
    pub fn description(&self) -> &InstanceDescription {
        &self.data
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn arn(&self) -> String {
        ec2_resource_arn(
            self.dispatcher.config().access_environment(),
            &self.region,
            &self.owner_id,
            RESOURCE_TYPE,
            &self.data.instance_id,
        )
    }

    fn tagging(&self) -> TaggingClient<'_> {
        TaggingClient::new(&self.dispatcher, &self.region)
    }

    async fn state_change(&self, ctx: &CallContext, api: &str, extra: Params) -> AwsResult<()> {
        let call = ApiCall::new(SERVICE, api)
            .region(&self.region)
            .params(extra.with("InstanceId", vec![self.data.instance_id.as_str()]));
        self.dispatcher.invoke_value(ctx, &call).await?;
        Ok(())
    }

    pub async fn start(&self, ctx: &CallContext) -> AwsResult<()> {
        self.state_change(ctx, "StartInstances", Params::new()).await
    }

    pub async fn stop(&self, ctx: &CallContext, force: bool) -> AwsResult<()> {
        self.state_change(ctx, "StopInstances", Params::new().with("Force", force))
            .await
    }

    /// Refresh every `interval` until the status is `target`.
    pub async fn wait_status(
        &mut self,
        ctx: &CallContext,
        target: ResourceStatus,
        interval: Duration,
        deadline: Duration,
    ) -> AwsResult<()> {
        let collection = InstanceCollection::new(self.dispatcher.clone(), &self.region);
        let instance_id = self.data.instance_id.clone();
        let (collection, instance_id) = (&collection, instance_id.as_str());
        let latest = wait_until(ctx, "instance status", interval, deadline, move || async move {
            let current = collection.get(ctx, instance_id).await?;
            Ok((current.status() == target).then_some(current))
        })
        .await?;
        *self = latest;
        Ok(())
    }
}

#[async_trait]
impl CloudResource for Ec2Instance {
    fn resource_type(&self) -> &'static str {
        RESOURCE_TYPE
    }

    fn global_id(&self) -> String {
        self.data.instance_id.clone()
    }

    /// The `Name` tag, or the instance id when untagged.
    fn name(&self) -> String {
        self.data
            .tag_set
            .iter()
            .find(|t| t.key == "Name" && !t.value.is_empty())
            .map(|t| t.value.clone())
            .unwrap_or_else(|| self.data.instance_id.clone())
    }

    fn status(&self) -> ResourceStatus {
        map_status(INSTANCE_STATUS, &self.data.instance_state.name)
    }

    async fn refresh(&mut self, ctx: &CallContext) -> AwsResult<()> {
        let latest = InstanceCollection::new(self.dispatcher.clone(), &self.region)
            .get(ctx, &self.data.instance_id)
            .await?;
        *self = latest;
        Ok(())
    }

    async fn delete(&self, ctx: &CallContext) -> AwsResult<()> {
        log::info!("terminating instance {}", self.data.instance_id);
        self.state_change(ctx, "TerminateInstances", Params::new()).await
    }

    async fn get_tags(&self, ctx: &CallContext) -> AwsResult<TagMap> {
        self.tagging().get_tags(ctx, &self.arn()).await
    }

    async fn set_tags(&self, ctx: &CallContext, tags: &TagMap, replace: bool) -> AwsResult<()> {
        let arn = self.arn();
        let tagging = self.tagging();
        let current = tagging.get_tags(ctx, &arn).await?;
        tagging.set_tags(ctx, &arn, &current, tags, replace).await?;
        Ok(())
    }
}

// ── Collection ──────────────────────────────────────────────────────────

pub struct InstanceCollection {
    dispatcher: Arc<Dispatcher>,
    region: String,
}

impl InstanceCollection {
    pub fn new(dispatcher: Arc<Dispatcher>, region: &str) -> Self {
        Self {
            dispatcher,
            region: region.to_string(),
        }
    }

    async fn describe(&self, ctx: &CallContext, params: Params) -> AwsResult<(Vec<Ec2Instance>, Option<String>)> {
        let call = ApiCall::new(SERVICE, "DescribeInstances")
            .region(&self.region)
            .params(params);
        let result: DescribeInstancesResult = self.dispatcher.fetch(ctx, &call).await?;
        let instances = result
            .reservation_set
            .into_iter()
            .flat_map(|reservation| {
                let owner_id = reservation.owner_id;
                reservation
                    .instances_set
                    .into_iter()
                    .map(move |data| (owner_id.clone(), data))
            })
            .map(|(owner_id, data)| Ec2Instance {
                dispatcher: self.dispatcher.clone(),
                region: self.region.clone(),
                owner_id,
                data,
            })
            .collect();
        Ok((instances, result.next_token))
    }
}

#[async_trait]
impl ResourceCollection for InstanceCollection {
    type Item = Ec2Instance;

    fn resource_type(&self) -> &'static str {
        RESOURCE_TYPE
    }

    async fn get(&self, ctx: &CallContext, id: &str) -> AwsResult<Ec2Instance> {
        if id.is_empty() {
            return Err(AwsError::invalid_parameter(SERVICE, "empty instance id"));
        }
        let (instances, _) = self
            .describe(ctx, Params::new().with("InstanceId", vec![id]))
            .await?;
        instances
            .into_iter()
            .find(|i| i.data.instance_id == id)
            .ok_or_else(|| AwsError::not_found(SERVICE, &format!("instance {} not found", id)))
    }

    async fn list_page(
        &self,
        ctx: &CallContext,
        token: Option<String>,
        page_size: Option<i64>,
    ) -> AwsResult<ResourcePage<Ec2Instance>> {
        let params = Params::new()
            .with_opt("NextToken", token)
            .with_opt("MaxResults", page_size);
        let (items, next_token) = self.describe(ctx, params).await?;
        Ok(ResourcePage { items, next_token })
    }
}
