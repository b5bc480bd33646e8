//! Tag reconciliation over the bulk tagging API.
//!
//! [`reconcile_tags`] computes what to remove and what to add;
//! [`TaggingClient::set_tags`] applies it, untagging first and tagging
//! second. The provider reserves the `aws:` key namespace.

use crate::config::AccessEnvironment;
use crate::dispatcher::{ApiCall, Dispatcher};
use crate::error::{AwsError, AwsResult};
use crate::params::{ParamValue, Params};
use crate::pagination::{collect_pages, Page};
use crate::transport::CallContext;
use serde::Deserialize;
use std::collections::BTreeMap;

pub type TagMap = BTreeMap<String, String>;

/// Key prefix reserved for the provider.
pub const RESERVED_TAG_PREFIX: &str = "aws:";

/// The tagging API accepts at most this many ARNs per call.
const MAX_ARNS_PER_CALL: usize = 20;

/// Changes needed to move a resource from one tag set to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub added: TagMap,
    pub removed: TagMap,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(RESERVED_TAG_PREFIX)
}

/// Diff `old` against `new`.
///
/// A key whose value changes shows up on both sides. With `replace`, keys
/// absent from `new` are removed too. Reserved keys in `new` are rejected;
/// reserved keys already on the resource are left alone.
pub fn reconcile_tags(old: &TagMap, new: &TagMap, replace: bool) -> AwsResult<TagDiff> {
    if let Some(key) = new.keys().find(|k| is_reserved_key(k)) {
        return Err(AwsError::invalid_parameter(
            "tagging",
            &format!("tag key '{}' uses the reserved '{}' prefix", key, RESERVED_TAG_PREFIX),
        ));
    }

    let mut diff = TagDiff::default();
    for (k, v) in new {
        match old.get(k) {
            None => {
                diff.added.insert(k.clone(), v.clone());
            }
            Some(prev) if prev != v => {
                diff.added.insert(k.clone(), v.clone());
                diff.removed.insert(k.clone(), prev.clone());
            }
            Some(_) => {}
        }
    }
    if replace {
        for (k, v) in old {
            if !new.contains_key(k) && !is_reserved_key(k) {
                diff.removed.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(diff)
}

/// ARN of an EC2 resource, e.g. `arn:aws:ec2:us-east-1:123:instance/i-1`.
pub fn ec2_resource_arn(
    env: AccessEnvironment,
    region: &str,
    account_id: &str,
    resource_type: &str,
    resource_id: &str,
) -> String {
    format!(
        "arn:{}:ec2:{}:{}:{}/{}",
        env.partition(),
        region,
        account_id,
        resource_type,
        resource_id
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FailureInfo {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    status_code: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagMutationResult {
    #[serde(default)]
    failed_resources_map: BTreeMap<String, FailureInfo>,
}

impl TagMutationResult {
    fn first_failure(self, api_name: &str) -> AwsResult<()> {
        match self.failed_resources_map.into_iter().next() {
            None => Ok(()),
            Some((arn, info)) => {
                let code = info.error_code.unwrap_or_else(|| "InternalServiceException".into());
                let message = format!(
                    "{}: {}",
                    arn,
                    info.error_message.unwrap_or_else(|| "tagging failed".into())
                );
                Err(AwsError::new("tagging", &code, &message, info.status_code.unwrap_or(400))
                    .with_action(api_name))
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceTagMapping {
    #[serde(rename = "ResourceARN")]
    resource_arn: String,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetResourcesResult {
    #[serde(default)]
    resource_tag_mapping_list: Vec<ResourceTagMapping>,
    #[serde(default)]
    pagination_token: Option<String>,
}

/// Bulk tagging for one region.
pub struct TaggingClient<'a> {
    dispatcher: &'a Dispatcher,
    region: String,
    assume_role: bool,
}

impl<'a> TaggingClient<'a> {
    pub fn new(dispatcher: &'a Dispatcher, region: &str) -> Self {
        Self {
            dispatcher,
            region: region.to_string(),
            assume_role: false,
        }
    }

    pub fn assume_role(mut self, assume_role: bool) -> Self {
        self.assume_role = assume_role;
        self
    }

    fn call(&self, api_name: &str, params: Params) -> ApiCall {
        ApiCall::new("tagging", api_name)
            .region(&self.region)
            .params(params)
            .assume_role(self.assume_role)
    }

    /// Add or overwrite `tags` on every ARN.
    pub async fn tag_resources(&self, ctx: &CallContext, arns: &[String], tags: &TagMap) -> AwsResult<()> {
        if arns.is_empty() || tags.is_empty() {
            return Ok(());
        }
        let tag_map: BTreeMap<String, ParamValue> = tags
            .iter()
            .map(|(k, v)| (k.clone(), ParamValue::from(v)))
            .collect();
        for chunk in arns.chunks(MAX_ARNS_PER_CALL) {
            let params = Params::new()
                .with("ResourceARNList", chunk.to_vec())
                .with("Tags", ParamValue::Map(tag_map.clone()));
            let result: TagMutationResult =
                self.dispatcher.fetch(ctx, &self.call("TagResources", params)).await?;
            result.first_failure("TagResources")?;
        }
        Ok(())
    }

    /// Remove `keys` from every ARN.
    pub async fn untag_resources(&self, ctx: &CallContext, arns: &[String], keys: &[String]) -> AwsResult<()> {
        if arns.is_empty() || keys.is_empty() {
            return Ok(());
        }
        for chunk in arns.chunks(MAX_ARNS_PER_CALL) {
            let params = Params::new()
                .with("ResourceARNList", chunk.to_vec())
                .with("TagKeys", keys.to_vec());
            let result: TagMutationResult =
                self.dispatcher.fetch(ctx, &self.call("UntagResources", params)).await?;
            result.first_failure("UntagResources")?;
        }
        Ok(())
    }

    /// Current tags of one resource.
    pub async fn get_tags(&self, ctx: &CallContext, arn: &str) -> AwsResult<TagMap> {
        let mappings = collect_pages(|token| async move {
            let params = Params::new()
                .with("ResourceARNList", vec![arn])
                .with_opt("PaginationToken", token);
            let page: GetResourcesResult =
                self.dispatcher.fetch(ctx, &self.call("GetResources", params)).await?;
            Ok(Page {
                items: page.resource_tag_mapping_list,
                next_token: page.pagination_token,
            })
        })
        .await?;
        Ok(mappings
            .into_iter()
            .filter(|m| m.resource_arn == arn)
            .flat_map(|m| m.tags)
            .map(|t| (t.key, t.value))
            .collect())
    }

    /// Reconcile and apply: removed keys are untagged first, then added
    /// keys are tagged. The first failure is returned as is.
    pub async fn set_tags(
        &self,
        ctx: &CallContext,
        arn: &str,
        old: &TagMap,
        new: &TagMap,
        replace: bool,
    ) -> AwsResult<TagDiff> {
        let diff = reconcile_tags(old, new, replace)?;
        if diff.is_empty() {
            log::debug!("Tags of {} already up to date", arn);
            return Ok(diff);
        }
        let arns = vec![arn.to_string()];
        let removed: Vec<String> = diff.removed.keys().cloned().collect();
        self.untag_resources(ctx, &arns, &removed).await?;
        self.tag_resources(ctx, &arns, &diff.added).await?;
        log::info!(
            "Tags of {} updated: {} added, {} removed",
            arn,
            diff.added.len(),
            diff.removed.len()
        );
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn replace_removes_everything_not_kept() {
        let old = tags(&[("env", "dev"), ("team", "a")]);
        let new = tags(&[("env", "prod"), ("owner", "b")]);
        let diff = reconcile_tags(&old, &new, true).unwrap();
        assert_eq!(diff.removed, tags(&[("env", "dev"), ("team", "a")]));
        assert_eq!(diff.added, tags(&[("env", "prod"), ("owner", "b")]));
    }

    #[test]
    fn merge_keeps_unmentioned_keys() {
        let old = tags(&[("env", "dev"), ("team", "a")]);
        let new = tags(&[("env", "prod"), ("owner", "b")]);
        let diff = reconcile_tags(&old, &new, false).unwrap();
        assert_eq!(diff.removed, tags(&[("env", "dev")]));
        assert_eq!(diff.added, tags(&[("env", "prod"), ("owner", "b")]));
    }

    #[test]
    fn identical_values_appear_nowhere() {
        let old = tags(&[("env", "dev")]);
        let diff = reconcile_tags(&old, &old, true).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn reserved_prefix_rejected() {
        let err = reconcile_tags(&TagMap::new(), &tags(&[("aws:cloudformation:stack", "x")]), false)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[test]
    fn reserved_keys_on_resource_never_removed() {
        let old = tags(&[("aws:autoscaling:groupName", "g"), ("team", "a")]);
        let diff = reconcile_tags(&old, &TagMap::new(), true).unwrap();
        assert_eq!(diff.removed, tags(&[("team", "a")]));
    }

    /// Applying the diff to `old` must land exactly on the expected set.
    fn apply(old: &TagMap, diff: &TagDiff) -> TagMap {
        let mut out = old.clone();
        for k in diff.removed.keys() {
            out.remove(k);
        }
        out.extend(diff.added.clone());
        out
    }

    #[test]
    fn applied_diff_matches_semantics() {
        let cases = [
            (tags(&[]), tags(&[("a", "1")])),
            (tags(&[("a", "1"), ("b", "2")]), tags(&[("b", "3"), ("c", "4")])),
            (tags(&[("a", "1")]), tags(&[])),
            (tags(&[("x", "1"), ("y", "2")]), tags(&[("x", "1"), ("y", "2")])),
        ];
        for (old, new) in cases {
            let replaced = apply(&old, &reconcile_tags(&old, &new, true).unwrap());
            assert_eq!(replaced, new);

            let merged = apply(&old, &reconcile_tags(&old, &new, false).unwrap());
            let mut expected = old.clone();
            expected.extend(new.clone());
            assert_eq!(merged, expected);
        }
    }

    #[test]
    fn second_application_is_a_no_op() {
        let old = tags(&[("a", "1")]);
        let new = tags(&[("a", "2"), ("b", "3")]);
        let after = apply(&old, &reconcile_tags(&old, &new, false).unwrap());
        assert!(reconcile_tags(&after, &new, false).unwrap().is_empty());
    }

    #[test]
    fn instance_arn() {
        assert_eq!(
            ec2_resource_arn(AccessEnvironment::China, "cn-north-1", "123", "instance", "i-1"),
            "arn:aws-cn:ec2:cn-north-1:123:instance/i-1"
        );
    }

    #[test]
    fn failure_map_surfaces_first_entry() {
        let result: TagMutationResult = serde_json::from_value(serde_json::json!({
            "FailedResourcesMap": {
                "arn:aws:ec2:us-east-1:1:instance/i-1": {
                    "ErrorCode": "InvalidParameterException",
                    "ErrorMessage": "bad tag",
                    "StatusCode": 400
                }
            }
        }))
        .unwrap();
        let err = result.first_failure("TagResources").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        assert!(err.message.contains("bad tag"));
    }
}
