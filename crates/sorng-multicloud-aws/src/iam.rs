//! IAM roles and inline policies provisioned on demand.
//!
//! IAM is a partition-global query service. Everything here is idempotent:
//! creating a role or policy that already exists is not an error.
//!
//! Reference: <https://docs.aws.amazon.com/IAM/latest/APIReference/>

use crate::config::AccessEnvironment;
use crate::dispatcher::{ApiCall, Dispatcher};
use crate::error::{AwsError, AwsResult, ErrorKind};
use crate::transport::CallContext;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const SERVICE: &str = "iam";

/// Role the VM import service assumes.
pub const VMIMPORT_ROLE: &str = "vmimport";
const VMIMPORT_POLICY: &str = "vmimport";
const VMIE_PRINCIPAL: &str = "vmie.amazonaws.com";
const POLICY_VERSION: &str = "2012-10-17";

// ── Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Role {
    #[serde(default)]
    pub role_name: String,
    #[serde(default)]
    pub role_id: String,
    #[serde(default)]
    pub arn: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub create_date: Option<String>,
    /// URL-encoded JSON as returned by the provider.
    #[serde(default)]
    pub assume_role_policy_document: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleResult {
    #[serde(default)]
    role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statement: Vec<PolicyStatement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStatement {
    #[serde(rename = "Effect")]
    pub effect: String,
    #[serde(rename = "Action")]
    pub action: Value,
    #[serde(rename = "Resource", skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(rename = "Condition", skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    #[serde(rename = "Principal", skip_serializing_if = "Option::is_none")]
    pub principal: Option<Value>,
}

impl PolicyDocument {
    pub fn new(statement: Vec<PolicyStatement>) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement,
        }
    }

    pub fn to_json_string(&self) -> AwsResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl PolicyStatement {
    fn allow(action: Value, resource: Value) -> Self {
        Self {
            effect: "Allow".into(),
            action,
            resource: Some(resource),
            condition: None,
            principal: None,
        }
    }

    fn trust(service: &str) -> Self {
        Self {
            effect: "Allow".into(),
            action: json!("sts:AssumeRole"),
            resource: None,
            condition: None,
            principal: Some(json!({ "Service": service })),
        }
    }
}

/// A role to provision: trust policy, inline policies and managed policies.
#[derive(Debug, Clone)]
pub struct RoleSpec {
    pub role_name: String,
    pub description: Option<String>,
    pub trust_policy: PolicyDocument,
    pub inline_policies: Vec<(String, PolicyDocument)>,
    pub managed_policy_arns: Vec<String>,
}

// ── Policy documents ────────────────────────────────────────────────────

/// The `vmimport` role: trusted by the import service, may read the image
/// cache buckets and create snapshots and images.
pub fn vmimport_role(env: AccessEnvironment, bucket_prefix: &str) -> RoleSpec {
    let partition = env.partition();
    let mut trust = PolicyStatement::trust(VMIE_PRINCIPAL);
    trust.condition = Some(json!({
        "StringEquals": { "sts:Externalid": VMIMPORT_ROLE }
    }));
    let access = PolicyDocument::new(vec![
        PolicyStatement::allow(
            json!(["s3:GetBucketLocation", "s3:GetObject", "s3:ListBucket", "s3:PutObject", "s3:GetBucketAcl"]),
            json!([
                format!("arn:{}:s3:::{}*", partition, bucket_prefix),
                format!("arn:{}:s3:::{}*/*", partition, bucket_prefix),
            ]),
        ),
        PolicyStatement::allow(
            json!([
                "ec2:ModifySnapshotAttribute",
                "ec2:CopySnapshot",
                "ec2:RegisterImage",
                "ec2:Describe*"
            ]),
            json!("*"),
        ),
    ]);
    RoleSpec {
        role_name: VMIMPORT_ROLE.to_string(),
        description: Some("VM import/export service role".into()),
        trust_policy: PolicyDocument::new(vec![trust]),
        inline_policies: vec![(VMIMPORT_POLICY.to_string(), access)],
        managed_policy_arns: Vec::new(),
    }
}

/// Kubernetes control-plane role.
pub fn eks_cluster_role(env: AccessEnvironment, role_name: &str) -> RoleSpec {
    let prefix = env.managed_policy_prefix();
    RoleSpec {
        role_name: role_name.to_string(),
        description: Some("Kubernetes cluster control plane".into()),
        trust_policy: PolicyDocument::new(vec![PolicyStatement::trust("eks.amazonaws.com")]),
        inline_policies: Vec::new(),
        managed_policy_arns: vec![format!("{}AmazonEKSClusterPolicy", prefix)],
    }
}

/// Kubernetes worker node role.
pub fn eks_node_role(env: AccessEnvironment, role_name: &str) -> RoleSpec {
    let prefix = env.managed_policy_prefix();
    let principal = match env {
        AccessEnvironment::China => "ec2.amazonaws.com.cn",
        AccessEnvironment::Global => "ec2.amazonaws.com",
    };
    RoleSpec {
        role_name: role_name.to_string(),
        description: Some("Kubernetes worker nodes".into()),
        trust_policy: PolicyDocument::new(vec![PolicyStatement::trust(principal)]),
        inline_policies: Vec::new(),
        managed_policy_arns: ["AmazonEKSWorkerNodePolicy", "AmazonEKS_CNI_Policy", "AmazonEC2ContainerRegistryReadOnly"]
            .iter()
            .map(|name| format!("{}{}", prefix, name))
            .collect(),
    }
}

fn ignore_duplicate(result: AwsResult<()>) -> AwsResult<()> {
    match result {
        Err(e) if e.is(ErrorKind::Duplicate) => Ok(()),
        other => other,
    }
}

// ── IAM Client ──────────────────────────────────────────────────────────

pub struct IamClient<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> IamClient<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn get_role(&self, ctx: &CallContext, role_name: &str) -> AwsResult<Role> {
        let call = ApiCall::new(SERVICE, "GetRole").param("RoleName", role_name);
        let result: RoleResult = self.dispatcher.fetch(ctx, &call).await?;
        result
            .role
            .ok_or_else(|| AwsError::not_found(SERVICE, &format!("role {} not found", role_name)))
    }

    /// `None` when the role does not exist.
    pub async fn find_role(&self, ctx: &CallContext, role_name: &str) -> AwsResult<Option<Role>> {
        match self.get_role(ctx, role_name).await {
            Ok(role) => Ok(Some(role)),
            Err(e) if e.is(ErrorKind::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_role(&self, ctx: &CallContext, spec: &RoleSpec) -> AwsResult<()> {
        let call = ApiCall::new(SERVICE, "CreateRole")
            .param("RoleName", spec.role_name.as_str())
            .param("AssumeRolePolicyDocument", spec.trust_policy.to_json_string()?);
        let call = match &spec.description {
            Some(description) => call.param("Description", description.as_str()),
            None => call,
        };
        self.dispatcher.invoke_value(ctx, &call).await?;
        Ok(())
    }

    pub async fn put_role_policy(
        &self,
        ctx: &CallContext,
        role_name: &str,
        policy_name: &str,
        document: &PolicyDocument,
    ) -> AwsResult<()> {
        let call = ApiCall::new(SERVICE, "PutRolePolicy")
            .param("RoleName", role_name)
            .param("PolicyName", policy_name)
            .param("PolicyDocument", document.to_json_string()?);
        self.dispatcher.invoke_value(ctx, &call).await?;
        Ok(())
    }

    pub async fn attach_role_policy(&self, ctx: &CallContext, role_name: &str, policy_arn: &str) -> AwsResult<()> {
        let call = ApiCall::new(SERVICE, "AttachRolePolicy")
            .param("RoleName", role_name)
            .param("PolicyArn", policy_arn);
        self.dispatcher.invoke_value(ctx, &call).await?;
        Ok(())
    }

    pub async fn delete_role(&self, ctx: &CallContext, role_name: &str) -> AwsResult<()> {
        let call = ApiCall::new(SERVICE, "DeleteRole").param("RoleName", role_name);
        self.dispatcher.invoke_value(ctx, &call).await?;
        Ok(())
    }

    /// Create the role if missing, then (re)apply its policies. Running it
    /// twice leaves the same artifacts.
    pub async fn ensure_role(&self, ctx: &CallContext, spec: &RoleSpec) -> AwsResult<()> {
        if self.find_role(ctx, &spec.role_name).await?.is_none() {
            ignore_duplicate(self.create_role(ctx, spec).await)?;
            log::info!("created role {}", spec.role_name);
        }
        for (name, document) in &spec.inline_policies {
            self.put_role_policy(ctx, &spec.role_name, name, document)
                .await?;
        }
        for arn in &spec.managed_policy_arns {
            ignore_duplicate(self.attach_role_policy(ctx, &spec.role_name, arn).await)?;
        }
        Ok(())
    }

    pub async fn ensure_vmimport_role(&self, ctx: &CallContext, bucket_prefix: &str) -> AwsResult<()> {
        let env = self.dispatcher.config().access_environment();
        self.ensure_role(ctx, &vmimport_role(env, bucket_prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmimport_trust_and_access() {
        let spec = vmimport_role(AccessEnvironment::Global, "imgcache-");
        assert_eq!(spec.role_name, "vmimport");
        let trust: Value = serde_json::from_str(&spec.trust_policy.to_json_string().unwrap()).unwrap();
        assert_eq!(trust["Version"], "2012-10-17");
        assert_eq!(trust["Statement"][0]["Principal"]["Service"], "vmie.amazonaws.com");
        assert_eq!(trust["Statement"][0]["Condition"]["StringEquals"]["sts:Externalid"], "vmimport");
        assert!(trust["Statement"][0].get("Resource").is_none());

        let (name, access) = &spec.inline_policies[0];
        assert_eq!(name, "vmimport");
        let access = serde_json::to_value(access).unwrap();
        assert_eq!(access["Statement"][0]["Resource"][0], "arn:aws:s3:::imgcache-*");
        assert!(access["Statement"][0]["Action"]
            .as_array()
            .unwrap()
            .contains(&json!("s3:GetObject")));
        assert_eq!(access["Statement"][1]["Resource"], "*");
        assert!(access["Statement"][1]["Action"]
            .as_array()
            .unwrap()
            .contains(&json!("ec2:RegisterImage")));
    }

    #[test]
    fn china_partition_arns() {
        let spec = vmimport_role(AccessEnvironment::China, "imgcache-");
        let access = serde_json::to_value(&spec.inline_policies[0].1).unwrap();
        assert_eq!(access["Statement"][0]["Resource"][0], "arn:aws-cn:s3:::imgcache-*");

        let node = eks_node_role(AccessEnvironment::China, "nodes");
        assert!(node.managed_policy_arns[0].starts_with("arn:aws-cn:iam::aws:policy/"));
        assert_eq!(
            node.trust_policy.statement[0].principal,
            Some(json!({ "Service": "ec2.amazonaws.com.cn" }))
        );
    }

    #[test]
    fn kubernetes_roles() {
        let cluster = eks_cluster_role(AccessEnvironment::Global, "cp");
        assert_eq!(
            cluster.managed_policy_arns,
            vec!["arn:aws:iam::aws:policy/AmazonEKSClusterPolicy".to_string()]
        );
        assert_eq!(
            cluster.trust_policy.statement[0].principal,
            Some(json!({ "Service": "eks.amazonaws.com" }))
        );
        assert_eq!(eks_node_role(AccessEnvironment::Global, "n").managed_policy_arns.len(), 3);
    }

    #[test]
    fn duplicates_are_ignored() {
        assert!(ignore_duplicate(Err(AwsError::new(SERVICE, "EntityAlreadyExists", "", 409))).is_ok());
        assert!(ignore_duplicate(Err(AwsError::new(SERVICE, "AccessDenied", "", 403))).is_err());
    }
}
