//! Protocol dispatcher.
//!
//! [`Dispatcher::invoke`] is the single entry point every resource wrapper
//! uses: it resolves the session and client, picks the HTTP verb, runs the
//! client's handler chain under the right retry policy and decodes the
//! result into a caller-owned sink.

use crate::account::AccountCache;
use crate::config::AdapterConfig;
use crate::error::{AwsError, AwsResult};
use crate::params::{ParamValue, Params};
use crate::protocol::{self, derive_method, EncodedRequest};
use crate::retry::{self, retry_when, RetryPolicy};
use crate::session::SessionStore;
use crate::transport::{CallContext, HttpMethod, HttpResponse, ReqwestTransport, Transport};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// APIs that attach a freshly issued certificate to a TLS listener.
const LISTENER_CERTIFICATE_APIS: &[&str] =
    &["CreateListener", "ModifyListener", "AddListenerCertificates"];

/// One API invocation.
#[derive(Debug, Clone)]
pub struct ApiCall {
    pub region: String,
    pub service: String,
    pub api_name: String,
    pub path_template: String,
    pub params: Params,
    pub assume_role: bool,
    /// Overrides the verb derived from the API name.
    pub method: Option<HttpMethod>,
    /// Overrides the retry policy chosen by the dispatcher.
    pub retry: Option<RetryPolicy>,
}

impl ApiCall {
    pub fn new(service: &str, api_name: &str) -> Self {
        Self {
            region: String::new(),
            service: service.to_string(),
            api_name: api_name.to_string(),
            path_template: String::new(),
            params: Params::new(),
            assume_role: false,
            method: None,
            retry: None,
        }
    }

    pub fn region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    pub fn path(mut self, template: &str) -> Self {
        self.path_template = template.to_string();
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn assume_role(mut self, assume_role: bool) -> Self {
        self.assume_role = assume_role;
        self
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// A pre-encoded REST request, used for object storage and DNS bodies that
/// are not expressible as a parameter bag.
#[derive(Debug, Clone)]
pub struct RawCall {
    pub region: String,
    pub service: String,
    /// Logical API name, for logs, errors and the read-only gate.
    pub api_name: String,
    pub method: HttpMethod,
    /// Already encoded path.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub assume_role: bool,
}

impl RawCall {
    pub fn new(service: &str, api_name: &str, method: HttpMethod, path: &str) -> Self {
        Self {
            region: String::new(),
            service: service.to_string(),
            api_name: api_name.to_string(),
            method,
            path: path.to_string(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
            assume_role: false,
        }
    }

    pub fn region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn assume_role(mut self, assume_role: bool) -> Self {
        self.assume_role = assume_role;
        self
    }
}

/// Whether an API only reads provider state.
pub fn is_read_only_api(api_name: &str) -> bool {
    ["Get", "List", "Describe"]
        .iter()
        .any(|p| api_name.starts_with(p))
}

/// Receives `(service, action)` for every call the provider refused with
/// HTTP 403. REST calls report `VERB /path` as the action.
pub type PermissionHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Entry point for every provider call.
pub struct Dispatcher {
    store: Arc<SessionStore>,
    account: AccountCache,
    permission_hook: Option<PermissionHook>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", self.store.config())
            .finish()
    }
}

impl Dispatcher {
    /// Validate `config` and build a dispatcher over `transport`.
    pub fn new(config: AdapterConfig, transport: Arc<dyn Transport>) -> AwsResult<Self> {
        config.validate()?;
        Ok(Self {
            store: Arc::new(SessionStore::new(Arc::new(config), transport)),
            account: AccountCache::default(),
            permission_hook: None,
        })
    }

    /// Report permission refusals to `hook`.
    pub fn on_permission_denied<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.permission_hook = Some(Arc::new(hook));
        self
    }

    /// Dispatcher over the default `reqwest` transport.
    pub fn connect(config: AdapterConfig) -> AwsResult<Self> {
        Self::new(config, Arc::new(ReqwestTransport::new()))
    }

    pub fn config(&self) -> &AdapterConfig {
        self.store.config()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.store
    }

    pub(crate) fn account(&self) -> &AccountCache {
        &self.account
    }

    /// Dispatch `call` and decode its result into `sink`.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        call: &ApiCall,
        sink: &mut T,
    ) -> AwsResult<()> {
        *sink = self.fetch(ctx, call).await?;
        Ok(())
    }

    /// Dispatch `call` and decode its result into a fresh `T`.
    pub async fn fetch<T: DeserializeOwned>(&self, ctx: &CallContext, call: &ApiCall) -> AwsResult<T> {
        let value = self.invoke_value(ctx, call).await?;
        serde_json::from_value(value).map_err(|e| {
            AwsError::malformed(
                &call.service,
                &format!("cannot decode {} result: {}", call.api_name, e),
                200,
            )
            .with_action(&call.api_name)
        })
    }

    /// Dispatch `call` and return the decoded body as JSON.
    pub async fn invoke_value(&self, ctx: &CallContext, call: &ApiCall) -> AwsResult<Value> {
        let descriptor = protocol::service(&call.service)?;
        let method = if descriptor.post_only {
            HttpMethod::Post
        } else {
            call.method
                .unwrap_or_else(|| derive_method(&call.api_name, descriptor.post_only))
        };
        self.check_read_only(&call.service, &call.api_name, method)?;

        let session = self
            .store
            .resolve_session(ctx, &call.region, call.assume_role)
            .await?;
        let client = self.store.client_for(&session, descriptor).await;

        log::debug!(
            "{} {}.{} region={} assume_role={}",
            method,
            call.service,
            call.api_name,
            session.region(),
            call.assume_role
        );

        let (policy, special): (RetryPolicy, fn(&AwsError) -> bool) = self.policy_for(call);
        let result = retry_when(
            ctx,
            &policy,
            |e| e.retryable || special(e),
            || {
                client.call(
                    ctx,
                    &call.api_name,
                    method,
                    &call.path_template,
                    call.params.clone(),
                )
            },
        )
        .await;
        self.note_denied(&call.service, &call.api_name, &result);
        result
    }

    /// Send a pre-encoded REST request. Non-2xx responses become errors.
    pub async fn send_raw(&self, ctx: &CallContext, call: &RawCall) -> AwsResult<HttpResponse> {
        let descriptor = protocol::service(&call.service)?;
        self.check_read_only(&call.service, &call.api_name, call.method)?;

        let session = self
            .store
            .resolve_session(ctx, &call.region, call.assume_role)
            .await?;
        let client = self.store.client_for(&session, descriptor).await;
        log::debug!(
            "{} {}{} ({}.{})",
            call.method,
            client.endpoint().base_url,
            call.path,
            call.service,
            call.api_name
        );

        let policy = self.config().retry.policy();
        let result = retry_when(
            ctx,
            &policy,
            |e| e.retryable,
            || async {
                let encoded = EncodedRequest {
                    method: call.method,
                    path: call.path.clone(),
                    query: call.query.clone(),
                    headers: call.headers.clone(),
                    body: call.body.clone(),
                };
                let response = client.send_encoded(ctx, encoded).await?;
                if response.is_success() {
                    Ok(response)
                } else {
                    Err(client.unmarshal_error(&call.api_name, &response))
                }
            },
        )
        .await;
        self.note_denied(&call.service, &format!("{} {}", call.method, call.path), &result);
        result
    }

    fn note_denied<T>(&self, service: &str, action: &str, result: &AwsResult<T>) {
        let (Some(hook), Err(err)) = (self.permission_hook.as_ref(), result) else {
            return;
        };
        if err.status_code == 403 {
            log::debug!("{} refused {} with {}", service, action, err.code);
            hook(service, action);
        }
    }

    fn check_read_only(&self, service: &str, api_name: &str, method: HttpMethod) -> AwsResult<()> {
        if !self.config().read_only {
            return Ok(());
        }
        let allowed = match protocol::service(service).map(|d| d.dialect) {
            Ok(protocol::Dialect::RestXml) => method.is_read(),
            _ => is_read_only_api(api_name),
        };
        if allowed {
            return Ok(());
        }
        log::warn!("Refusing {}.{} in read-only mode", service, api_name);
        Err(AwsError::with_kind(
            crate::error::ErrorKind::AccessDenied,
            service,
            &format!("{} is not allowed in read-only mode", api_name),
        )
        .with_action(api_name))
    }

    fn policy_for(&self, call: &ApiCall) -> (RetryPolicy, fn(&AwsError) -> bool) {
        if let Some(policy) = call.retry.clone() {
            return (policy, |_| false);
        }
        if LISTENER_CERTIFICATE_APIS.contains(&call.api_name.as_str()) {
            return (
                RetryPolicy::certificate_propagation(),
                retry::is_certificate_not_found,
            );
        }
        if call.api_name == "AssociateAddress" {
            return (RetryPolicy::eip_association(), retry::is_address_not_found);
        }
        (self.config().retry.policy(), |_| false)
    }
}
