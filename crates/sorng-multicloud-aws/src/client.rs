//! Per-service client.
//!
//! A [`ServiceClient`] is bound to one session and one service. Its
//! handler chain is fixed at construction and always runs in the same
//! order:
//!
//! ```text
//! Build ─► Sign ─► Send ─► UnmarshalMeta ─┬─► Unmarshal       (2xx)
//!                                         └─► UnmarshalError  (otherwise)
//! ```

use crate::error::{AwsError, AwsResult};
use crate::params::Params;
use crate::protocol::{Codec, EncodedRequest, Endpoint, Operation, ServiceDescriptor};
use crate::session::{Session, SessionCredentials};
use crate::signing::SigV4Signer;
use crate::transport::{CallContext, HttpMethod, HttpRequest, HttpResponse, Transport};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// Signs and sends requests for one (session, service) pair.
pub struct ServiceClient {
    descriptor: &'static ServiceDescriptor,
    session: Arc<Session>,
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    debug: bool,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.descriptor.name)
            .field("api_version", &self.descriptor.api_version)
            .field("region", &self.session.region())
            .field("endpoint", &self.endpoint.base_url)
            .finish()
    }
}

impl ServiceClient {
    pub fn new(
        descriptor: &'static ServiceDescriptor,
        session: Arc<Session>,
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        debug: bool,
    ) -> Self {
        Self {
            descriptor,
            session,
            endpoint,
            transport,
            debug,
        }
    }

    pub fn descriptor(&self) -> &'static ServiceDescriptor {
        self.descriptor
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run the full handler chain once and return the decoded body.
    pub async fn call(
        &self,
        ctx: &CallContext,
        api_name: &str,
        method: HttpMethod,
        path_template: &str,
        params: Params,
    ) -> AwsResult<Value> {
        let credentials = self.session.credentials(ctx).await?;
        self.call_with(ctx, &credentials, api_name, method, path_template, params)
            .await
    }

    /// [`ServiceClient::call`] signed with explicit credentials rather than
    /// the session's.
    pub async fn call_with(
        &self,
        ctx: &CallContext,
        credentials: &SessionCredentials,
        api_name: &str,
        method: HttpMethod,
        path_template: &str,
        params: Params,
    ) -> AwsResult<Value> {
        let service = self.descriptor.name;
        let op = Operation {
            api_name,
            api_version: self.descriptor.api_version,
            method,
            path_template,
        };

        // Build
        let encoded = self
            .descriptor
            .dialect
            .build_body(&op, params)
            .map_err(|e| e.with_action(api_name))?;

        // Sign, Send
        let response = self.send_signed(ctx, credentials, encoded).await?;

        // UnmarshalMeta
        let request_id = response.request_id();
        log::debug!(
            "{}.{} -> HTTP {} (request id {})",
            service,
            api_name,
            response.status,
            request_id.as_deref().unwrap_or("-")
        );

        if !response.is_success() {
            // UnmarshalError
            return Err(self.unmarshal_error(api_name, &response));
        }

        // Unmarshal
        self.descriptor
            .dialect
            .decode_body(&op, service, &response.body)
            .map_err(|mut e| {
                e.action = Some(api_name.to_string());
                if e.request_id.is_none() {
                    e.request_id = request_id;
                }
                e
            })
    }

    /// Sign and send an already built request. The raw response is returned
    /// whatever its status.
    pub async fn send_encoded(
        &self,
        ctx: &CallContext,
        encoded: EncodedRequest,
    ) -> AwsResult<HttpResponse> {
        let credentials = self.session.credentials(ctx).await?;
        self.send_signed(ctx, &credentials, encoded).await
    }

    async fn send_signed(
        &self,
        ctx: &CallContext,
        credentials: &SessionCredentials,
        encoded: EncodedRequest,
    ) -> AwsResult<HttpResponse> {
        let service = self.descriptor.name;
        let url = format!("{}{}", self.endpoint.base_url, encoded.path_and_query());

        let mut headers = encoded.headers;
        headers.insert("host".to_string(), self.endpoint.host.clone());

        let signer = SigV4Signer::new(
            &credentials.access_key_id,
            &credentials.secret_access_key,
            credentials.session_token.as_deref(),
            &self.endpoint.signing_region,
            self.descriptor.signing_name,
        );
        let signed = signer.sign(
            encoded.method.as_str(),
            &url,
            &headers,
            &encoded.body,
            Utc::now(),
        );

        if self.debug {
            log::debug!(
                "{} {} body: {}",
                encoded.method,
                url,
                String::from_utf8_lossy(&encoded.body)
            );
        }

        let request = HttpRequest {
            method: encoded.method,
            url,
            headers: signed,
            body: encoded.body,
        };
        let response = ctx.run(service, self.transport.send(request)).await?;

        if self.debug {
            log::debug!(
                "{} HTTP {} response: {}",
                service,
                response.status,
                response.body_text()
            );
        }
        Ok(response)
    }

    /// Decode a non-2xx response into the canonical error.
    pub fn unmarshal_error(&self, api_name: &str, response: &HttpResponse) -> AwsError {
        let mut err = self.descriptor.dialect.decode_error(
            self.descriptor.name,
            response.status,
            &response.body,
        );
        err.action = Some(api_name.to_string());
        if err.request_id.is_none() {
            err.request_id = response.request_id();
        }
        err
    }
}
