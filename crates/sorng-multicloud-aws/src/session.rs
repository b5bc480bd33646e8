//! Credential and session store, plus the service-client cache.
//!
//! Sessions are keyed by `(region, assume_role)`. A session that assumes
//! the cross-account role holds temporary credentials obtained from STS and
//! renews them shortly before they expire. Service clients are cached per
//! `(session, service, api version)`.

use crate::client::ServiceClient;
use crate::config::{AdapterConfig, Credentials};
use crate::error::{AwsError, AwsResult};
use crate::params::Params;
use crate::protocol::{self, ServiceDescriptor};
use crate::transport::{CallContext, HttpMethod, Transport};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Seconds requested for assumed-role credentials.
const ASSUME_ROLE_DURATION_SECS: i64 = 3600;
/// Renew this long before expiry.
const REFRESH_MARGIN_SECS: i64 = 300;

/// Credentials a session signs with.
#[derive(Clone)]
pub struct SessionCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl SessionCredentials {
    fn from_root(root: &Credentials) -> Self {
        Self {
            access_key_id: root.access_key_id.clone(),
            secret_access_key: root.secret_access_key.clone(),
            session_token: None,
            expiration: None,
        }
    }

    /// Whether the credentials are expired or about to.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            Some(exp) => now + ChronoDuration::seconds(REFRESH_MARGIN_SECS) >= exp,
            None => false,
        }
    }
}

/// Identity of a cached session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub region: String,
    pub assume_role: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    session: SessionKey,
    service: &'static str,
    api_version: &'static str,
}

/// Everything needed to call STS AssumeRole with the root credentials.
#[derive(Clone)]
struct RoleAssumer {
    role_arn: String,
    config: Arc<AdapterConfig>,
    transport: Arc<dyn Transport>,
}

impl RoleAssumer {
    async fn assume(&self, ctx: &CallContext, region: &str) -> AwsResult<SessionCredentials> {
        let sts = protocol::service("sts")?;
        let root_credentials = SessionCredentials::from_root(&self.config.credentials);
        let root = Arc::new(Session::fixed(region, root_credentials.clone()));
        let endpoint = protocol::endpoint_for(
            sts,
            region,
            self.config.access_environment(),
            self.config.endpoint_override.as_deref(),
        );
        let client = ServiceClient::new(sts, root, endpoint, self.transport.clone(), self.config.debug);

        let params = Params::new()
            .with("RoleArn", self.role_arn.as_str())
            .with(
                "RoleSessionName",
                format!("sorng-{}", uuid::Uuid::new_v4().simple()),
            )
            .with("DurationSeconds", ASSUME_ROLE_DURATION_SECS);
        let result = client
            .call_with(ctx, &root_credentials, "AssumeRole", HttpMethod::Post, "", params)
            .await?;
        parse_assumed_credentials(&result)
    }
}

fn parse_assumed_credentials(result: &Value) -> AwsResult<SessionCredentials> {
    let creds = result
        .get("Credentials")
        .ok_or_else(|| AwsError::malformed("sts", "AssumeRole response has no Credentials", 200))?;
    let field = |name: &str| {
        creds
            .get(name)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let access_key_id = field("AccessKeyId")
        .ok_or_else(|| AwsError::malformed("sts", "AssumeRole response has no AccessKeyId", 200))?;
    let secret_access_key = field("SecretAccessKey").ok_or_else(|| {
        AwsError::malformed("sts", "AssumeRole response has no SecretAccessKey", 200)
    })?;
    let expiration = field("Expiration")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc));
    Ok(SessionCredentials {
        access_key_id,
        secret_access_key,
        session_token: field("SessionToken"),
        expiration,
    })
}

/// A handle carrying resolved credentials for one `(region, assume_role)`.
pub struct Session {
    region: String,
    assume_role: bool,
    credentials: RwLock<SessionCredentials>,
    assumer: Option<RoleAssumer>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("region", &self.region)
            .field("assume_role", &self.assume_role)
            .field("role_arn", &self.role_arn())
            .finish()
    }
}

impl Session {
    /// A session whose credentials never change.
    pub fn fixed(region: &str, credentials: SessionCredentials) -> Self {
        Self {
            region: region.to_string(),
            assume_role: false,
            credentials: RwLock::new(credentials),
            assumer: None,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn assume_role(&self) -> bool {
        self.assume_role
    }

    /// ARN of the assumed role, when this session assumed one.
    pub fn role_arn(&self) -> Option<&str> {
        self.assumer.as_ref().map(|a| a.role_arn.as_str())
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            region: self.region.clone(),
            assume_role: self.assume_role,
        }
    }

    /// Current signing credentials, renewing assumed-role credentials when
    /// they are about to expire. The renewal runs under `ctx`.
    pub async fn credentials(&self, ctx: &CallContext) -> AwsResult<SessionCredentials> {
        {
            let current = self.credentials.read().await;
            if !current.needs_refresh(Utc::now()) {
                return Ok(current.clone());
            }
        }
        let Some(assumer) = self.assumer.as_ref() else {
            return Ok(self.credentials.read().await.clone());
        };

        let mut current = self.credentials.write().await;
        if current.needs_refresh(Utc::now()) {
            log::info!("Refreshing assumed-role credentials for {}", assumer.role_arn);
            *current = assumer.assume(ctx, &self.region).await?;
        }
        Ok(current.clone())
    }
}

/// Caches sessions and service clients for one set of root credentials.
pub struct SessionStore {
    config: Arc<AdapterConfig>,
    transport: Arc<dyn Transport>,
    /// One cell per key so concurrent first calls share a single build.
    sessions: RwLock<HashMap<SessionKey, Arc<OnceCell<Arc<Session>>>>>,
    clients: RwLock<HashMap<ClientKey, Arc<ServiceClient>>>,
}

impl SessionStore {
    pub fn new(config: Arc<AdapterConfig>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            sessions: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<AdapterConfig> {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Return the session for `(region, assume_role)`, creating it on first
    /// use. An empty region means the configured default.
    pub async fn resolve_session(
        &self,
        ctx: &CallContext,
        region: &str,
        assume_role: bool,
    ) -> AwsResult<Arc<Session>> {
        let region = self.config.resolve_region(region)?;
        let key = SessionKey {
            region,
            assume_role,
        };
        let cell = {
            let cached = self.sessions.read().await.get(&key).cloned();
            match cached {
                Some(cell) => cell,
                None => self
                    .sessions
                    .write()
                    .await
                    .entry(key.clone())
                    .or_default()
                    .clone(),
            }
        };
        // A failed build leaves the cell empty for the next caller.
        cell.get_or_try_init(|| async { self.build_session(ctx, &key).await.map(Arc::new) })
            .await
            .cloned()
    }

    async fn build_session(&self, ctx: &CallContext, key: &SessionKey) -> AwsResult<Session> {
        let root = SessionCredentials::from_root(&self.config.credentials);
        let role_arn = if key.assume_role {
            self.config.credentials.assume_role_arn()
        } else {
            None
        };
        let Some(role_arn) = role_arn else {
            log::debug!("New session for region {} with root credentials", key.region);
            return Ok(Session {
                region: key.region.clone(),
                assume_role: key.assume_role,
                credentials: RwLock::new(root),
                assumer: None,
            });
        };

        let assumer = RoleAssumer {
            role_arn,
            config: self.config.clone(),
            transport: self.transport.clone(),
        };
        let credentials = assumer.assume(ctx, &key.region).await?;
        log::info!(
            "New session for region {} assuming {}",
            key.region,
            assumer.role_arn
        );
        Ok(Session {
            region: key.region.clone(),
            assume_role: true,
            credentials: RwLock::new(credentials),
            assumer: Some(assumer),
        })
    }

    /// Return the client for `service` on `session`, creating it on first use.
    pub async fn client_for(
        &self,
        session: &Arc<Session>,
        descriptor: &'static ServiceDescriptor,
    ) -> Arc<ServiceClient> {
        let key = ClientKey {
            session: session.key(),
            service: descriptor.name,
            api_version: descriptor.api_version,
        };
        if let Some(client) = self.clients.read().await.get(&key) {
            return client.clone();
        }
        let endpoint = protocol::endpoint_for(
            descriptor,
            session.region(),
            self.config.access_environment(),
            self.config.endpoint_override.as_deref(),
        );
        let client = Arc::new(ServiceClient::new(
            descriptor,
            session.clone(),
            endpoint,
            self.transport.clone(),
            self.config.debug,
        ));
        let mut clients = self.clients.write().await;
        clients.entry(key).or_insert(client).clone()
    }

    /// Drop every cached session and client.
    pub async fn clear(&self) {
        self.clients.write().await.clear();
        self.sessions.write().await.clear();
    }

    pub async fn session_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}
