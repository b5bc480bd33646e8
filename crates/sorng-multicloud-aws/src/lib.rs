//! # sorng-multicloud-aws – AWS adapter core for the multi-cloud layer
//!
//! Turns uniform resource operations into signed provider calls and maps
//! the answers back onto one canonical model: error kinds, lifecycle
//! states, tags, image families and DNS routing policies.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  Resource wrappers  (resource.rs, instance.rs)   │
//! │  Orchestration      (import.rs, organizations.rs)│
//! │  Mappers            (tags.rs, images.rs, dns.rs) │
//! ├──────────────────────────────────────────────────┤
//! │  Dispatcher  (dispatcher.rs)                     │
//! │  ├── ApiCall  → query / EC2 / JSON-RPC / REST    │
//! │  ├── RawCall  → REST-XML (S3, Route 53)          │
//! │  └── retries, read-only gate, pagination         │
//! ├──────────────────────────────────────────────────┤
//! │  SessionStore (session.rs) · ServiceClient       │
//! │  (client.rs) · SigV4Signer (signing.rs)          │
//! ├──────────────────────────────────────────────────┤
//! │  Transport  (transport.rs, reqwest or scripted)  │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## API Protocols
//!
//! | Dialect     | Services                                          |
//! |-------------|---------------------------------------------------|
//! | Query + XML | IAM, STS, RDS, ElastiCache, ELB, CloudWatch       |
//! | EC2 + XML   | EC2                                               |
//! | JSON-RPC    | Organizations, Tagging, DynamoDB, ACM, WAF, ECS   |
//! | REST + JSON | EKS, Lambda                                       |
//! | REST + XML  | S3, Route 53                                      |

// ── Sub-modules ─────────────────────────────────────────────────────────

pub mod error;
pub mod retry;
pub mod config;
pub mod signing;
pub mod params;
pub mod xml;

// Dispatch pipeline
pub mod protocol;
pub mod transport;
pub mod client;
pub mod session;
pub mod dispatcher;
pub mod account;
pub mod pagination;
pub mod wait;

// Domain mappers and service clients
pub mod tags;
pub mod organizations;
pub mod images;
pub mod dns;
pub mod route53;
pub mod storage;
pub mod iam;
pub mod import;

// Resource wrappers
pub mod resource;
pub mod instance;

// ── Re-exports for ergonomic access ─────────────────────────────────────

pub use config::{AccessEnvironment, AdapterConfig, Credentials, RetryConfig};
pub use account::{CallerIdentity, RegionInfo};
pub use dispatcher::{ApiCall, Dispatcher, PermissionHook, RawCall};
pub use error::{AwsError, AwsResult, ErrorKind};
pub use params::{ParamValue, Params};
pub use transport::{CallContext, CancelHandle, HttpMethod, HttpRequest, HttpResponse, ReqwestTransport, Transport};

pub use dns::{DnsPolicy, DnsRecord, RecordType};
pub use images::{ImageFingerprint, OsInfo, OsType};
pub use import::{ImageTransfer, ImportOptions, ImportOutcome, ImportRequest, ImportState};
pub use organizations::{OrganizationClient, SubAccount, SubAccountState};
pub use resource::{CloudResource, ResourceCollection, ResourceStatus};
pub use tags::{reconcile_tags, TagDiff, TagMap};
