//! Wire dialects and the service table.
//!
//! Every service speaks exactly one [`Dialect`]. A dialect knows how to turn
//! an operation plus its [`Params`] into a request ([`Codec::build_body`]),
//! how to read a success body ([`Codec::decode_body`]) and how to read an
//! error body ([`Codec::decode_error`]).
//!
//! | Dialect    | Services                                                  |
//! |------------|-----------------------------------------------------------|
//! | Ec2Query   | ec2                                                       |
//! | Query      | iam, sts, rds, elasticache, elasticloadbalancing, monitoring |
//! | JsonRpc    | ecs, dynamodb, kinesis, organizations, tagging, wafv2, cloudtrail, acm |
//! | RestJson   | eks, lambda                                               |
//! | RestXml    | s3, route53                                               |

use crate::config::AccessEnvironment;
use crate::error::{AwsError, AwsResult};
use crate::params::{ParamValue, Params};
use crate::signing::{uri_encode, uri_encode_path};
use crate::transport::HttpMethod;
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;

/// How a service encodes requests and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// EC2 query: form parameters, XML response rooted at `<Api>Response`.
    Ec2Query,
    /// Classic query: form parameters, XML response wrapped in `<Api>Result`.
    Query,
    /// JSON-RPC addressed through `X-Amz-Target`.
    JsonRpc {
        target_prefix: &'static str,
        json_version: &'static str,
    },
    /// Path-templated REST with JSON bodies.
    RestJson,
    /// Path-templated REST with XML bodies.
    RestXml,
}

impl Dialect {
    pub fn is_json(&self) -> bool {
        matches!(self, Self::JsonRpc { .. } | Self::RestJson)
    }
}

/// Static facts about one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub endpoint_prefix: &'static str,
    pub signing_name: &'static str,
    pub api_version: &'static str,
    pub dialect: Dialect,
    /// Single endpoint per partition rather than per region.
    pub global: bool,
    /// Every API is POST regardless of its name.
    pub post_only: bool,
}

const fn query(name: &'static str, version: &'static str) -> ServiceDescriptor {
    ServiceDescriptor {
        name,
        endpoint_prefix: name,
        signing_name: name,
        api_version: version,
        dialect: Dialect::Query,
        global: false,
        post_only: false,
    }
}

const fn json_rpc(
    name: &'static str,
    version: &'static str,
    target_prefix: &'static str,
    json_version: &'static str,
) -> ServiceDescriptor {
    ServiceDescriptor {
        name,
        endpoint_prefix: name,
        signing_name: name,
        api_version: version,
        dialect: Dialect::JsonRpc {
            target_prefix,
            json_version,
        },
        global: false,
        post_only: true,
    }
}

const fn rest(name: &'static str, version: &'static str, dialect: Dialect) -> ServiceDescriptor {
    ServiceDescriptor {
        name,
        endpoint_prefix: name,
        signing_name: name,
        api_version: version,
        dialect,
        global: false,
        post_only: false,
    }
}

const fn global(desc: ServiceDescriptor) -> ServiceDescriptor {
    ServiceDescriptor {
        global: true,
        ..desc
    }
}

pub const SERVICES: &[ServiceDescriptor] = &[
    ServiceDescriptor {
        dialect: Dialect::Ec2Query,
        ..query("ec2", "2016-11-15")
    },
    global(query("iam", "2010-05-08")),
    query("sts", "2011-06-15"),
    query("rds", "2014-10-31"),
    query("elasticache", "2015-02-02"),
    query("elasticloadbalancing", "2015-12-01"),
    query("monitoring", "2010-08-01"),
    rest("eks", "2017-11-01", Dialect::RestJson),
    rest("lambda", "2015-03-31", Dialect::RestJson),
    json_rpc("ecs", "2014-11-13", "AmazonEC2ContainerServiceV20141113", "1.1"),
    json_rpc("dynamodb", "2012-08-10", "DynamoDB_20120810", "1.0"),
    json_rpc("kinesis", "2013-12-02", "Kinesis_20131202", "1.1"),
    global(json_rpc("organizations", "2016-11-28", "AWSOrganizationsV20161128", "1.1")),
    json_rpc("tagging", "2017-01-26", "ResourceGroupsTaggingAPI_20170126", "1.1"),
    json_rpc("wafv2", "2019-07-29", "AWSWAF_20190729", "1.1"),
    json_rpc(
        "cloudtrail",
        "2013-11-01",
        "com.amazonaws.cloudtrail.v20131101.CloudTrail_20131101",
        "1.1",
    ),
    json_rpc("acm", "2015-12-08", "CertificateManager", "1.1"),
    rest("s3", "2006-03-01", Dialect::RestXml),
    global(rest("route53", "2013-04-01", Dialect::RestXml)),
];

/// Look a service up by name.
pub fn service(name: &str) -> AwsResult<&'static ServiceDescriptor> {
    SERVICES
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| AwsError::not_supported(name, &format!("unknown service '{}'", name)))
}

// ── Endpoints ───────────────────────────────────────────────────────────

/// Where a service client sends requests and how it scopes signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Scheme and authority without a trailing slash.
    pub base_url: String,
    pub host: String,
    pub signing_region: String,
}

/// Resolve the endpoint for `desc` in `region`.
pub fn endpoint_for(
    desc: &ServiceDescriptor,
    region: &str,
    env: AccessEnvironment,
    endpoint_override: Option<&str>,
) -> Endpoint {
    let signing_region = if desc.global {
        global_signing_region(desc, env)
    } else {
        region.to_string()
    };
    if let Some(base) = endpoint_override {
        let base = base.trim_end_matches('/').to_string();
        let host = url::Url::parse(&base)
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(p) => format!("{}:{}", h, p),
                    None => h.to_string(),
                })
            })
            .unwrap_or_else(|| base.clone());
        return Endpoint {
            base_url: base,
            host,
            signing_region,
        };
    }

    let suffix = env.dns_suffix();
    let host = match (desc.name, env) {
        ("iam", AccessEnvironment::Global) => "iam.amazonaws.com".to_string(),
        ("iam", AccessEnvironment::China) => format!("iam.cn-north-1.{}", suffix),
        ("route53", _) => format!("route53.{}", suffix),
        _ if desc.global => format!("{}.{}.{}", desc.endpoint_prefix, signing_region, suffix),
        _ => format!("{}.{}.{}", desc.endpoint_prefix, region, suffix),
    };
    Endpoint {
        base_url: format!("https://{}", host),
        host,
        signing_region,
    }
}

fn global_signing_region(desc: &ServiceDescriptor, env: AccessEnvironment) -> String {
    match (desc.name, env) {
        ("iam", AccessEnvironment::China) => "cn-north-1".to_string(),
        _ => env.global_signing_region().to_string(),
    }
}

// ── Operation ───────────────────────────────────────────────────────────

/// Choose the HTTP verb for an API.
///
/// `List*`, `Describe*` and `Get*` read with GET, `Delete*` uses DELETE and
/// everything else is POST. Services that mandate POST override all of it.
pub fn derive_method(api_name: &str, post_only: bool) -> HttpMethod {
    if post_only {
        return HttpMethod::Post;
    }
    if ["List", "Describe", "Get"]
        .iter()
        .any(|p| api_name.starts_with(p))
    {
        HttpMethod::Get
    } else if api_name.starts_with("Delete") {
        HttpMethod::Delete
    } else {
        HttpMethod::Post
    }
}

/// One API invocation as the dialects see it.
#[derive(Debug, Clone)]
pub struct Operation<'a> {
    pub api_name: &'a str,
    pub api_version: &'a str,
    pub method: HttpMethod,
    pub path_template: &'a str,
}

/// Output of the build stage, before signing.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    pub method: HttpMethod,
    /// Encoded path, always starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl EncodedRequest {
    /// `/path` or `/path?k=v`. No `?` when there is no query.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, form_encode(&self.query))
        }
    }
}

/// Replace `{name}` placeholders with values taken out of `params`.
///
/// `{name+}` keeps slashes in the value. A missing or empty value is an
/// `InvalidParameter` error.
pub fn substitute_path(template: &str, params: &mut Params) -> AwsResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            AwsError::invalid_parameter("dispatcher", &format!("unclosed placeholder in '{}'", template))
        })?;
        let raw = &after[..end];
        let (key, greedy) = match raw.strip_suffix('+') {
            Some(k) => (k, true),
            None => (raw, false),
        };
        let value = params
            .remove(key)
            .and_then(|v| v.as_scalar())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AwsError::invalid_parameter(
                    "dispatcher",
                    &format!("path parameter '{}' is missing or empty", key),
                )
            })?;
        if greedy {
            out.push_str(&uri_encode_path(&value));
        } else {
            out.push_str(&uri_encode(&value));
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    if !out.starts_with('/') {
        out.insert(0, '/');
    }
    Ok(out)
}

/// `k=v&k=v` with RFC 3986 encoding, in the given order.
pub fn form_encode(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// REST query pairs: lists repeat the key, maps flatten with dots.
fn rest_query(params: &Params) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (k, v) in params.iter() {
        match v {
            ParamValue::List(items) => {
                out.extend(items.iter().filter_map(|i| i.as_scalar()).map(|s| (k.clone(), s)));
            }
            ParamValue::Map(_) => {
                out.extend(Params::new().with(k, v.clone()).flatten());
            }
            scalar => {
                if let Some(s) = scalar.as_scalar() {
                    out.push((k.clone(), s));
                }
            }
        }
    }
    out
}

// ── Codec ───────────────────────────────────────────────────────────────

/// Dialect behaviour used by the dispatcher's build and unmarshal stages.
pub trait Codec {
    /// Encode the operation and its parameters.
    fn build_body(&self, op: &Operation<'_>, params: Params) -> AwsResult<EncodedRequest>;

    /// Decode a success body into a JSON value ready for the result sink.
    fn decode_body(&self, op: &Operation<'_>, service: &str, body: &[u8]) -> AwsResult<Value>;

    /// Decode a failure body. Never fails; unreadable bodies become `Other`.
    fn decode_error(&self, service: &str, status_code: u16, body: &[u8]) -> AwsError;
}

impl Codec for Dialect {
    fn build_body(&self, op: &Operation<'_>, mut params: Params) -> AwsResult<EncodedRequest> {
        let mut headers = BTreeMap::new();
        match self {
            Self::Ec2Query | Self::Query => {
                let mut pairs = vec![
                    ("Action".to_string(), op.api_name.to_string()),
                    ("Version".to_string(), op.api_version.to_string()),
                ];
                pairs.extend(params.flatten());
                if op.method.has_body() {
                    headers.insert(
                        "content-type".to_string(),
                        "application/x-www-form-urlencoded; charset=utf-8".to_string(),
                    );
                    Ok(EncodedRequest {
                        method: op.method,
                        path: "/".to_string(),
                        query: Vec::new(),
                        headers,
                        body: Bytes::from(form_encode(&pairs)),
                    })
                } else {
                    Ok(EncodedRequest {
                        method: op.method,
                        path: "/".to_string(),
                        query: pairs,
                        headers,
                        body: Bytes::new(),
                    })
                }
            }
            Self::JsonRpc {
                target_prefix,
                json_version,
            } => {
                headers.insert(
                    "content-type".to_string(),
                    format!("application/x-amz-json-{}", json_version),
                );
                headers.insert(
                    "x-amz-target".to_string(),
                    format!("{}.{}", target_prefix, op.api_name),
                );
                let body = serde_json::to_vec(&params.to_json())?;
                Ok(EncodedRequest {
                    method: HttpMethod::Post,
                    path: "/".to_string(),
                    query: Vec::new(),
                    headers,
                    body: Bytes::from(body),
                })
            }
            Self::RestJson | Self::RestXml => {
                let path = substitute_path(op.path_template, &mut params)?;
                if op.method.has_body() && *self == Self::RestJson {
                    let body = if params.is_empty() {
                        Bytes::new()
                    } else {
                        headers.insert("content-type".to_string(), "application/json".to_string());
                        Bytes::from(serde_json::to_vec(&params.to_json())?)
                    };
                    Ok(EncodedRequest {
                        method: op.method,
                        path,
                        query: Vec::new(),
                        headers,
                        body,
                    })
                } else {
                    Ok(EncodedRequest {
                        method: op.method,
                        path,
                        query: rest_query(&params),
                        headers,
                        body: Bytes::new(),
                    })
                }
            }
        }
    }

    fn decode_body(&self, op: &Operation<'_>, service: &str, body: &[u8]) -> AwsResult<Value> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Object(Default::default()));
        }
        if self.is_json() {
            let value: Value = serde_json::from_slice(body).map_err(|e| {
                AwsError::malformed(service, &format!("invalid JSON response: {}", e), 200)
            })?;
            if value.get("__type").is_some() || value.get("Errors").is_some() {
                return Err(self.decode_error(service, 200, body));
            }
            return Ok(value);
        }

        let text = String::from_utf8_lossy(body);
        let root = crate::xml::parse(&text).map_err(|e| {
            AwsError::malformed(service, &format!("invalid XML response: {}", e.message), 200)
        })?;
        let result_name = format!("{}Result", op.api_name);
        let value = match root.find(&result_name) {
            Some(result) => result.to_json(),
            None if *self == Self::Query => Value::Object(Default::default()),
            None => root.to_json(),
        };
        Ok(match value {
            Value::String(s) if s.is_empty() => Value::Object(Default::default()),
            other => other,
        })
    }

    fn decode_error(&self, service: &str, status_code: u16, body: &[u8]) -> AwsError {
        let text = String::from_utf8_lossy(body);
        if text.trim().is_empty() {
            return AwsError::from_status(service, status_code, "");
        }
        if self.is_json() {
            AwsError::parse_json_error(service, status_code, &text)
        } else {
            AwsError::parse_xml_error(service, status_code, &text)
        }
    }
}
