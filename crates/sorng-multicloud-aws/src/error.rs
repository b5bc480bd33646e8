//! Error model shared by every layer of the adapter.
//!
//! Provider errors arrive in several shapes (query XML, EC2 XML, JSON-RPC
//! `__type` bodies, bare HTTP statuses). They are all folded into one
//! [`AwsError`] carrying a canonical [`ErrorKind`] plus the raw code, raw
//! message and request id, so callers switch on the kind and operators can
//! still cross-reference the provider's audit logs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical, provider-agnostic error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    Throttled,
    AccessDenied,
    InvalidState,
    InvalidParameter,
    NotSupported,
    Timeout,
    /// Missing credentials, unknown region and similar setup faults.
    /// Raised before the first network call.
    Configuration,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "NotFound",
            Self::Duplicate => "Duplicate",
            Self::Throttled => "Throttled",
            Self::AccessDenied => "AccessDenied",
            Self::InvalidState => "InvalidState",
            Self::InvalidParameter => "InvalidParameter",
            Self::NotSupported => "NotSupported",
            Self::Timeout => "Timeout",
            Self::Configuration => "Configuration",
            Self::Other => "Other",
        };
        f.write_str(s)
    }
}

/// Top-level error type for all adapter operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsError {
    /// Canonical classification.
    pub kind: ErrorKind,
    /// The raw provider error code (e.g. "InvalidInstanceID.NotFound").
    pub code: String,
    /// Raw provider message.
    pub message: String,
    /// HTTP status, 0 when the error never reached the wire.
    pub status_code: u16,
    /// Provider request id, when the response carried one.
    pub request_id: Option<String>,
    /// Service that produced the error (e.g. "ec2").
    pub service: String,
    /// API name that failed.
    pub action: Option<String>,
    /// Whether the dispatcher may retry the call.
    pub retryable: bool,
}

impl fmt::Display for AwsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.service)?;
        if let Some(ref action) = self.action {
            write!(f, ".{}", action)?;
        }
        write!(f, " [{}]: {}", self.code, self.message)?;
        if self.status_code != 0 {
            write!(f, " (HTTP {})", self.status_code)?;
        }
        if let Some(ref req_id) = self.request_id {
            write!(f, " [RequestId: {}]", req_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for AwsError {}

impl AwsError {
    /// Create an error from a provider code and status; the kind is derived.
    pub fn new(service: &str, code: &str, message: &str, status_code: u16) -> Self {
        let kind = classify(code, status_code);
        Self {
            kind,
            code: code.to_string(),
            message: message.to_string(),
            status_code,
            request_id: None,
            service: service.to_string(),
            action: None,
            retryable: is_retryable(kind, code, status_code),
        }
    }

    /// Create an error with an explicit kind, for faults raised locally.
    pub fn with_kind(kind: ErrorKind, service: &str, message: &str) -> Self {
        Self {
            kind,
            code: kind.to_string(),
            message: message.to_string(),
            status_code: 0,
            request_id: None,
            service: service.to_string(),
            action: None,
            retryable: kind == ErrorKind::Throttled,
        }
    }

    pub fn not_found(service: &str, message: &str) -> Self {
        Self::with_kind(ErrorKind::NotFound, service, message)
    }

    pub fn invalid_parameter(service: &str, message: &str) -> Self {
        Self::with_kind(ErrorKind::InvalidParameter, service, message)
    }

    pub fn not_supported(service: &str, message: &str) -> Self {
        Self::with_kind(ErrorKind::NotSupported, service, message)
    }

    pub fn timeout(service: &str, message: &str) -> Self {
        Self::with_kind(ErrorKind::Timeout, service, message)
    }

    pub fn configuration(message: &str) -> Self {
        Self::with_kind(ErrorKind::Configuration, "config", message)
    }

    /// Wrap a decode failure. Never retryable.
    pub fn malformed(service: &str, message: &str, status_code: u16) -> Self {
        Self {
            kind: ErrorKind::Other,
            code: "MalformedResponse".to_string(),
            message: message.to_string(),
            status_code,
            request_id: None,
            service: service.to_string(),
            action: None,
            retryable: false,
        }
    }

    /// With request ID.
    pub fn with_request_id(mut self, id: String) -> Self {
        self.request_id = Some(id);
        self
    }

    /// With action.
    pub fn with_action(mut self, action: &str) -> Self {
        self.action = Some(action.to_string());
        self
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Parse a query or EC2 style XML error body.
    ///
    /// Two shapes are recognised:
    /// ```xml
    /// <ErrorResponse><Error><Code>..</Code><Message>..</Message></Error><RequestId>..</RequestId></ErrorResponse>
    /// <Response><Errors><Error><Code>..</Code><Message>..</Message></Error></Errors><RequestID>..</RequestID></Response>
    /// ```
    /// S3 style `<Error>` roots are accepted too.
    pub fn parse_xml_error(service: &str, status_code: u16, body: &str) -> Self {
        let root = match crate::xml::parse(body) {
            Ok(root) => root,
            Err(_) => return Self::from_status(service, status_code, body),
        };
        let error = if root.name == "Error" {
            Some(&root)
        } else {
            root.child("Error")
                .or_else(|| root.child("Errors").and_then(|errs| errs.child("Error")))
        };
        let Some(error) = error else {
            return Self::from_status(service, status_code, body);
        };
        let code = error.child_text("Code").unwrap_or("UnknownError");
        let message = error
            .child_text("Message")
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {} from {}", status_code, service));
        let request_id = root
            .child_text("RequestId")
            .or_else(|| root.child_text("RequestID"))
            .or_else(|| error.child_text("RequestId"));

        let mut err = Self::new(service, code, &message, status_code);
        err.request_id = request_id.map(str::to_string);
        err
    }

    /// Parse a JSON error body.
    ///
    /// ```json
    /// {"__type": "com.amazonaws.ecs#ClusterNotFoundException", "message": "..."}
    /// {"Errors": [{"Code": "...", "Message": "..."}]}
    /// ```
    pub fn parse_json_error(service: &str, status_code: u16, body: &str) -> Self {
        let val = match serde_json::from_str::<serde_json::Value>(body) {
            Ok(v) => v,
            Err(_) => return Self::from_status(service, status_code, body),
        };
        let source = val
            .get("Errors")
            .and_then(|e| e.as_array())
            .and_then(|arr| arr.first())
            .unwrap_or(&val);
        let code = source
            .get("__type")
            .or_else(|| source.get("code"))
            .or_else(|| source.get("Code"))
            .and_then(|v| v.as_str())
            .map(|s| {
                // "com.amazonaws.ecs#ClusterNotFoundException" or "X:http://..."
                let s = s.rsplit('#').next().unwrap_or(s);
                s.split(':').next().unwrap_or(s).to_string()
            });
        let Some(code) = code else {
            return Self::from_status(service, status_code, body);
        };
        let message = source
            .get("message")
            .or_else(|| source.get("Message"))
            .or_else(|| source.get("errorMessage"))
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown error");
        Self::new(service, &code, message, status_code)
    }

    /// Error derived from the HTTP status alone, used when the body is empty
    /// or unreadable.
    pub fn from_status(service: &str, status_code: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        let mut err = Self::new(service, &format!("Http{}", status_code), &snippet, status_code);
        if err.kind == ErrorKind::Other && !body.trim().is_empty() && status_code < 500 {
            err.code = "MalformedResponse".to_string();
            err.message = format!("Failed to parse error response: {}", snippet);
        }
        err
    }
}

/// Map a provider error code and HTTP status onto a canonical kind.
///
/// Pure and deterministic: the same input always yields the same kind.
pub fn classify(code: &str, status_code: u16) -> ErrorKind {
    if status_code == 404 {
        return ErrorKind::NotFound;
    }
    if code.contains("NotFound") || code == "NoSuchEntity" || code.starts_with("NoSuch") {
        return ErrorKind::NotFound;
    }
    if code.contains("Throttl")
        || matches!(
            code,
            "RequestLimitExceeded"
                | "TooManyRequestsException"
                | "ProvisionedThroughputExceededException"
                | "BandwidthLimitExceeded"
                | "SlowDown"
                | "PriorRequestNotComplete"
        )
    {
        return ErrorKind::Throttled;
    }
    if code.contains("AccessDenied")
        || code.contains("Unauthorized")
        || matches!(
            code,
            "AuthFailure" | "Forbidden" | "InvalidClientTokenId" | "SignatureDoesNotMatch"
                | "ExpiredToken" | "OptInRequired"
        )
    {
        return ErrorKind::AccessDenied;
    }
    if code.contains("AlreadyExists")
        || code.contains("Duplicate")
        || matches!(code, "BucketAlreadyOwnedByYou" | "InvalidChangeBatch.Duplicate")
    {
        return ErrorKind::Duplicate;
    }
    if code.contains("IncorrectState")
        || code.contains("InvalidState")
        || code.contains("IncorrectInstanceState")
        || matches!(
            code,
            "DependencyViolation" | "ResourceInUseException" | "ConflictException"
                | "ConcurrentModificationException" | "OperationAborted"
        )
    {
        return ErrorKind::InvalidState;
    }
    if code.starts_with("RequestTimeout") || code == "RequestExpired" {
        return ErrorKind::Timeout;
    }
    if code.contains("Unsupported")
        || code.contains("NotImplemented")
        || code == "AWSOrganizationsNotInUseException"
    {
        return ErrorKind::NotSupported;
    }
    if code.starts_with("Invalid")
        || code.contains("Validation")
        || code.starts_with("Missing")
        || code.contains("Malformed")
        || code == "UnknownParameter"
    {
        return ErrorKind::InvalidParameter;
    }
    match status_code {
        401 | 403 => ErrorKind::AccessDenied,
        408 | 504 => ErrorKind::Timeout,
        409 => ErrorKind::InvalidState,
        429 => ErrorKind::Throttled,
        _ => ErrorKind::Other,
    }
}

/// Whether a failed call may be attempted again by the dispatcher.
fn is_retryable(kind: ErrorKind, code: &str, status_code: u16) -> bool {
    if kind == ErrorKind::Throttled {
        return true;
    }
    if matches!(status_code, 500 | 502 | 503 | 504) {
        return true;
    }
    matches!(
        code,
        "InternalError" | "InternalFailure" | "ServiceUnavailable" | "IDPCommunicationError"
    )
}

impl From<reqwest::Error> for AwsError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::Other
        };
        Self {
            kind,
            code: "HttpError".to_string(),
            message: err.to_string(),
            status_code: err.status().map(|s| s.as_u16()).unwrap_or(0),
            request_id: None,
            service: "http".to_string(),
            action: None,
            retryable: err.is_timeout() || err.is_connect(),
        }
    }
}

impl From<serde_json::Error> for AwsError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed("json", &err.to_string(), 0)
    }
}

impl From<quick_xml::Error> for AwsError {
    fn from(err: quick_xml::Error) -> Self {
        Self::malformed("xml", &err.to_string(), 0)
    }
}

impl From<std::io::Error> for AwsError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Other,
        };
        Self::with_kind(kind, "io", &err.to_string())
    }
}

/// Convenience result type for adapter operations.
pub type AwsResult<T> = Result<T, AwsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = AwsError::new("ec2", "InvalidInstanceID.NotFound", "Instance not found", 400)
            .with_action("DescribeInstances");
        let s = err.to_string();
        assert!(s.starts_with("NotFound ec2.DescribeInstances"));
        assert!(s.contains("InvalidInstanceID.NotFound"));
        assert!(s.contains("400"));
    }

    #[test]
    fn error_display_with_request_id() {
        let err = AwsError::new("s3", "NoSuchBucket", "Bucket not found", 404)
            .with_request_id("req-abc-123".into());
        assert!(err.to_string().contains("req-abc-123"));
    }

    #[test]
    fn parse_query_error_shape() {
        let xml = r#"<ErrorResponse><Error><Type>Sender</Type><Code>AccessDenied</Code><Message>Access Denied</Message></Error><RequestId>xyz-789</RequestId></ErrorResponse>"#;
        let err = AwsError::parse_xml_error("iam", 403, xml);
        assert_eq!(err.kind, ErrorKind::AccessDenied);
        assert_eq!(err.code, "AccessDenied");
        assert_eq!(err.message, "Access Denied");
        assert_eq!(err.request_id.as_deref(), Some("xyz-789"));
    }

    #[test]
    fn parse_ec2_error_shape() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<Response><Errors><Error><Code>InvalidInstanceID.Malformed</Code><Message>Invalid id: "x"</Message></Error></Errors><RequestID>ec2-req-1</RequestID></Response>"#;
        let err = AwsError::parse_xml_error("ec2", 400, xml);
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        assert_eq!(err.code, "InvalidInstanceID.Malformed");
        assert_eq!(err.request_id.as_deref(), Some("ec2-req-1"));
    }

    #[test]
    fn parse_json_type_shape() {
        let json = r#"{"__type":"com.amazonaws.ecs#ClusterNotFoundException","message":"Cluster not found."}"#;
        let err = AwsError::parse_json_error("ecs", 400, json);
        assert_eq!(err.code, "ClusterNotFoundException");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn parse_json_errors_array_shape() {
        let json = r#"{"Errors":[{"Code":"ThrottlingException","Message":"Rate exceeded"}]}"#;
        let err = AwsError::parse_json_error("tagging", 400, json);
        assert_eq!(err.kind, ErrorKind::Throttled);
        assert!(err.retryable);
    }

    #[test]
    fn malformed_bodies_become_other() {
        let err = AwsError::parse_xml_error("ec2", 400, "<Response><Errors>");
        assert_eq!(err.kind, ErrorKind::Other);
        let err = AwsError::parse_json_error("ecs", 400, "{not json");
        assert_eq!(err.kind, ErrorKind::Other);
        assert!(!err.retryable);
    }

    #[test]
    fn status_404_is_not_found_regardless_of_code() {
        assert_eq!(classify("SomethingOdd", 404), ErrorKind::NotFound);
        assert_eq!(classify("", 404), ErrorKind::NotFound);
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify("NoSuchEntity", 400), ErrorKind::NotFound);
        assert_eq!(classify("Throttling", 400), ErrorKind::Throttled);
        assert_eq!(classify("RequestLimitExceeded", 503), ErrorKind::Throttled);
        assert_eq!(classify("EntityAlreadyExists", 409), ErrorKind::Duplicate);
        assert_eq!(classify("InvalidGroup.Duplicate", 400), ErrorKind::Duplicate);
        assert_eq!(classify("IncorrectInstanceState", 400), ErrorKind::InvalidState);
        assert_eq!(classify("UnsupportedOperation", 400), ErrorKind::NotSupported);
        assert_eq!(classify("InvalidParameterValue", 400), ErrorKind::InvalidParameter);
        assert_eq!(classify("UnauthorizedOperation", 403), ErrorKind::AccessDenied);
        assert_eq!(classify("RequestTimeout", 400), ErrorKind::Timeout);
        assert_eq!(classify("Http500", 500), ErrorKind::Other);
    }

    #[test]
    fn classification_is_deterministic() {
        for (code, status) in [("Throttling", 400), ("Foo", 403), ("Bar", 418)] {
            assert_eq!(classify(code, status), classify(code, status));
        }
    }

    #[test]
    fn not_retryable_auth() {
        let err = AwsError::new("iam", "AccessDenied", "Not authorized", 403);
        assert!(!err.retryable);
    }

    #[test]
    fn retryable_503() {
        let err = AwsError::new("s3", "ServiceUnavailable", "Slow down", 503);
        assert!(err.retryable);
    }

    #[test]
    fn serde_roundtrip() {
        let err = AwsError::new("s3", "NoSuchKey", "Key not found", 404)
            .with_request_id("r-123".into())
            .with_action("GetObject");
        let json = serde_json::to_string(&err).unwrap();
        let back: AwsError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::NotFound);
        assert_eq!(back.action.as_deref(), Some("GetObject"));
        assert_eq!(back.request_id.as_deref(), Some("r-123"));
    }
}
