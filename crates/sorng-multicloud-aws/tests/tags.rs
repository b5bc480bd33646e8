mod common;

use common::*;
use serde_json::json;
use sorng_multicloud_aws::tags::TaggingClient;
use sorng_multicloud_aws::{CallContext, ErrorKind, TagMap};

const ARN: &str = "arn:aws:ec2:us-west-1:111111111111:instance/i-0abc";

fn tags(pairs: &[(&str, &str)]) -> TagMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[tokio::test]
async fn replace_untags_before_tagging() {
    let mock = MockTransport::new();
    mock.on_api("UntagResources", vec![json(200, json!({ "FailedResourcesMap": {} }))]);
    mock.on_api("TagResources", vec![json(200, json!({ "FailedResourcesMap": {} }))]);
    let dispatcher = dispatcher(&mock);

    let old = tags(&[("env", "dev"), ("team", "a")]);
    let new = tags(&[("env", "prod"), ("owner", "b")]);
    let diff = TaggingClient::new(&dispatcher, "us-west-1")
        .set_tags(&CallContext::background(), ARN, &old, &new, true)
        .await
        .unwrap();

    assert_eq!(diff.removed, old);
    assert_eq!(diff.added, new);
    assert_eq!(mock.calls(), vec!["UntagResources", "TagResources"]);

    let requests = mock.requests();
    assert_eq!(
        json_body(&requests[0]),
        json!({ "ResourceARNList": [ARN], "TagKeys": ["env", "team"] })
    );
    assert_eq!(
        json_body(&requests[1]),
        json!({ "ResourceARNList": [ARN], "Tags": { "env": "prod", "owner": "b" } })
    );
    assert_eq!(requests[1].headers["x-amz-target"], "ResourceGroupsTaggingAPI_20170126.TagResources");
}

#[tokio::test]
async fn unchanged_tags_send_nothing() {
    let mock = MockTransport::new();
    let dispatcher = dispatcher(&mock);
    let current = tags(&[("env", "dev")]);

    let diff = TaggingClient::new(&dispatcher, "us-west-1")
        .set_tags(&CallContext::background(), ARN, &current, &current, true)
        .await
        .unwrap();

    assert!(diff.is_empty());
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn reserved_keys_are_rejected_before_sending() {
    let mock = MockTransport::new();
    let dispatcher = dispatcher(&mock);

    let err = TaggingClient::new(&dispatcher, "us-west-1")
        .set_tags(
            &CallContext::background(),
            ARN,
            &TagMap::new(),
            &tags(&[("aws:cloudformation:stack-name", "x")]),
            false,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::InvalidParameter);
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn per_resource_failure_stops_before_tagging() {
    let mock = MockTransport::new();
    mock.on_api(
        "UntagResources",
        vec![json(200, json!({
            "FailedResourcesMap": {
                ARN: { "ErrorCode": "InvalidParameterException", "ErrorMessage": "bad key", "StatusCode": 400 }
            }
        }))],
    );
    let dispatcher = dispatcher(&mock);

    let err = TaggingClient::new(&dispatcher, "us-west-1")
        .set_tags(
            &CallContext::background(),
            ARN,
            &tags(&[("env", "dev")]),
            &tags(&[("env", "prod")]),
            false,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::InvalidParameter);
    assert_eq!(err.action.as_deref(), Some("UntagResources"));
    assert!(err.message.contains("bad key"));
    assert_eq!(mock.calls(), vec!["UntagResources"]);
}

#[tokio::test]
async fn current_tags_are_read_across_pages() {
    let mock = MockTransport::new();
    mock.on_api(
        "GetResources",
        vec![
            json(200, json!({
                "ResourceTagMappingList": [
                    { "ResourceARN": ARN, "Tags": [{ "Key": "env", "Value": "dev" }] }
                ],
                "PaginationToken": "next"
            })),
            json(200, json!({
                "ResourceTagMappingList": [
                    { "ResourceARN": ARN, "Tags": [{ "Key": "team", "Value": "a" }] }
                ],
                "PaginationToken": ""
            })),
        ],
    );
    let dispatcher = dispatcher(&mock);

    let current = TaggingClient::new(&dispatcher, "us-west-1")
        .get_tags(&CallContext::background(), ARN)
        .await
        .unwrap();

    assert_eq!(current, tags(&[("env", "dev"), ("team", "a")]));
    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(json_body(&requests[1])["PaginationToken"], "next");
}
