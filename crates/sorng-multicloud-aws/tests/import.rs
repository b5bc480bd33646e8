mod common;

use common::*;
use sorng_multicloud_aws::import::{
    DiskFormat, ExportState, ImageTransfer, ImportOptions, ImportRequest, ImportState,
};
use sorng_multicloud_aws::{CallContext, ErrorKind, HttpMethod, HttpResponse, OsType};
use std::io::Write;
use std::time::Duration;

const BUCKET: &str = "/imgcache-us-west-1-img-1";
const OBJECT: &str = "/imgcache-us-west-1-img-1/img-1";

fn image_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[7u8; 4096]).unwrap();
    file.flush().unwrap();
    file
}

fn request(file: &tempfile::NamedTempFile) -> ImportRequest {
    ImportRequest {
        image_id: "img-1".into(),
        path: file.path().to_path_buf(),
        format: DiskFormat::Raw,
        os_type: Some(OsType::Linux),
        architecture: Some("x86_64".into()),
        description: None,
    }
}

fn fast_options() -> ImportOptions {
    ImportOptions {
        poll_interval: Duration::from_millis(10),
        deadline: Duration::from_secs(5),
        ..ImportOptions::default()
    }
}

fn task(status: &str, progress: Option<&str>, image_id: Option<&str>) -> HttpResponse {
    let mut item = format!(
        "<importTaskId>import-ami-1</importTaskId><status>{}</status>",
        status
    );
    if let Some(p) = progress {
        item.push_str(&format!("<progress>{}</progress>", p));
    }
    if let Some(id) = image_id {
        item.push_str(&format!("<imageId>{}</imageId>", id));
    }
    if status == "deleted" {
        item.push_str("<statusMessage>ClientError: Disk validation failed</statusMessage>");
    }
    xml(
        200,
        &format!(
            "<DescribeImportImageTasksResponse><importImageTaskSet><item>{}</item></importImageTaskSet></DescribeImportImageTasksResponse>",
            item
        ),
    )
}

/// Role setup and upload routes shared by every import test.
fn script_setup(mock: &MockTransport, bucket_exists: bool) {
    if bucket_exists {
        mock.on_rest(HttpMethod::Head, BUCKET, vec![empty(200)]);
    } else {
        mock.on_rest(HttpMethod::Head, BUCKET, vec![empty(404)]);
        mock.on_rest(HttpMethod::Put, BUCKET, vec![empty(200)]);
    }
    mock.on_api("GetRole", vec![query_error(404, "NoSuchEntity")]);
    mock.on_api(
        "CreateRole",
        vec![xml(200, "<CreateRoleResponse><CreateRoleResult><Role><RoleName>vmimport</RoleName></Role></CreateRoleResult></CreateRoleResponse>")],
    );
    mock.on_api("PutRolePolicy", vec![xml(200, "<PutRolePolicyResponse/>")]);
    mock.on_rest(
        HttpMethod::Put,
        OBJECT,
        vec![with_header(empty(200), "ETag", "\"etag-1\"")],
    );
    mock.on_api(
        "ImportImage",
        vec![xml(200, "<ImportImageResponse><importTaskId>import-ami-1</importTaskId></ImportImageResponse>")],
    );
    mock.on_rest(HttpMethod::Delete, OBJECT, vec![empty(204)]);
    mock.on_rest(HttpMethod::Delete, BUCKET, vec![empty(204)]);
}

#[tokio::test]
async fn deleted_task_fails_and_cleans_up() {
    let mock = MockTransport::new();
    script_setup(&mock, false);
    mock.on_api(
        "DescribeImportImageTasks",
        vec![task("active", Some("20"), None), task("deleted", None, None)],
    );
    let dispatcher = dispatcher(&mock);
    let file = image_file();
    let mut states = Vec::new();

    let outcome = ImageTransfer::new(&dispatcher, "us-west-1")
        .options(fast_options())
        .import_image(&CallContext::background(), &request(&file), &mut |state, percent| {
            states.push((state, percent))
        })
        .await
        .unwrap();

    assert_eq!(outcome.state, ImportState::Failed);
    assert_eq!(outcome.task_id, "import-ami-1");
    assert!(outcome.image_id.is_none());
    assert!(outcome.status_message.unwrap_or_default().contains("Disk validation"));

    let calls = mock.calls();
    assert!(calls.contains(&format!("DELETE {}", OBJECT)));
    assert!(calls.contains(&format!("DELETE {}", BUCKET)));
    assert!(!calls.contains(&"CancelImportTask".to_string()));

    assert_eq!(states.first().map(|s| s.0), Some(ImportState::QueueingUpload));
    assert_eq!(states.last().map(|s| s.0), Some(ImportState::Failed));
    assert!(states.iter().any(|(s, _)| *s == ImportState::Uploading));
    assert!(states.iter().any(|(s, _)| *s == ImportState::Importing));
}

#[tokio::test]
async fn completed_task_yields_the_registered_image() {
    let mock = MockTransport::new();
    script_setup(&mock, true);
    mock.on_api(
        "DescribeImportImageTasks",
        vec![task("active", Some("50"), None), task("completed", None, Some("ami-0123"))],
    );
    let dispatcher = dispatcher(&mock);
    let file = image_file();
    let mut states = Vec::new();

    let outcome = ImageTransfer::new(&dispatcher, "us-west-1")
        .options(fast_options())
        .import_image(&CallContext::background(), &request(&file), &mut |state, percent| {
            states.push((state, percent))
        })
        .await
        .unwrap();

    assert_eq!(outcome.state, ImportState::Ready);
    assert_eq!(outcome.image_id.as_deref(), Some("ami-0123"));
    assert_eq!(states.last(), Some(&(ImportState::Ready, 100.0)));
    let percents: Vec<f64> = states.iter().map(|(_, p)| *p).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);

    // The bucket existed before this run, so only the object goes.
    let calls = mock.calls();
    assert!(calls.contains(&format!("DELETE {}", OBJECT)));
    assert!(!calls.contains(&format!("DELETE {}", BUCKET)));
    assert!(!calls.contains(&format!("PUT {}", BUCKET)));

    let requests = mock.requests();
    let import = requests
        .iter()
        .find(|r| api_name(r).as_deref() == Some("ImportImage"))
        .unwrap();
    let sent = params(import);
    assert_eq!(sent["DiskContainer.1.Format"], "RAW");
    assert_eq!(sent["DiskContainer.1.UserBucket.S3Bucket"], "imgcache-us-west-1-img-1");
    assert_eq!(sent["DiskContainer.1.UserBucket.S3Key"], "img-1");
    assert_eq!(sent["RoleName"], "vmimport");
    assert_eq!(sent["Platform"], "Linux");
}

#[tokio::test]
async fn the_service_role_is_created_with_its_trust_policy() {
    let mock = MockTransport::new();
    script_setup(&mock, true);
    mock.on_api("DescribeImportImageTasks", vec![task("completed", None, Some("ami-1"))]);
    let dispatcher = dispatcher(&mock);
    let file = image_file();

    ImageTransfer::new(&dispatcher, "us-west-1")
        .options(fast_options())
        .import_image(&CallContext::background(), &request(&file), &mut |_, _| {})
        .await
        .unwrap();

    let requests = mock.requests();
    let create = requests
        .iter()
        .find(|r| api_name(r).as_deref() == Some("CreateRole"))
        .unwrap();
    let sent = params(create);
    assert_eq!(sent["RoleName"], "vmimport");
    let trust: serde_json::Value = serde_json::from_str(&sent["AssumeRolePolicyDocument"]).unwrap();
    assert_eq!(trust["Statement"][0]["Principal"]["Service"], "vmie.amazonaws.com");

    let policy = requests
        .iter()
        .find(|r| api_name(r).as_deref() == Some("PutRolePolicy"))
        .unwrap();
    assert_eq!(params(policy)["PolicyName"], "vmimport");
}

#[tokio::test]
async fn a_stuck_task_times_out_and_is_cancelled() {
    let mock = MockTransport::new();
    script_setup(&mock, false);
    mock.on_api("DescribeImportImageTasks", vec![task("active", Some("10"), None)]);
    mock.on_api("CancelImportTask", vec![xml(200, "<CancelImportTaskResponse/>")]);
    let dispatcher = dispatcher(&mock);
    let file = image_file();
    let options = ImportOptions {
        poll_interval: Duration::from_millis(10),
        deadline: Duration::from_millis(60),
        ..ImportOptions::default()
    };

    let err = ImageTransfer::new(&dispatcher, "us-west-1")
        .options(options)
        .import_image(&CallContext::background(), &request(&file), &mut |_, _| {})
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Timeout);
    let calls = mock.calls();
    assert!(calls.contains(&"CancelImportTask".to_string()));
    assert!(calls.contains(&format!("DELETE {}", OBJECT)));
    assert!(calls.contains(&format!("DELETE {}", BUCKET)));
}

#[tokio::test]
async fn missing_file_fails_before_any_request() {
    let mock = MockTransport::new();
    let dispatcher = dispatcher(&mock);
    let request = ImportRequest {
        image_id: "img-1".into(),
        path: "/nonexistent/disk.raw".into(),
        format: DiskFormat::Vmdk,
        os_type: None,
        architecture: None,
        description: None,
    };

    let err = ImageTransfer::new(&dispatcher, "us-west-1")
        .import_image(&CallContext::background(), &request, &mut |_, _| {})
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::NotFound);
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn a_bucket_made_for_a_refused_role_is_removed() {
    let mock = MockTransport::new();
    mock.on_rest(HttpMethod::Head, BUCKET, vec![empty(404)]);
    mock.on_rest(HttpMethod::Put, BUCKET, vec![empty(200)]);
    mock.on_api("GetRole", vec![query_error(403, "AccessDenied")]);
    mock.on_api("CreateRole", vec![query_error(403, "AccessDenied")]);
    mock.on_rest(HttpMethod::Delete, BUCKET, vec![empty(204)]);
    let dispatcher = dispatcher(&mock);
    let file = image_file();

    let err = ImageTransfer::new(&dispatcher, "us-west-1")
        .options(fast_options())
        .import_image(&CallContext::background(), &request(&file), &mut |_, _| {})
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::AccessDenied);
    let calls = mock.calls();
    assert_eq!(calls.last(), Some(&format!("DELETE {}", BUCKET)));
    assert!(!calls.contains(&format!("PUT {}", OBJECT)));
    assert!(!calls.contains(&"ImportImage".to_string()));
}

#[tokio::test]
async fn export_downloads_the_object_then_cleans_up() {
    const EXPORT_BUCKET: &str = "/imgcache-us-west-1-ami-1";
    const EXPORT_OBJECT: &str = "/imgcache-us-west-1-ami-1/export-ami-1.vmdk";

    let mock = MockTransport::new();
    mock.on_rest(HttpMethod::Head, EXPORT_BUCKET, vec![empty(404)]);
    mock.on_rest(HttpMethod::Put, EXPORT_BUCKET, vec![empty(200)]);
    mock.on_api("GetRole", vec![xml(200, "<GetRoleResponse><GetRoleResult><Role><RoleName>vmimport</RoleName></Role></GetRoleResult></GetRoleResponse>")]);
    mock.on_api("PutRolePolicy", vec![xml(200, "<PutRolePolicyResponse/>")]);
    mock.on_api(
        "ExportImage",
        vec![xml(200, "<ExportImageResponse><exportImageTaskId>export-ami-1</exportImageTaskId></ExportImageResponse>")],
    );
    mock.on_api(
        "DescribeExportImageTasks",
        vec![
            xml(200, "<DescribeExportImageTasksResponse><exportImageTaskSet><item><exportImageTaskId>export-ami-1</exportImageTaskId><status>active</status><progress>40</progress></item></exportImageTaskSet></DescribeExportImageTasksResponse>"),
            xml(200, "<DescribeExportImageTasksResponse><exportImageTaskSet><item><exportImageTaskId>export-ami-1</exportImageTaskId><status>completed</status><s3ExportLocation><s3Bucket>imgcache-us-west-1-ami-1</s3Bucket></s3ExportLocation></item></exportImageTaskSet></DescribeExportImageTasksResponse>"),
        ],
    );
    mock.on_rest(
        HttpMethod::Head,
        EXPORT_OBJECT,
        vec![with_header(empty(200), "Content-Length", "8")],
    );
    mock.on_rest(HttpMethod::Get, EXPORT_OBJECT, vec![xml(200, "abcdefgh")]);
    mock.on_rest(HttpMethod::Delete, EXPORT_OBJECT, vec![empty(204)]);
    mock.on_rest(HttpMethod::Delete, EXPORT_BUCKET, vec![empty(204)]);
    let dispatcher = dispatcher(&mock);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("disk.vmdk");
    let mut states = Vec::new();

    let outcome = ImageTransfer::new(&dispatcher, "us-west-1")
        .options(fast_options())
        .export_image(
            &CallContext::background(),
            "ami-1",
            DiskFormat::Vmdk,
            &dest,
            &mut |state, percent| states.push((state, percent)),
        )
        .await
        .unwrap();

    assert_eq!(outcome.state, ExportState::Ready);
    assert_eq!(outcome.bytes, 8);
    assert_eq!(std::fs::read(&dest).unwrap(), b"abcdefgh");
    assert_eq!(states.last(), Some(&(ExportState::Ready, 100.0)));
    assert!(states.iter().any(|(s, _)| *s == ExportState::Downloading));

    let calls = mock.calls();
    assert!(!calls.contains(&"CreateRole".to_string()));
    assert!(calls.contains(&format!("DELETE {}", EXPORT_OBJECT)));
    assert!(calls.contains(&format!("DELETE {}", EXPORT_BUCKET)));

    let requests = mock.requests();
    let export = requests
        .iter()
        .find(|r| api_name(r).as_deref() == Some("ExportImage"))
        .unwrap();
    let sent = params(export);
    assert_eq!(sent["DiskImageFormat"], "VMDK");
    assert_eq!(sent["S3ExportLocation.S3Bucket"], "imgcache-us-west-1-ami-1");
}
