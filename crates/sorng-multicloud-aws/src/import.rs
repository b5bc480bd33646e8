//! Moving disk images between local storage and the provider.
//!
//! Import: stage the image in a per-image cache bucket, make sure the
//! `vmimport` role exists, start a VM import task and poll it until it
//! settles, then remove what was staged. Export runs the same path in
//! reverse. Both are sequential state machines; nothing fans out.

use crate::dispatcher::{ApiCall, Dispatcher};
use crate::error::{AwsError, AwsResult, ErrorKind};
use crate::iam::{IamClient, VMIMPORT_ROLE};
use crate::images::OsType;
use crate::params::Params;
use crate::storage::StorageClient;
use crate::transport::CallContext;
use crate::wait::wait_until;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const SERVICE: &str = "ec2";

/// Prefix of the temporary buckets.
pub const CACHE_BUCKET_PREFIX: &str = "imgcache-";
/// Share of the progress scale spent on the upload; the task gets the rest.
const UPLOAD_SHARE: f64 = 80.0;

/// Lifecycle of one import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    QueueingUpload,
    Uploading,
    Importing,
    Ready,
    Failed,
}

impl ImportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// Lifecycle of one export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    Exporting,
    Downloading,
    Ready,
    Failed,
}

/// Receives every state change and the overall percentage, 0 to 100.
pub type ImportProgressFn<'p> = dyn FnMut(ImportState, f64) + Send + 'p;
pub type ExportProgressFn<'p> = dyn FnMut(ExportState, f64) + Send + 'p;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Vhd,
    Vmdk,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::Vhd => "VHD",
            Self::Vmdk => "VMDK",
        }
    }

    /// File extension of exported objects.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Vhd => "vhd",
            Self::Vmdk => "vmdk",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub poll_interval: Duration,
    pub deadline: Duration,
    /// Remove the cache bucket afterwards when this run created it.
    pub delete_created_bucket: bool,
    pub part_size: Option<usize>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            deadline: Duration::from_secs(4 * 60 * 60),
            delete_created_bucket: true,
            part_size: None,
        }
    }
}

/// A local image to bring in.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    /// Local image id; names the bucket and the object.
    pub image_id: String,
    pub path: PathBuf,
    pub format: DiskFormat,
    pub os_type: Option<OsType>,
    pub architecture: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub state: ImportState,
    pub task_id: String,
    /// Registered image id once `Ready`.
    pub image_id: Option<String>,
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOutcome {
    pub state: ExportState,
    pub task_id: String,
    pub bytes: u64,
    pub status_message: Option<String>,
}

/// `imgcache-<region>-<imageId>`, lowercased for bucket naming rules.
pub fn cache_bucket_name(region: &str, image_id: &str) -> String {
    format!("{}{}-{}", CACHE_BUCKET_PREFIX, region, image_id).to_lowercase()
}

// ── Provider task shapes ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportImageTask {
    #[serde(default)]
    pub import_task_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeImportImageTasksResult {
    #[serde(default, deserialize_with = "crate::xml::de::one_or_many")]
    import_image_task_set: Vec<ImportImageTask>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3ExportLocation {
    #[serde(default)]
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportImageTask {
    #[serde(default)]
    pub export_image_task_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub s3_export_location: Option<S3ExportLocation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeExportImageTasksResult {
    #[serde(default, deserialize_with = "crate::xml::de::one_or_many")]
    export_image_task_set: Vec<ExportImageTask>,
}

/// How a provider task status string reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Deleted,
}

/// `completed` and `deleted` are terminal; everything else is running.
pub fn task_status(status: &str) -> TaskStatus {
    match status {
        "completed" => TaskStatus::Completed,
        "deleted" => TaskStatus::Deleted,
        _ => TaskStatus::Running,
    }
}

fn task_percent(progress: Option<&str>) -> f64 {
    progress
        .and_then(|p| p.trim().parse::<f64>().ok())
        .map(|p| p.clamp(0.0, 100.0))
        .unwrap_or(0.0)
}

fn scaled(start: f64, share: f64, percent: f64) -> f64 {
    start + share * percent / 100.0
}

fn report<S: Copy>(progress: &Mutex<&mut (dyn FnMut(S, f64) + Send + '_)>, state: S, percent: f64) {
    if let Ok(mut progress) = progress.lock() {
        (*progress)(state, percent);
    }
}

// ── Orchestrator ────────────────────────────────────────────────────────

pub struct ImageTransfer<'a> {
    dispatcher: &'a Dispatcher,
    region: String,
    options: ImportOptions,
}

impl<'a> ImageTransfer<'a> {
    pub fn new(dispatcher: &'a Dispatcher, region: &str) -> Self {
        Self {
            dispatcher,
            region: region.to_string(),
            options: ImportOptions::default(),
        }
    }

    pub fn options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    fn storage(&self) -> StorageClient<'a> {
        let storage = StorageClient::new(self.dispatcher, &self.region);
        match self.options.part_size {
            Some(size) => storage.part_size(size),
            None => storage,
        }
    }

    fn resolved_region(&self) -> AwsResult<String> {
        self.dispatcher.config().resolve_region(&self.region)
    }

    /// Bucket and role setup shared by both directions. Returns the bucket
    /// and whether this run created it.
    async fn prepare(&self, ctx: &CallContext, image_id: &str) -> AwsResult<(String, bool)> {
        let bucket = cache_bucket_name(&self.resolved_region()?, image_id);
        let created = self.storage().ensure_bucket(ctx, &bucket).await?;
        if let Err(err) = IamClient::new(self.dispatcher)
            .ensure_vmimport_role(ctx, CACHE_BUCKET_PREFIX)
            .await
        {
            self.cleanup_bucket(&bucket, created).await;
            return Err(err);
        }
        Ok((bucket, created))
    }

    /// Remove the staged object and, if this run made it, the bucket.
    /// Failures are logged, never surfaced.
    async fn cleanup(&self, bucket: &str, key: &str, created: bool) {
        let ctx = CallContext::with_timeout(Duration::from_secs(120));
        let storage = self.storage();
        match storage.delete_object(&ctx, bucket, key).await {
            Ok(()) => {}
            Err(e) if e.is(ErrorKind::NotFound) => {}
            Err(e) => log::warn!("could not delete {}/{}: {}", bucket, key, e),
        }
        if created && self.options.delete_created_bucket {
            if let Err(e) = storage.delete_bucket(&ctx, bucket).await {
                log::warn!("could not delete bucket {}: {}", bucket, e);
            }
        }
    }

    // ── Import ──────────────────────────────────────────────────────

    pub async fn import_image(
        &self,
        ctx: &CallContext,
        request: &ImportRequest,
        progress: &mut ImportProgressFn<'_>,
    ) -> AwsResult<ImportOutcome> {
        progress(ImportState::QueueingUpload, 0.0);
        let size = tokio::fs::metadata(&request.path).await?.len();
        let (bucket, created) = self.prepare(ctx, &request.image_id).await?;
        let key = request.image_id.as_str();

        let result = self
            .upload_and_import(ctx, request, &bucket, size, progress)
            .await;
        self.cleanup(&bucket, key, created).await;

        match &result {
            Ok(outcome) => {
                log::info!(
                    "import of {} finished as {:?} (task {})",
                    request.image_id,
                    outcome.state,
                    outcome.task_id
                );
                let percent = if outcome.state == ImportState::Ready { 100.0 } else { UPLOAD_SHARE };
                progress(outcome.state, percent);
            }
            Err(e) => {
                log::warn!("import of {} failed: {}", request.image_id, e);
                progress(ImportState::Failed, UPLOAD_SHARE);
            }
        }
        result
    }

    async fn upload_and_import(
        &self,
        ctx: &CallContext,
        request: &ImportRequest,
        bucket: &str,
        size: u64,
        progress: &mut ImportProgressFn<'_>,
    ) -> AwsResult<ImportOutcome> {
        log::info!("uploading {} to {}", request.path.display(), bucket);
        progress(ImportState::Uploading, 0.0);
        let file = tokio::fs::File::open(&request.path).await?;
        self.storage()
            .upload(ctx, bucket, &request.image_id, file, size, &mut |percent| {
                progress(ImportState::Uploading, scaled(0.0, UPLOAD_SHARE, percent))
            })
            .await?;

        let task_id = self.start_import(ctx, request, bucket).await?;
        log::info!("import task {} started for {}", task_id, request.image_id);
        progress(ImportState::Importing, UPLOAD_SHARE);

        let progress = Mutex::new(progress);
        let progress = &progress;
        let task_ref = task_id.as_str();
        let waited = wait_until(
            ctx,
            "image import",
            self.options.poll_interval,
            self.options.deadline,
            move || async move {
                let task = self.describe_import_task(ctx, task_ref).await?;
                match task_status(&task.status) {
                    TaskStatus::Running => {
                        let percent = task_percent(task.progress.as_deref());
                        report(progress, ImportState::Importing, scaled(UPLOAD_SHARE, 100.0 - UPLOAD_SHARE, percent));
                        Ok(None)
                    }
                    _ => Ok(Some(task)),
                }
            },
        )
        .await;

        let task = match waited {
            Ok(task) => task,
            Err(err) => {
                if err.is(ErrorKind::Timeout) {
                    self.cancel_import(task_ref).await;
                }
                return Err(err);
            }
        };
        Ok(match task_status(&task.status) {
            TaskStatus::Completed => ImportOutcome {
                state: ImportState::Ready,
                image_id: task.image_id.filter(|id| !id.is_empty()),
                task_id,
                status_message: task.status_message,
            },
            _ => ImportOutcome {
                state: ImportState::Failed,
                image_id: None,
                task_id,
                status_message: task.status_message,
            },
        })
    }

    async fn start_import(&self, ctx: &CallContext, request: &ImportRequest, bucket: &str) -> AwsResult<String> {
        let container = Params::new()
            .with("Format", request.format.as_str())
            .with(
                "UserBucket",
                Params::new()
                    .with("S3Bucket", bucket)
                    .with("S3Key", request.image_id.as_str()),
            );
        let params = Params::new()
            .with("DiskContainer", vec![container])
            .with("RoleName", VMIMPORT_ROLE)
            .with_opt("Architecture", request.architecture.clone())
            .with_opt("Description", request.description.clone())
            .with_opt(
                "Platform",
                request.os_type.map(|os| match os {
                    OsType::Linux => "Linux",
                    OsType::Windows => "Windows",
                }),
            );
        let call = ApiCall::new(SERVICE, "ImportImage")
            .region(&self.region)
            .params(params);
        let value = self.dispatcher.invoke_value(ctx, &call).await?;
        value
            .get("importTaskId")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AwsError::malformed(SERVICE, "ImportImage returned no task id", 200))
    }

    pub async fn describe_import_task(&self, ctx: &CallContext, task_id: &str) -> AwsResult<ImportImageTask> {
        let call = ApiCall::new(SERVICE, "DescribeImportImageTasks")
            .region(&self.region)
            .param("ImportTaskId", vec![task_id]);
        let result: DescribeImportImageTasksResult = self.dispatcher.fetch(ctx, &call).await?;
        result
            .import_image_task_set
            .into_iter()
            .find(|t| t.import_task_id == task_id)
            .ok_or_else(|| AwsError::not_found(SERVICE, &format!("import task {} not found", task_id)))
    }

    async fn cancel_import(&self, task_id: &str) {
        let ctx = CallContext::with_timeout(Duration::from_secs(60));
        let call = ApiCall::new(SERVICE, "CancelImportTask")
            .region(&self.region)
            .param("ImportTaskId", task_id);
        if let Err(e) = self.dispatcher.invoke_value(&ctx, &call).await {
            log::warn!("could not cancel import task {}: {}", task_id, e);
        }
    }

    // ── Export ──────────────────────────────────────────────────────

    /// Export a registered image into `dest`.
    pub async fn export_image(
        &self,
        ctx: &CallContext,
        image_id: &str,
        format: DiskFormat,
        dest: &Path,
        progress: &mut ExportProgressFn<'_>,
    ) -> AwsResult<ExportOutcome> {
        progress(ExportState::Exporting, 0.0);
        let (bucket, created) = self.prepare(ctx, image_id).await?;

        let task = match self.run_export(ctx, image_id, format, &bucket, progress).await {
            Ok(task) => task,
            Err(err) => {
                progress(ExportState::Failed, 0.0);
                self.cleanup_bucket(&bucket, created).await;
                return Err(err);
            }
        };
        let key = format!(
            "{}{}.{}",
            task.s3_export_location
                .as_ref()
                .and_then(|l| l.s3_prefix.clone())
                .unwrap_or_default(),
            task.export_image_task_id,
            format.extension()
        );

        if task_status(&task.status) != TaskStatus::Completed {
            progress(ExportState::Failed, UPLOAD_SHARE);
            self.cleanup(&bucket, &key, created).await;
            return Ok(ExportOutcome {
                state: ExportState::Failed,
                task_id: task.export_image_task_id,
                bytes: 0,
                status_message: task.status_message,
            });
        }

        progress(ExportState::Downloading, UPLOAD_SHARE);
        let downloaded = self.download(ctx, &bucket, &key, dest, progress).await;
        self.cleanup(&bucket, &key, created).await;
        let bytes = match downloaded {
            Ok(bytes) => bytes,
            Err(err) => {
                progress(ExportState::Failed, UPLOAD_SHARE);
                return Err(err);
            }
        };
        log::info!("exported {} to {} ({} bytes)", image_id, dest.display(), bytes);
        progress(ExportState::Ready, 100.0);
        Ok(ExportOutcome {
            state: ExportState::Ready,
            task_id: task.export_image_task_id,
            bytes,
            status_message: task.status_message,
        })
    }

    async fn run_export(
        &self,
        ctx: &CallContext,
        image_id: &str,
        format: DiskFormat,
        bucket: &str,
        progress: &mut ExportProgressFn<'_>,
    ) -> AwsResult<ExportImageTask> {
        let call = ApiCall::new(SERVICE, "ExportImage")
            .region(&self.region)
            .params(
                Params::new()
                    .with("ImageId", image_id)
                    .with("DiskImageFormat", format.as_str())
                    .with("RoleName", VMIMPORT_ROLE)
                    .with("S3ExportLocation", Params::new().with("S3Bucket", bucket)),
            );
        let value = self.dispatcher.invoke_value(ctx, &call).await?;
        let task_id = value
            .get("exportImageTaskId")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AwsError::malformed(SERVICE, "ExportImage returned no task id", 200))?;
        log::info!("export task {} started for {}", task_id, image_id);

        let progress = Mutex::new(progress);
        let progress = &progress;
        let task_ref = task_id.as_str();
        wait_until(
            ctx,
            "image export",
            self.options.poll_interval,
            self.options.deadline,
            move || async move {
                let task = self.describe_export_task(ctx, task_ref).await?;
                match task_status(&task.status) {
                    TaskStatus::Running => {
                        let percent = task_percent(task.progress.as_deref());
                        report(progress, ExportState::Exporting, scaled(0.0, UPLOAD_SHARE, percent));
                        Ok(None)
                    }
                    _ => Ok(Some(task)),
                }
            },
        )
        .await
    }

    pub async fn describe_export_task(&self, ctx: &CallContext, task_id: &str) -> AwsResult<ExportImageTask> {
        let call = ApiCall::new(SERVICE, "DescribeExportImageTasks")
            .region(&self.region)
            .param("ExportImageTaskId", vec![task_id]);
        let result: DescribeExportImageTasksResult = self.dispatcher.fetch(ctx, &call).await?;
        result
            .export_image_task_set
            .into_iter()
            .find(|t| t.export_image_task_id == task_id)
            .ok_or_else(|| AwsError::not_found(SERVICE, &format!("export task {} not found", task_id)))
    }

    async fn download(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        dest: &Path,
        progress: &mut ExportProgressFn<'_>,
    ) -> AwsResult<u64> {
        let file = tokio::fs::File::create(dest).await?;
        self.storage()
            .download(ctx, bucket, key, file, &mut |percent| {
                progress(
                    ExportState::Downloading,
                    scaled(UPLOAD_SHARE, 100.0 - UPLOAD_SHARE, percent),
                )
            })
            .await
    }

    async fn cleanup_bucket(&self, bucket: &str, created: bool) {
        if !(created && self.options.delete_created_bucket) {
            return;
        }
        let ctx = CallContext::with_timeout(Duration::from_secs(120));
        if let Err(e) = self.storage().delete_bucket(&ctx, bucket).await {
            log::warn!("could not delete bucket {}: {}", bucket, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bucket_names_are_deterministic() {
        assert_eq!(cache_bucket_name("us-west-2", "img-42"), "imgcache-us-west-2-img-42");
        assert_eq!(cache_bucket_name("us-west-2", "IMG42"), "imgcache-us-west-2-img42");
    }

    #[test]
    fn terminal_statuses() {
        assert_eq!(task_status("completed"), TaskStatus::Completed);
        assert_eq!(task_status("deleted"), TaskStatus::Deleted);
        assert_eq!(task_status("active"), TaskStatus::Running);
        assert_eq!(task_status("deleting"), TaskStatus::Running);
        assert!(ImportState::Failed.is_terminal());
        assert!(!ImportState::Importing.is_terminal());
    }

    #[test]
    fn progress_scale() {
        assert_eq!(scaled(0.0, UPLOAD_SHARE, 50.0), 40.0);
        assert_eq!(scaled(UPLOAD_SHARE, 20.0, 50.0), 90.0);
        assert_eq!(task_percent(Some("35")), 35.0);
        assert_eq!(task_percent(Some("x")), 0.0);
        assert_eq!(task_percent(None), 0.0);
    }

    #[test]
    fn task_sets_decode_from_single_item() {
        let result: DescribeImportImageTasksResult = serde_json::from_value(json!({
            "importImageTaskSet": { "importTaskId": "import-ami-1", "status": "active", "progress": "27" }
        }))
        .unwrap();
        assert_eq!(result.import_image_task_set.len(), 1);
        assert_eq!(result.import_image_task_set[0].progress.as_deref(), Some("27"));
    }

    #[test]
    fn state_names() {
        assert_eq!(serde_json::to_string(&ImportState::QueueingUpload).unwrap(), "\"queueing_upload\"");
        assert_eq!(DiskFormat::Vmdk.as_str(), "VMDK");
    }
}
