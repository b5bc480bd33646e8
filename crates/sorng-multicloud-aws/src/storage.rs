//! Object storage over REST-XML: the bucket and object calls the image
//! import/export flow needs, with multipart upload and ranged download.
//!
//! Reference: <https://docs.aws.amazon.com/AmazonS3/latest/API/>

use crate::dispatcher::{Dispatcher, RawCall};
use crate::error::{AwsError, AwsResult, ErrorKind};
use crate::signing::uri_encode_path;
use crate::transport::{CallContext, HttpMethod, HttpResponse};
use crate::xml;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SERVICE: &str = "s3";
const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Smallest part S3 accepts, except for the last one.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_PART_SIZE: usize = 16 * 1024 * 1024;

/// Invoked with the completed percentage, 0 to 100.
pub type ProgressFn<'p> = dyn FnMut(f64) + Send + 'p;

// ── Types ───────────────────────────────────────────────────────────────

/// Completed multipart upload part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ObjectMetadata {
    fn from_response(response: &HttpResponse) -> Self {
        let header = |name: &str| response.header(name).map(str::to_string);
        Self {
            content_length: response
                .header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            content_type: header("content-type"),
            etag: header("etag"),
            last_modified: header("last-modified"),
        }
    }
}

fn object_path(bucket: &str, key: &str) -> String {
    format!("/{}/{}", bucket, uri_encode_path(key.trim_start_matches('/')))
}

/// Base64 SHA-256 digest, as S3 expects in `x-amz-checksum-sha256`.
fn checksum_sha256(body: &[u8]) -> String {
    use sha2::Digest;
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, sha2::Sha256::digest(body))
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (done as f64 / total as f64 * 100.0).min(100.0)
    }
}

/// Fill `buf` up to `limit` bytes; fewer only at end of stream.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, limit: usize) -> AwsResult<Bytes> {
    let mut buf = BytesMut::zeroed(limit);
    let mut filled = 0;
    while filled < limit {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf.freeze())
}

// ── Storage client ──────────────────────────────────────────────────────

pub struct StorageClient<'a> {
    dispatcher: &'a Dispatcher,
    region: String,
    part_size: usize,
}

impl<'a> StorageClient<'a> {
    pub fn new(dispatcher: &'a Dispatcher, region: &str) -> Self {
        Self {
            dispatcher,
            region: region.to_string(),
            part_size: DEFAULT_PART_SIZE,
        }
    }

    /// Part size for multipart uploads. Values under [`MIN_PART_SIZE`] are
    /// only useful against test endpoints.
    pub fn part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    fn call(&self, api: &str, method: HttpMethod, path: &str) -> RawCall {
        RawCall::new(SERVICE, api, method, path).region(&self.region)
    }

    async fn send(&self, ctx: &CallContext, call: RawCall) -> AwsResult<HttpResponse> {
        self.dispatcher.send_raw(ctx, &call).await
    }

    // ── Bucket operations ───────────────────────────────────────────

    /// HeadBucket. A missing bucket is `Ok(false)`.
    pub async fn bucket_exists(&self, ctx: &CallContext, bucket: &str) -> AwsResult<bool> {
        let call = self.call("HeadBucket", HttpMethod::Head, &format!("/{}", bucket));
        match self.send(ctx, call).await {
            Ok(_) => Ok(true),
            Err(e) if e.is(ErrorKind::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// CreateBucket in the client's region.
    pub async fn create_bucket(&self, ctx: &CallContext, bucket: &str) -> AwsResult<()> {
        let region = self.dispatcher.config().resolve_region(&self.region)?;
        let mut call = self.call("CreateBucket", HttpMethod::Put, &format!("/{}", bucket));
        if region != "us-east-1" {
            call = call
                .header("content-type", "application/xml")
                .body(format!(
                    r#"<CreateBucketConfiguration xmlns="{}"><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>"#,
                    S3_XMLNS, region
                ));
        }
        self.send(ctx, call).await?;
        Ok(())
    }

    /// Create `bucket` unless it exists. Returns whether it was created.
    pub async fn ensure_bucket(&self, ctx: &CallContext, bucket: &str) -> AwsResult<bool> {
        if self.bucket_exists(ctx, bucket).await? {
            return Ok(false);
        }
        match self.create_bucket(ctx, bucket).await {
            Ok(()) => {
                log::info!("created bucket {}", bucket);
                Ok(true)
            }
            Err(e) if e.is(ErrorKind::Duplicate) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_bucket(&self, ctx: &CallContext, bucket: &str) -> AwsResult<()> {
        let call = self.call("DeleteBucket", HttpMethod::Delete, &format!("/{}", bucket));
        self.send(ctx, call).await?;
        Ok(())
    }

    // ── Object operations ───────────────────────────────────────────

    /// PutObject with a SHA-256 integrity check. Returns the ETag.
    pub async fn put_object(&self, ctx: &CallContext, bucket: &str, key: &str, body: Bytes) -> AwsResult<String> {
        let call = self
            .call("PutObject", HttpMethod::Put, &object_path(bucket, key))
            .header("content-type", "application/octet-stream")
            .header("x-amz-checksum-sha256", &checksum_sha256(&body))
            .body(body);
        let response = self.send(ctx, call).await?;
        Ok(response.header("etag").unwrap_or_default().to_string())
    }

    pub async fn head_object(&self, ctx: &CallContext, bucket: &str, key: &str) -> AwsResult<ObjectMetadata> {
        let call = self.call("HeadObject", HttpMethod::Head, &object_path(bucket, key));
        let response = self.send(ctx, call).await?;
        Ok(ObjectMetadata::from_response(&response))
    }

    /// GetObject, optionally limited to an inclusive byte range.
    pub async fn get_object(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> AwsResult<Bytes> {
        let mut call = self.call("GetObject", HttpMethod::Get, &object_path(bucket, key));
        if let Some((first, last)) = range {
            call = call.header("range", &format!("bytes={}-{}", first, last));
        }
        Ok(self.send(ctx, call).await?.body)
    }

    pub async fn delete_object(&self, ctx: &CallContext, bucket: &str, key: &str) -> AwsResult<()> {
        let call = self.call("DeleteObject", HttpMethod::Delete, &object_path(bucket, key));
        self.send(ctx, call).await?;
        Ok(())
    }

    // ── Multipart upload ────────────────────────────────────────────

    /// CreateMultipartUpload. Returns the upload id.
    pub async fn create_multipart_upload(&self, ctx: &CallContext, bucket: &str, key: &str) -> AwsResult<String> {
        let call = self
            .call("CreateMultipartUpload", HttpMethod::Post, &object_path(bucket, key))
            .query("uploads", "");
        let response = self.send(ctx, call).await?;
        let root = xml::parse(&response.body_text())?;
        root.find("UploadId")
            .map(|n| n.text.clone())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AwsError::malformed(SERVICE, "no UploadId in response", response.status))
    }

    /// UploadPart. Returns the part's ETag.
    pub async fn upload_part(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> AwsResult<String> {
        let call = self
            .call("UploadPart", HttpMethod::Put, &object_path(bucket, key))
            .query("partNumber", &part_number.to_string())
            .query("uploadId", upload_id)
            .body(body);
        let response = self.send(ctx, call).await?;
        Ok(response.header("etag").unwrap_or_default().to_string())
    }

    pub async fn complete_multipart_upload(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> AwsResult<()> {
        let call = self
            .call("CompleteMultipartUpload", HttpMethod::Post, &object_path(bucket, key))
            .query("uploadId", upload_id)
            .header("content-type", "application/xml")
            .body(complete_upload_xml(parts));
        let response = self.send(ctx, call).await?;
        // S3 may report a failure inside a 200 response.
        if response.body_text().contains("<Error>") {
            return Err(AwsError::parse_xml_error(SERVICE, response.status, &response.body_text())
                .with_action("CompleteMultipartUpload"));
        }
        Ok(())
    }

    pub async fn abort_multipart_upload(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> AwsResult<()> {
        let call = self
            .call("AbortMultipartUpload", HttpMethod::Delete, &object_path(bucket, key))
            .query("uploadId", upload_id);
        self.send(ctx, call).await?;
        Ok(())
    }

    /// Stream `size` bytes from `reader` into `bucket/key`. Streams that fit
    /// in one part go up with PutObject; larger ones use multipart upload,
    /// which is aborted if any part fails.
    pub async fn upload<R: AsyncRead + Unpin + Send>(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        mut reader: R,
        size: u64,
        progress: &mut ProgressFn<'_>,
    ) -> AwsResult<()> {
        if size <= self.part_size as u64 {
            let body = read_chunk(&mut reader, size as usize).await?;
            self.put_object(ctx, bucket, key, body).await?;
            progress(100.0);
            return Ok(());
        }

        let upload_id = self.create_multipart_upload(ctx, bucket, key).await?;
        log::debug!("multipart upload {} started for {}/{}", upload_id, bucket, key);
        match self
            .upload_parts(ctx, bucket, key, &upload_id, &mut reader, size, progress)
            .await
        {
            Ok(parts) => {
                self.complete_multipart_upload(ctx, bucket, key, &upload_id, &parts)
                    .await
            }
            Err(err) => {
                if let Err(abort_err) = self.abort_multipart_upload(ctx, bucket, key, &upload_id).await {
                    log::warn!("abort of upload {} failed: {}", upload_id, abort_err);
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts<R: AsyncRead + Unpin + Send>(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
        reader: &mut R,
        size: u64,
        progress: &mut ProgressFn<'_>,
    ) -> AwsResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut sent: u64 = 0;
        loop {
            ctx.check(SERVICE)?;
            let chunk = read_chunk(reader, self.part_size).await?;
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len() as u64;
            let part_number = parts.len() as u32 + 1;
            let etag = self
                .upload_part(ctx, bucket, key, upload_id, part_number, chunk)
                .await?;
            parts.push(CompletedPart { part_number, etag });
            sent += len;
            progress(percent(sent, size));
        }
        if sent != size {
            log::warn!("{}/{}: expected {} bytes, read {}", bucket, key, size, sent);
        }
        Ok(parts)
    }

    /// Copy `bucket/key` into `writer` with ranged GETs of one part each.
    /// Returns the number of bytes written.
    pub async fn download<W: AsyncWrite + Unpin + Send>(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        mut writer: W,
        progress: &mut ProgressFn<'_>,
    ) -> AwsResult<u64> {
        let total = self.head_object(ctx, bucket, key).await?.content_length;
        let mut written: u64 = 0;
        while written < total {
            ctx.check(SERVICE)?;
            let last = (written + self.part_size as u64).min(total) - 1;
            let chunk = self
                .get_object(ctx, bucket, key, Some((written, last)))
                .await?;
            if chunk.is_empty() {
                return Err(AwsError::malformed(
                    SERVICE,
                    &format!("empty range {}-{} of {}/{}", written, last, bucket, key),
                    206,
                ));
            }
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress(percent(written, total));
        }
        writer.flush().await?;
        Ok(written)
    }
}

fn complete_upload_xml(parts: &[CompletedPart]) -> String {
    let mut xml = format!(r#"<CompleteMultipartUpload xmlns="{}">"#, S3_XMLNS);
    for part in parts {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            xml::escape(&part.etag)
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}
