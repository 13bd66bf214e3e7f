//! Staged file uploads, single or multipart
//!
//! Multipart parts go up concurrently, bounded by a semaphore of
//! `workers` permits. The completing call must list parts in their
//! original order, whatever order they finished in.

use bytes::Bytes;
use cubist_http::{odata_quote, Request};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::error::{CellsetError, Result};
use crate::executor::CellsetExecutor;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Deserialize)]
struct CreatedUpload {
    #[serde(rename = "UploadID")]
    upload_id: String,
}

#[derive(Deserialize)]
struct UploadedPart {
    #[serde(rename = "PartNumber")]
    part_number: u64,
    #[serde(rename = "@odata.etag")]
    etag: String,
}

/// A finished part, tagged with its position in the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub index: usize,
    pub part_number: u64,
    pub etag: String,
}

/// Body of the completing call: parts sorted by payload position.
pub fn completion_body(mut receipts: Vec<PartReceipt>) -> serde_json::Value {
    receipts.sort_by_key(|r| r.index);
    let parts: Vec<_> = receipts
        .iter()
        .map(|r| json!({ "PartNumber": r.part_number, "ETag": r.etag }))
        .collect();
    json!({ "Parts": parts })
}

/// Split `content` into parts of at most `part_size` bytes without copying.
pub fn split_parts(content: &Bytes, part_size: usize) -> Vec<Bytes> {
    let part_size = part_size.max(1);
    (0..content.len())
        .step_by(part_size)
        .map(|start| content.slice(start..(start + part_size).min(content.len())))
        .collect()
}

/// Uploads files to the server's file store.
#[derive(Debug, Clone)]
pub struct FileUploader {
    executor: CellsetExecutor,
    part_size: usize,
    workers: usize,
}

impl FileUploader {
    pub fn new(executor: CellsetExecutor, part_size: usize, workers: usize) -> Self {
        Self {
            executor,
            part_size: part_size.max(1),
            workers: workers.max(1),
        }
    }

    /// `Files` from version 12 on, `Blobs` before.
    pub fn content_root(&self) -> &'static str {
        if self.multipart_supported() {
            "Files"
        } else {
            "Blobs"
        }
    }

    pub fn multipart_supported(&self) -> bool {
        self.executor
            .session()
            .major_version()
            .is_some_and(|major| major >= 12)
    }

    fn entry_path(&self, name: &str) -> String {
        format!("Contents('{}')/Contents('{}')", self.content_root(), odata_quote(name))
    }

    fn content_path(&self, name: &str) -> String {
        format!("{}/Content", self.entry_path(name))
    }

    /// Create `name` holding `content`.
    #[instrument(skip_all, fields(file = name, bytes = content.len()))]
    pub async fn upload(&self, name: &str, content: Bytes) -> Result<()> {
        let entry = Request::post(format!("Contents('{}')/Contents", self.content_root())).json_value(
            json!({
                "@odata.type": "#ibm.tm1.api.v1.Document",
                "ID": name,
                "Name": name,
            }),
        );
        self.executor.send(entry, "creating file entry").await?;

        if content.is_empty() || !self.multipart_supported() {
            let request = Request::put(self.content_path(name)).bytes(content, OCTET_STREAM);
            self.executor.send(request, "uploading file content").await?;
            debug!(file = name, "uploaded in a single request");
            return Ok(());
        }
        self.upload_multipart(name, content).await
    }

    async fn upload_multipart(&self, name: &str, content: Bytes) -> Result<()> {
        let content_path = self.content_path(name);
        let create = Request::post(format!("{}/mpu.CreateMultipartUpload", content_path))
            .json_value(json!({}));
        let response = self.executor.send(create, "starting multipart upload").await?;
        let created: CreatedUpload = serde_json::from_slice(response.bytes())?;
        let parts_path = format!("{}/!uploads('{}')", content_path, odata_quote(&created.upload_id));

        let parts = split_parts(&content, self.part_size);
        info!(file = name, parts = parts.len(), workers = self.workers, "multipart upload started");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut pending: FuturesUnordered<_> = parts
            .into_iter()
            .enumerate()
            .map(|(index, data)| {
                let executor = self.executor.clone();
                let semaphore = semaphore.clone();
                let path = format!("{}/Parts", parts_path);
                let task = tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| CellsetError::Worker(format!("part {} cancelled", index)))?;
                    debug!(part = index, bytes = data.len(), "uploading part");
                    let request = Request::post(path)
                        .header("Accept", "application/json,text/plain")
                        .bytes(data, OCTET_STREAM);
                    let response = executor
                        .send(request, &format!("uploading part {}", index))
                        .await?;
                    let part: UploadedPart = serde_json::from_slice(response.bytes())?;
                    Ok::<_, CellsetError>(PartReceipt {
                        index,
                        part_number: part.part_number,
                        etag: part.etag,
                    })
                });
                async move { (index, task.await) }
            })
            .collect();

        let mut receipts = Vec::new();
        let mut first_error: Option<CellsetError> = None;
        while let Some((index, joined)) = pending.next().await {
            match joined.map_err(|e| CellsetError::Worker(e.to_string())).and_then(|r| r) {
                Ok(receipt) => receipts.push(receipt),
                Err(e) if first_error.is_none() => {
                    warn!(part = index, error = %e, "part upload failed, aborting upload");
                    semaphore.close();
                    first_error = Some(e);
                }
                Err(e) => debug!(part = index, error = %e, "discarding error after failure"),
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let complete = Request::post(format!("{}/mpu.Complete", parts_path))
            .json_value(completion_body(receipts));
        self.executor.send(complete, "completing multipart upload").await?;
        info!(file = name, "multipart upload completed");
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let request = Request::delete(self.entry_path(name));
        self.executor.send(request, "deleting file").await?;
        Ok(())
    }
}
