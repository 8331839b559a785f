// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::{ArtifactStorageConfig, LocalFileSystemStorageConfig, S3StorageConfig};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Upload failed: {0}")]
    Upload(String),
}

/// Object storage for run artifacts (k6 reports, console logs, Playwright
/// traces). Keys are `{run_id}/{relative path}`.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    async fn put_bytes(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError>;

    /// Absolute URL under which an uploaded key can be fetched.
    fn public_url(&self, key: &str) -> String;
}

pub async fn configured(
    config: &ArtifactStorageConfig,
) -> Result<Arc<dyn ArtifactStorage>, StorageError> {
    match config {
        ArtifactStorageConfig::S3(s3) => Ok(Arc::new(S3ArtifactStorage::new(s3).await)),
        ArtifactStorageConfig::LocalFileSystem(fs) => {
            Ok(Arc::new(LocalFileSystemArtifactStorage::new(fs).await?))
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html",
        Some("json") => "application/json",
        Some("log") | Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

pub struct S3ArtifactStorage {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_base_url: String,
}

impl S3ArtifactStorage {
    pub async fn new(config: &S3StorageConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket: config.bucket.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ArtifactStorage for S3ArtifactStorage {
    async fn put_bytes(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        debug!(key, bucket = %self.bucket, "Uploading artifact");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| StorageError::Upload(err.to_string()))?;
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        debug!(key, path = %path.display(), bucket = %self.bucket, "Uploading artifact file");
        let body = ByteStream::from_path(path)
            .await
            .map_err(|err| StorageError::Upload(err.to_string()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(path))
            .body(body)
            .send()
            .await
            .map_err(|err| StorageError::Upload(err.to_string()))?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{key}", self.public_base_url)
    }
}

pub struct LocalFileSystemArtifactStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalFileSystemArtifactStorage {
    pub async fn new(config: &LocalFileSystemStorageConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.root).await?;
        Ok(Self {
            root: config.root.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ArtifactStorage for LocalFileSystemArtifactStorage {
    async fn put_bytes(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let target = self.root.join(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let target = self.root.join(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &target).await?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{key}", self.public_base_url)
    }
}

/// Records uploads instead of persisting them; test double.
#[derive(Default)]
pub struct InMemoryArtifactStorage {
    uploads: Mutex<HashMap<String, usize>>,
}

impl InMemoryArtifactStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploaded_keys(&self) -> Vec<String> {
        self.uploads.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ArtifactStorage for InMemoryArtifactStorage {
    async fn put_bytes(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        self.uploads
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.len());
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let size = tokio::fs::metadata(path)
            .await
            .map(|meta| meta.len() as usize)
            .unwrap_or(0);
        self.uploads.lock().unwrap().insert(key.to_string(), size);
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    async fn local_storage_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileSystemArtifactStorage::new(&LocalFileSystemStorageConfig {
            root: dir.path().to_path_buf(),
            public_base_url: "http://localhost/artifacts/".to_string(),
        })
        .await
        .unwrap();

        storage
            .put_bytes("run-1/report/index.html", b"<html></html>".to_vec(), "text/html")
            .await
            .unwrap();

        let written = dir.path().join("run-1/report/index.html");
        assert!(written.exists());
        assert_eq!(
            storage.public_url("run-1/report/index.html"),
            "http://localhost/artifacts/run-1/report/index.html"
        );
    }
}
