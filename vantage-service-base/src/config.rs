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

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use url::Url;
use uuid::Uuid;
use vantage_common::config::RetryConfig;
use vantage_common::SafeDisplay;

/// Address of an external collaborator service (billing gate, Playwright
/// driver, notification fan-out).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteServiceConfig {
    pub host: String,
    pub port: u16,
    pub access_token: Uuid,
    pub retries: RetryConfig,
}

impl RemoteServiceConfig {
    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}:{}", self.host, self.port))
            .expect("Failed to parse remote service URL")
    }
}

impl Default for RemoteServiceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            access_token: Uuid::nil(),
            retries: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for RemoteServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "host: {}", self.host);
        let _ = writeln!(&mut result, "port: {}", self.port);
        let _ = writeln!(&mut result, "access token: ****");
        let _ = writeln!(&mut result, "retries: {}", self.retries.to_safe_string());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum ArtifactStorageConfig {
    S3(S3StorageConfig),
    LocalFileSystem(LocalFileSystemStorageConfig),
}

impl Default for ArtifactStorageConfig {
    fn default() -> Self {
        ArtifactStorageConfig::LocalFileSystem(LocalFileSystemStorageConfig::default())
    }
}

impl SafeDisplay for ArtifactStorageConfig {
    fn to_safe_string(&self) -> String {
        match self {
            ArtifactStorageConfig::S3(inner) => {
                format!("s3:\n{}", inner.to_safe_string_indented())
            }
            ArtifactStorageConfig::LocalFileSystem(inner) => {
                format!("local file system:\n{}", inner.to_safe_string_indented())
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S3StorageConfig {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint for MinIO/localstack deployments.
    pub endpoint_url: Option<String>,
    /// Base under which uploaded keys are publicly reachable.
    pub public_base_url: String,
}

impl Default for S3StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "vantage-artifacts".to_string(),
            region: None,
            endpoint_url: None,
            public_base_url: "https://artifacts.vantage.dev".to_string(),
        }
    }
}

impl SafeDisplay for S3StorageConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "bucket: {}", self.bucket);
        if let Some(region) = &self.region {
            let _ = writeln!(&mut result, "region: {region}");
        }
        if let Some(endpoint) = &self.endpoint_url {
            let _ = writeln!(&mut result, "endpoint: {endpoint}");
        }
        let _ = writeln!(&mut result, "public base URL: {}", self.public_base_url);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalFileSystemStorageConfig {
    pub root: PathBuf,
    pub public_base_url: String,
}

impl Default for LocalFileSystemStorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/artifacts"),
            public_base_url: "http://localhost:8080/artifacts".to_string(),
        }
    }
}

impl SafeDisplay for LocalFileSystemStorageConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "root: {}", self.root.display());
        let _ = writeln!(&mut result, "public base URL: {}", self.public_base_url);
        result
    }
}
