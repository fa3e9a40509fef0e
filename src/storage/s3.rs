// restoretool/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{BucketCannedAcl, BucketLocationConstraint, CreateBucketConfiguration};

use super::{ObjectEntry, ObjectStore};
use crate::config::SpacesConfig;
use crate::errors::{RestoreError, Result};

/// S3-compatible object store (AWS, DigitalOcean Spaces, MinIO, ...).
pub struct S3Store {
    client: s3::Client,
    region: String,
    custom_endpoint: bool,
}

impl S3Store {
    pub async fn from_config(spaces_config: &SpacesConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        if let Some(endpoint) = &spaces_config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(spaces_config.force_path_style)
            .build();

        S3Store {
            client: s3::Client::from_conf(s3_config),
            region: spaces_config.region.clone(),
            custom_endpoint: spaces_config.endpoint_url.is_some(),
        }
    }
}

fn storage_error<E>(context: String, err: E) -> RestoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    RestoreError::Storage(format!("{}: {}", context, DisplayErrorContext(&err)))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => match err.as_service_error() {
                Some(service_err) if service_err.is_not_found() => Ok(false),
                _ => Err(storage_error(format!("HeadBucket {}", bucket), err)),
            },
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let mut request = self
            .client
            .create_bucket()
            .bucket(bucket)
            .acl(BucketCannedAcl::Private);
        // AWS wants the region spelled out everywhere but us-east-1;
        // S3-compatible services generally reject it.
        if !self.custom_endpoint && self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| storage_error(format!("CreateBucket {}", bucket), e))?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let list_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix.trim_end_matches('/'))
        };
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .delimiter("/")
                .prefix(&list_prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let resp = request
                .send()
                .await
                .map_err(|e| storage_error(format!("ListObjectsV2 {}/{}", bucket, list_prefix), e))?;

            for object in resp.contents() {
                let Some(key) = object.key() else { continue };
                let name = key.strip_prefix(&list_prefix).unwrap_or(key);
                // Zero-byte "folder" placeholders end in '/'.
                if name.is_empty() || name.ends_with('/') {
                    continue;
                }
                entries.push(ObjectEntry {
                    name: name.to_string(),
                    size: Some(object.size().unwrap_or(0).max(0) as u64),
                });
            }
            for common in resp.common_prefixes() {
                let Some(full) = common.prefix() else { continue };
                let name = full
                    .strip_prefix(&list_prefix)
                    .unwrap_or(full)
                    .trim_end_matches('/');
                if !name.is_empty() {
                    entries.push(ObjectEntry {
                        name: name.to_string(),
                        size: None,
                    });
                }
            }

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(entries)
    }

    async fn upload(&self, bucket: &str, key: &str, body: Vec<u8>, upsert: bool) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body));
        if !upsert {
            request = request.if_none_match("*");
        }
        request
            .send()
            .await
            .map_err(|e| RestoreError::Transport(format!("PutObject {}/{}: {}", bucket, key, DisplayErrorContext(&e))))?;
        Ok(())
    }
}
