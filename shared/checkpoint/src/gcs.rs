use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_storage::{
    client::{Client, ClientConfig},
    http::{
        Error as GcsError,
        objects::{
            delete::DeleteObjectRequest,
            download::Range,
            get::GetObjectRequest,
            list::ListObjectsRequest,
            upload::{Media, UploadObjectRequest, UploadType},
        },
    },
};
use tracing::info;

use crate::object_store::{ObjectStore, ObjectStoreError, validate_path};

/// Checkpoint objects in a Google Cloud Storage bucket, optionally below a
/// fixed prefix.
pub struct GcsObjectStore {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for GcsObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsObjectStore")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl GcsObjectStore {
    /// Uses application default credentials when
    /// `GOOGLE_APPLICATION_CREDENTIALS` is set, anonymous access otherwise.
    pub async fn new(bucket: &str, prefix: Option<&str>) -> Result<Self, ObjectStoreError> {
        let config = if std::env::var("GOOGLE_APPLICATION_CREDENTIALS").is_ok() {
            info!(bucket, "Using authenticated GCS client");
            ClientConfig::default()
                .with_auth()
                .await
                .map_err(|e| ObjectStoreError::Backend(format!("GCS auth failed: {e}")))?
        } else {
            info!(bucket, "Using anonymous GCS client");
            ClientConfig::default().anonymous()
        };
        Ok(Self {
            client: Client::new(config),
            bucket: bucket.to_owned(),
            prefix: prefix.map(|p| p.trim_end_matches('/').to_owned()),
        })
    }

    fn object_name(&self, path: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{path}"),
            None => path.to_owned(),
        }
    }

    fn strip(&self, name: &str) -> Option<String> {
        match &self.prefix {
            Some(prefix) => name
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .map(str::to_owned),
            None => Some(name.to_owned()),
        }
    }

    fn map_error(&self, path: &str, err: GcsError) -> ObjectStoreError {
        match err {
            GcsError::Response(response) if response.code == 404 => {
                ObjectStoreError::NotFound(path.to_owned())
            }
            other => ObjectStoreError::Backend(format!("gs://{}/{}: {other}", self.bucket, path)),
        }
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        validate_path(path)?;
        let upload_type = UploadType::Simple(Media::new(self.object_name(path)));
        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                data.to_vec(),
                &upload_type,
            )
            .await
            .map_err(|e| self.map_error(path, e))?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes, ObjectStoreError> {
        validate_path(path)?;
        let data = self
            .client
            .download_object(
                &GetObjectRequest {
                    bucket: self.bucket.clone(),
                    object: self.object_name(path),
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|e| self.map_error(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut paths = vec![];
        let mut next_page_token: Option<Option<String>> = Some(None);

        while let Some(page_token) = next_page_token {
            let results = self
                .client
                .list_objects(&ListObjectsRequest {
                    bucket: self.bucket.clone(),
                    prefix: Some(self.object_name(prefix)),
                    page_token,
                    ..Default::default()
                })
                .await
                .map_err(|e| self.map_error(prefix, e))?;

            paths.extend(
                results
                    .items
                    .iter()
                    .flatten()
                    .filter_map(|obj| self.strip(&obj.name)),
            );
            next_page_token = results.next_page_token.map(Some);
        }

        paths.sort();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> Result<(), ObjectStoreError> {
        validate_path(path)?;
        match self
            .client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: self.object_name(path),
                ..Default::default()
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => match self.map_error(path, err) {
                ObjectStoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
