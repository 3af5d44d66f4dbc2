use async_trait::async_trait;
use google_cloud_storage::{
    client::{Client, ClientConfig},
    http::{
        Error as GcsError,
        objects::{download::Range, get::GetObjectRequest, list::ListObjectsRequest},
    },
};
use std::path::Path;
use tracing::info;

use crate::{
    ArtifactRef, Credentials, HubError, ModelHub,
    hub::{MODEL_EXTENSIONS, is_model_file},
};

/// Model files stored under a Google Cloud Storage prefix.
#[derive(Debug, Clone)]
pub struct GcsHub {
    pub extensions: Vec<&'static str>,
}

impl Default for GcsHub {
    fn default() -> Self {
        Self {
            extensions: MODEL_EXTENSIONS.to_vec(),
        }
    }
}

fn classify(location: &str, err: GcsError) -> HubError {
    match err {
        GcsError::Response(response) if response.code == 401 || response.code == 403 => {
            HubError::Auth(format!("{location}: {}", response.message))
        }
        GcsError::Response(response) if response.code == 404 => {
            HubError::NotFound(location.to_owned())
        }
        other => HubError::Network(format!("{location}: {other}")),
    }
}

async fn client() -> Result<Client, HubError> {
    // authenticated when GOOGLE_APPLICATION_CREDENTIALS is set, anonymous otherwise
    let config = if std::env::var("GOOGLE_APPLICATION_CREDENTIALS").is_ok() {
        ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| HubError::Auth(e.to_string()))?
    } else {
        ClientConfig::default().anonymous()
    };
    Ok(Client::new(config))
}

#[async_trait]
impl ModelHub for GcsHub {
    async fn fetch(
        &self,
        artifact: &ArtifactRef,
        dest: &Path,
        _credentials: &Credentials,
    ) -> Result<u64, HubError> {
        let ArtifactRef::Gcs { bucket, prefix } = artifact else {
            return Err(HubError::Unsupported(artifact.to_string()));
        };
        let location = artifact.to_string();
        let client = client().await?;

        let mut objects = vec![];
        let mut next_page_token: Option<Option<String>> = Some(None);
        while let Some(page_token) = next_page_token {
            let results = client
                .list_objects(&ListObjectsRequest {
                    bucket: bucket.clone(),
                    prefix: prefix.clone(),
                    page_token,
                    ..Default::default()
                })
                .await
                .map_err(|e| classify(&location, e))?;
            objects.extend(
                results
                    .items
                    .iter()
                    .flatten()
                    .filter(|obj| is_model_file(&obj.name, &self.extensions))
                    .map(|obj| obj.name.clone()),
            );
            next_page_token = results.next_page_token.map(Some);
        }
        if objects.is_empty() {
            return Err(HubError::NotFound(format!("{location} has no model files")));
        }
        info!(location, files = objects.len(), "Found model files");

        let mut total = 0;
        for object in objects {
            let filename = object.rsplit('/').next().unwrap_or(&object);
            let data = client
                .download_object(
                    &GetObjectRequest {
                        bucket: bucket.clone(),
                        object: object.clone(),
                        ..Default::default()
                    },
                    &Range::default(),
                )
                .await
                .map_err(|e| classify(&location, e))?;
            tokio::fs::write(dest.join(filename), &data).await?;
            info!(filename, bytes = data.len(), "Downloaded");
            total += data.len() as u64;
        }
        Ok(total)
    }
}
