//! Image catalog and service catalog lookups.
//!
//! `validate` resolves the requested image against the image catalog and
//! discovers the deployment API endpoint when none is configured.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::ApiError;

/// An image as the catalog describes it.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    /// Catalog identifier.
    pub id: String,
    /// Human-readable name, as registered in the management system.
    pub name: String,
}

/// Source of image metadata.
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    /// Fetch one image by identifier.
    ///
    /// # Errors
    /// Returns [`ApiError::NotFound`] when the catalog has no such image.
    async fn show(&self, image_id: &str) -> Result<ImageInfo, ApiError>;
}

/// Image catalog HTTP client.
pub struct HttpImageCatalog {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpImageCatalog {
    /// Create a client against the catalog's API base URL.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl ImageCatalog for HttpImageCatalog {
    async fn show(&self, image_id: &str) -> Result<ImageInfo, ApiError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let url = format!("{base}/v2/images/{image_id}");
        debug!(url = %url, "fetching image");

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(image_id.to_string()));
        }

        let text = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        Ok(serde_json::from_str(&text)?)
    }
}

/// Resolver for the deployment API endpoint used by the ramdisk callback.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    /// The deployment API URL, when one is known.
    ///
    /// # Errors
    /// Returns [`ApiError::NotFound`] when no endpoint is registered.
    async fn deploy_api_url(&self) -> Result<Url, ApiError>;
}

/// A catalog answering from configuration alone.
pub struct StaticCatalog {
    url: Option<Url>,
}

impl StaticCatalog {
    #[must_use]
    pub fn new(url: Option<Url>) -> Self {
        Self { url }
    }
}

#[async_trait]
impl ServiceCatalog for StaticCatalog {
    async fn deploy_api_url(&self) -> Result<Url, ApiError> {
        self.url
            .clone()
            .ok_or_else(|| ApiError::NotFound("deployment API endpoint".to_string()))
    }
}
