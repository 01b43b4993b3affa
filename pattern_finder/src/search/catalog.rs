//! Dataset catalog access.
//!
//! [`DatasetCatalog`] is what the search needs from the platform: dataset
//! detail, asset bytes and a place to record finished runs.
//! [`HttpCatalog`] is the REST implementation.

use std::future::Future;
use std::pin::Pin;

use anyhow::Context;
use bytes::Bytes;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio_stream::{Stream, StreamExt};

use crate::config::ServiceConfig;

use super::asset::AssetKind;
use super::error::CatalogError;
use super::models::{DatasetDetail, SearchRunResponse};

/// Asset bytes in arrival order.
pub type AssetStream = Pin<Box<dyn Stream<Item = Result<Bytes, CatalogError>> + Send>>;

/// Catalog route a dataset was resolved through. Assets are fetched through
/// the same route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRoute {
    Admin,
    Public,
}

const ERROR_BODY_LOG_LIMIT: usize = 500;

pub trait DatasetCatalog: Send + Sync {
    /// Dataset detail with its files. `authorization` is forwarded verbatim.
    fn fetch_dataset(
        &self,
        dataset_id: &str,
        authorization: Option<&str>,
    ) -> impl Future<Output = Result<(DatasetDetail, AccessRoute), CatalogError>> + Send;

    fn open_asset(
        &self,
        route: AccessRoute,
        dataset_id: &str,
        file_id: &str,
        kind: AssetKind,
        authorization: Option<&str>,
    ) -> impl Future<Output = Result<AssetStream, CatalogError>> + Send;

    fn persist_run(
        &self,
        run: &SearchRunResponse,
        authorization: Option<&str>,
    ) -> impl Future<Output = Result<(), CatalogError>> + Send;
}

/// REST client for the dataset server.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: Client,
    base_url: String,
    request_timeout: std::time::Duration,
}

impl HttpCatalog {
    pub fn new(config: &ServiceConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn dataset_path(route: AccessRoute, dataset_id: &str) -> String {
        match route {
            AccessRoute::Admin => format!("/admin/datasets/{dataset_id}"),
            AccessRoute::Public => format!("/datasets/public/{dataset_id}"),
        }
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, CatalogError> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))
            .map_err(|e| {
                tracing::error!(url, error = %format!("{e:#}"), "Dataset server HTTP error");
                CatalogError::Unavailable {
                    reason: format!("{e:#}"),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(ERROR_BODY_LOG_LIMIT).collect();
            tracing::error!(url, status = status.as_u16(), body = %body, "Dataset server returned error");
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        authorization: Option<&str>,
    ) -> Result<T, CatalogError> {
        let url = self.url(path);
        let request = with_auth(self.client.get(&url), authorization).timeout(self.request_timeout);
        let response = self.send(request, &url).await?;
        let bytes = response.bytes().await.map_err(|e| CatalogError::Unavailable {
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            tracing::error!(url, error = %e, "Dataset server returned invalid JSON");
            CatalogError::InvalidJson {
                reason: e.to_string(),
            }
        })
    }
}

fn with_auth(request: RequestBuilder, authorization: Option<&str>) -> RequestBuilder {
    match authorization {
        Some(value) => request.header(AUTHORIZATION, value),
        None => request,
    }
}

/// Statuses on which an admin lookup falls back to the public route.
fn admin_fallback_status(status: Option<u16>) -> bool {
    matches!(status, Some(401 | 403 | 404))
}

impl DatasetCatalog for HttpCatalog {
    async fn fetch_dataset(
        &self,
        dataset_id: &str,
        authorization: Option<&str>,
    ) -> Result<(DatasetDetail, AccessRoute), CatalogError> {
        if authorization.is_some() {
            let path = Self::dataset_path(AccessRoute::Admin, dataset_id);
            match self.get_json::<DatasetDetail>(&path, authorization).await {
                Ok(detail) => return Ok((detail, AccessRoute::Admin)),
                Err(e) if admin_fallback_status(e.status()) => {
                    tracing::debug!(dataset_id, status = ?e.status(), "Admin lookup refused, using public route");
                }
                Err(e) => return Err(e),
            }
        }

        let path = Self::dataset_path(AccessRoute::Public, dataset_id);
        let detail = self.get_json(&path, authorization).await?;
        Ok((detail, AccessRoute::Public))
    }

    async fn open_asset(
        &self,
        route: AccessRoute,
        dataset_id: &str,
        file_id: &str,
        kind: AssetKind,
        authorization: Option<&str>,
    ) -> Result<AssetStream, CatalogError> {
        let suffix = match kind {
            AssetKind::Mbtiles => "mbtiles/raw",
            AssetKind::Original => "raw",
        };
        let url = self.url(&format!(
            "{}/files/{file_id}/{suffix}",
            Self::dataset_path(route, dataset_id)
        ));
        let response = self
            .send(with_auth(self.client.get(&url), authorization), &url)
            .await?;

        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| CatalogError::Unavailable {
                reason: e.to_string(),
            })
        });
        Ok(Box::pin(stream))
    }

    async fn persist_run(
        &self,
        run: &SearchRunResponse,
        authorization: Option<&str>,
    ) -> Result<(), CatalogError> {
        let url = self.url("/pattern-search/runs");
        let request = with_auth(self.client.post(&url), authorization)
            .timeout(self.request_timeout)
            .json(run);
        self.send(request, &url).await?;
        Ok(())
    }
}
