//! HTTP client of the Porter API.

use super::types::{
    Application, ApplicationDetail, Cluster, DeploymentTarget, ListApplicationsResponse,
    ListClustersResponse, ListDeploymentTargetsResponse,
};
use super::{Error, PorterCatalog};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://dashboard.porter.run";

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub struct PorterClient {
    http_client: Client,
    base_url: String,
    token: String,
    project_id: String,
}

impl PorterClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(PorterClient {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            project_id: project_id.into(),
        })
    }

    /// GET with the bearer token, any non 2xx status is an [`Error::Api`].
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        debug!(url = url.as_str(), body = body.as_str(), "raw response");
        serde_json::from_str(&body).map_err(|source| Error::Decode { url, source })
    }
}

impl PorterCatalog for PorterClient {
    async fn applications(&self) -> Result<Vec<Application>, Error> {
        let path = format!(
            "/api/v2/alpha/projects/{}/applications?limit=100",
            self.project_id
        );
        let response: ListApplicationsResponse = self.get(&path).await?;
        Ok(response.applications)
    }

    async fn application(&self, id: &str) -> Result<ApplicationDetail, Error> {
        let path = format!("/api/v2/alpha/projects/{}/applications/{}", self.project_id, id);
        self.get(&path).await
    }

    async fn deployment_targets(&self) -> Result<Vec<DeploymentTarget>, Error> {
        let path = format!("/api/v2/projects/{}/deployment-targets", self.project_id);
        let response: ListDeploymentTargetsResponse = self.get(&path).await?;
        Ok(response.deployment_targets)
    }

    async fn clusters(&self) -> Result<Vec<Cluster>, Error> {
        let path = format!("/api/v2/projects/{}/clusters", self.project_id);
        let response: ListClustersResponse = self.get(&path).await?;
        Ok(response.clusters)
    }
}
