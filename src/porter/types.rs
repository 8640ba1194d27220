//! Wire types of the Porter API (only the fields we read).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListApplicationsResponse {
    #[serde(default)]
    pub applications: Vec<Application>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDetail {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub deployment_target_id: String,
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    /// "web", "worker", "job", ...
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub cpu_cores: f64,
    /// unit not stated by the API, read as MiB
    #[serde(default)]
    pub ram_megabytes: i64,
    #[serde(default)]
    pub instances: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<Autoscaling>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Autoscaling {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub min_instances: i32,
    #[serde(default)]
    pub max_instances: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// 0 when the target is not attached to a cluster
    #[serde(default)]
    pub cluster_id: i64,
    #[serde(default)]
    pub cloud_provider: String,
    #[serde(default)]
    pub is_preview: bool,
}

impl DeploymentTarget {
    pub fn cluster(&self) -> Option<i64> {
        (self.cluster_id != 0).then_some(self.cluster_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListDeploymentTargetsResponse {
    #[serde(default)]
    pub deployment_targets: Vec<DeploymentTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListClustersResponse {
    #[serde(default)]
    pub clusters: Vec<Cluster>,
}
