use super::types::{Cluster, DeploymentTarget};
use super::{Error, PorterCatalog};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use tracing::debug;

/// A map filled in one bulk load, on the first lookup.
///
/// A successful load is never repeated; a failed one leaves the map unloaded so
/// the next lookup tries again.
#[derive(Debug)]
pub struct LoadOnce<K, V> {
    entries: Option<HashMap<K, V>>,
}

impl<K, V> Default for LoadOnce<K, V> {
    fn default() -> Self {
        LoadOnce { entries: None }
    }
}

impl<K: Eq + Hash, V: Clone> LoadOnce<K, V> {
    pub fn is_loaded(&self) -> bool {
        self.entries.is_some()
    }

    pub async fn get_or_load<Q, F, Fut, E>(&mut self, key: &Q, load: F) -> Result<Option<V>, E>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HashMap<K, V>, E>>,
    {
        if self.entries.is_none() {
            self.entries = Some(load().await?);
        }
        Ok(self.entries.as_ref().and_then(|e| e.get(key)).cloned())
    }
}

/// Turns a deployment target id into a display name, via the target and cluster catalogs.
#[derive(Debug, Default)]
pub struct LocationResolver {
    targets: LoadOnce<String, DeploymentTarget>,
    clusters: LoadOnce<i64, Cluster>,
}

impl LocationResolver {
    pub async fn deployment_target<C: PorterCatalog>(
        &mut self,
        catalog: &C,
        id: &str,
    ) -> Result<Option<DeploymentTarget>, Error> {
        self.targets
            .get_or_load(id, move || async move {
                let targets = catalog.deployment_targets().await?;
                let by_id: HashMap<String, DeploymentTarget> =
                    targets.into_iter().map(|t| (t.id.clone(), t)).collect();
                Ok::<_, Error>(by_id)
            })
            .await
    }

    pub async fn cluster<C: PorterCatalog>(
        &mut self,
        catalog: &C,
        id: i64,
    ) -> Result<Option<Cluster>, Error> {
        self.clusters
            .get_or_load(&id, move || async move {
                let clusters = catalog.clusters().await?;
                let by_id: HashMap<i64, Cluster> =
                    clusters.into_iter().map(|c| (c.id, c)).collect();
                Ok::<_, Error>(by_id)
            })
            .await
    }

    /// Name of the target, prefixed by its cluster name when not already;
    /// the raw id when the target can not be resolved.
    pub async fn resolve<C: PorterCatalog>(&mut self, catalog: &C, target_id: &str) -> String {
        let target = match self.deployment_target(catalog, target_id).await {
            Ok(Some(target)) if !target.name.is_empty() => target,
            Ok(_) => {
                debug!(target_id, "deployment target unknown, use its id");
                return target_id.to_string();
            }
            Err(err) => {
                debug!(target_id, ?err, "deployment targets unavailable, use the id");
                return target_id.to_string();
            }
        };
        let cluster_name = match target.cluster() {
            Some(cluster_id) => match self.cluster(catalog, cluster_id).await {
                Ok(cluster) => cluster.map(|c| c.name),
                Err(err) => {
                    debug!(cluster_id, ?err, "clusters unavailable");
                    None
                }
            },
            None => None,
        };
        compose_location(&target.name, cluster_name.as_deref())
    }
}

/// `<cluster>-<target>`, unless the target name already starts with the cluster name.
pub fn compose_location(target_name: &str, cluster_name: Option<&str>) -> String {
    match cluster_name {
        Some(cluster) if !cluster.is_empty() && !target_name.starts_with(cluster) => {
            format!("{cluster}-{target_name}")
        }
        _ => target_name.to_string(),
    }
}
