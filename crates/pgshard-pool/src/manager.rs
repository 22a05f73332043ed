use crate::backend::{Address, Connector};
use crate::balancer::{Balancer, LoadBalancing};
use crate::pool::{Guard, Outcome, Pool, PoolSettings, PoolStats};
use futures::future::join_all;
use pgshard_core::{ProxyError, Role, ShardId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Servers of one shard.
#[derive(Debug, Clone)]
pub struct ShardSpec {
    pub primary: Address,
    pub replicas: Vec<Address>,
}

/// Topology of one cluster as handed over by configuration.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub name: String,
    pub shards: Vec<ShardSpec>,
    pub read_write_split: bool,
    pub load_balancing: LoadBalancing,
}

struct ShardPools {
    primary: Pool,
    replicas: Vec<Pool>,
    balancer: Balancer,
}

struct ClusterPools {
    shards: Vec<ShardPools>,
    read_write_split: bool,
}

impl ClusterPools {
    fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.shards
            .iter()
            .flat_map(|shard| std::iter::once(&shard.primary).chain(shard.replicas.iter()))
    }
}

/// Every pool of every cluster, keyed by (cluster, shard, role).
pub struct PoolManager {
    clusters: BTreeMap<String, ClusterPools>,
}

impl PoolManager {
    pub fn new(
        specs: Vec<ClusterSpec>,
        settings: PoolSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let mut clusters = BTreeMap::new();
        for spec in specs {
            let shards = spec
                .shards
                .into_iter()
                .map(|shard| ShardPools {
                    primary: Pool::new(shard.primary, settings.clone(), connector.clone()),
                    replicas: shard
                        .replicas
                        .into_iter()
                        .map(|addr| Pool::new(addr, settings.clone(), connector.clone()))
                        .collect(),
                    balancer: Balancer::new(spec.load_balancing),
                })
                .collect();
            clusters.insert(
                spec.name,
                ClusterPools {
                    shards,
                    read_write_split: spec.read_write_split,
                },
            );
        }
        Self { clusters }
    }

    pub fn has_cluster(&self, cluster: &str) -> bool {
        self.clusters.contains_key(cluster)
    }

    pub fn shard_count(&self, cluster: &str) -> usize {
        self.clusters
            .get(cluster)
            .map(|c| c.shards.len())
            .unwrap_or(0)
    }

    /// Check out a connection for `role` on `shard`.
    ///
    /// Replica requests go to the primary when the cluster has no replicas or
    /// read/write splitting is off; the guard reports the role actually served.
    pub async fn checkout(
        &self,
        cluster: &str,
        shard: ShardId,
        role: Role,
    ) -> Result<Guard, ProxyError> {
        let pools = self
            .clusters
            .get(cluster)
            .ok_or_else(|| ProxyError::Config(format!("unknown cluster \"{cluster}\"")))?;
        let shard_pools = pools.shards.get(shard).ok_or_else(|| {
            ProxyError::Protocol(format!("shard {shard} does not exist in \"{cluster}\""))
        })?;

        if role == Role::Replica && pools.read_write_split && !shard_pools.replicas.is_empty() {
            let mut last_err = None;
            for pool in shard_pools.balancer.candidates(&shard_pools.replicas) {
                match pool.checkout().await {
                    Ok(guard) => return Ok(guard),
                    // A full replica is as unusable as a dead one: try the next, then the primary.
                    Err(err) if err.is_connection_error() || matches!(err, ProxyError::PoolExhausted { .. }) => {
                        warn!(replica = %pool.addr(), error = %err, "replica unavailable");
                        last_err = Some(err);
                    }
                    Err(err) => return Err(err),
                }
            }
            if let Some(err) = last_err {
                debug!(cluster, shard, error = %err, "reading from primary");
            }
        }
        shard_pools.primary.checkout().await
    }

    pub fn release(&self, guard: Guard, outcome: Outcome) {
        guard.release(outcome);
    }

    /// Drain and recreate connections of one cluster, or all of them.
    pub async fn reconnect(&self, cluster: Option<&str>) {
        let pools: Vec<&Pool> = self
            .clusters
            .iter()
            .filter(|(name, _)| cluster.map_or(true, |c| c == name.as_str()))
            .flat_map(|(_, c)| c.pools())
            .collect();
        info!(pools = pools.len(), "reconnecting");
        join_all(pools.iter().map(|pool| pool.reconnect())).await;
    }

    pub fn shutdown(&self, cluster: Option<&str>) {
        for (name, pools) in &self.clusters {
            if cluster.map_or(true, |c| c == name.as_str()) {
                pools.pools().for_each(Pool::shutdown);
            }
        }
    }

    pub async fn prewarm(&self) {
        join_all(self.clusters.values().flat_map(|c| c.pools()).map(Pool::prewarm)).await;
    }

    pub async fn maintain(&self) {
        join_all(self.clusters.values().flat_map(|c| c.pools()).map(Pool::maintain)).await;
    }

    /// Counters of every pool, with the cluster each belongs to.
    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        self.clusters
            .iter()
            .flat_map(|(name, c)| c.pools().map(move |pool| (name.clone(), pool.stats())))
            .collect()
    }
}
