use pgshard_core::{PartitionFunction, Role, ShardedTable};
use pgshard_pool::{Address, ClusterSpec, LoadBalancing, PoolSettings, ShardSpec};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default = "default_admin_database")]
    pub database: String,
    #[serde(default = "default_admin_user")]
    pub user: String,
    pub password_hash: Option<String>,
    pub password_plain: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            database: default_admin_database(),
            user: default_admin_user(),
            password_hash: None,
            password_plain: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub checkout_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub rollback_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 10,
            checkout_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 600_000,
            rollback_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            min: self.min,
            max: self.max,
            checkout_timeout: Duration::from_millis(self.checkout_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            rollback_timeout: Duration::from_millis(self.rollback_timeout_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_metrics_addr(),
        }
    }
}

/// One logical database exposed to clients.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    pub name: String,
    /// Client-facing user.
    pub user: String,
    pub password_hash: Option<String>,
    pub password_plain: Option<String>,
    /// Credentials used on the backends; default to the client-facing ones.
    pub server_user: Option<String>,
    pub server_password: Option<String>,
    #[serde(default = "default_true")]
    pub read_write_split: bool,
    #[serde(default)]
    pub load_balancing: LoadBalancing,
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub sharded_tables: Vec<ShardedTable>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShardConfig {
    /// Backend database name; defaults to the cluster name.
    pub database: Option<String>,
    pub primary: HostConfig,
    #[serde(default)]
    pub replicas: Vec<HostConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ClusterConfig {
    /// Pool topology for this cluster.
    pub fn spec(&self) -> ClusterSpec {
        let user = self.server_user.clone().unwrap_or_else(|| self.user.clone());
        let password = self
            .server_password
            .clone()
            .or_else(|| self.password_plain.clone());
        let address = |host: &HostConfig, database: &str, shard: usize, role: Role| Address {
            host: host.host.clone(),
            port: host.port,
            database: database.to_string(),
            user: user.clone(),
            password: password.clone(),
            shard,
            role,
        };
        let shards = self
            .shards
            .iter()
            .enumerate()
            .map(|(shard, config)| {
                let database = config.database.as_deref().unwrap_or(&self.name);
                ShardSpec {
                    primary: address(&config.primary, database, shard, Role::Primary),
                    replicas: config
                        .replicas
                        .iter()
                        .map(|host| address(host, database, shard, Role::Replica))
                        .collect(),
                }
            })
            .collect();
        ClusterSpec {
            name: self.name.clone(),
            shards,
            read_write_split: self.read_write_split,
            load_balancing: self.load_balancing,
        }
    }
}

impl Config {
    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.clusters.is_empty() {
            return Err(anyhow::anyhow!("no clusters configured"));
        }
        if self.pool.max == 0 {
            return Err(anyhow::anyhow!("pool max must be at least 1"));
        }
        if self.pool.min > self.pool.max {
            return Err(anyhow::anyhow!(
                "pool min {} exceeds pool max {}",
                self.pool.min,
                self.pool.max
            ));
        }
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(anyhow::anyhow!("cluster {} configured twice", cluster.name));
            }
            if cluster.name == self.admin.database {
                return Err(anyhow::anyhow!(
                    "cluster {} clashes with the admin database",
                    cluster.name
                ));
            }
            if cluster.shards.is_empty() {
                return Err(anyhow::anyhow!("cluster {} has no shards", cluster.name));
            }
            for table in &cluster.sharded_tables {
                PartitionFunction::new(table, cluster.shards.len())
                    .map_err(|err| anyhow::anyhow!("cluster {}: {err}", cluster.name))?;
            }
        }
        Ok(())
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_maintenance_interval_ms() -> u64 {
    10_000
}

fn default_admin_database() -> String {
    "pgshard".into()
}

fn default_admin_user() -> String {
    "admin".into()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9930".into()
}

fn default_port() -> u16 {
    5432
}

fn default_true() -> bool {
    true
}
