pub mod backend;
pub mod balancer;
pub mod manager;
pub mod pool;
pub mod postgres;

pub use backend::{Address, Backend, Connector};
pub use balancer::{Balancer, LoadBalancing};
pub use manager::{ClusterSpec, PoolManager, ShardSpec};
pub use pool::{Guard, Outcome, Pool, PoolSettings, PoolStats};
pub use postgres::{PgConnection, PgConnector};
