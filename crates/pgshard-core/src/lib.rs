pub mod error;
pub mod sharding;
pub mod types;

pub use error::{BackendError, ProxyError};
pub use sharding::{DataType, PartitionFunction, RangeBound, ShardedTable, ShardingMethod};
pub use types::{Column, DataRow, Description, Query, QueryResult, Role, ShardId, ShardTarget};
