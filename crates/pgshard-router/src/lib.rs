pub mod interceptor;
pub mod parser;
pub mod router;
pub mod splitter;
pub mod statement;

pub use interceptor::{BindingInterceptor, Portal, PreparedStatement, Routed};
pub use parser::{parse_sql, split_statements};
pub use router::{Plan, ShardRouter};
pub use splitter::{ReadWriteSplitter, TransactionRoles};
pub use statement::{analyze, Access, Analysis, Control, StatementKind};
