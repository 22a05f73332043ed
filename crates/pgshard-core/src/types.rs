use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type ShardId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

/// Shards a statement has to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardTarget {
    Direct(ShardId),
    Multi(BTreeSet<ShardId>),
    All,
}

impl ShardTarget {
    /// Normalize a set of shards: one shard is direct, every shard is `All`.
    pub fn from_set(shards: BTreeSet<ShardId>, shard_count: usize) -> Self {
        if shards.len() == 1 {
            shards
                .into_iter()
                .next()
                .map(ShardTarget::Direct)
                .unwrap_or(ShardTarget::All)
        } else if shards.is_empty() || shards.len() >= shard_count {
            ShardTarget::All
        } else {
            ShardTarget::Multi(shards)
        }
    }

    pub fn resolve(&self, shard_count: usize) -> BTreeSet<ShardId> {
        match self {
            ShardTarget::Direct(shard) => BTreeSet::from([*shard]),
            ShardTarget::Multi(shards) => shards.clone(),
            ShardTarget::All => (0..shard_count).collect(),
        }
    }
}

impl fmt::Display for ShardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardTarget::Direct(shard) => write!(f, "{shard}"),
            ShardTarget::Multi(shards) => write!(f, "{:?}", shards),
            ShardTarget::All => write!(f, "all"),
        }
    }
}

/// A single field of a RowDescription, kept as the server sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub table_oid: i32,
    pub column_id: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: i32, type_size: i16) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size,
            type_modifier: -1,
            format: 0,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, 25, -1)
    }

    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, 20, 8)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, 16, 1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRow {
    pub values: Vec<Option<Vec<u8>>>,
}

impl DataRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, value: impl ToString) -> Self {
        self.values.push(Some(value.to_string().into_bytes()));
        self
    }

    pub fn add_null(mut self) -> Self {
        self.values.push(None);
        self
    }

    pub fn text(&self, index: usize) -> Option<&str> {
        self.values
            .get(index)
            .and_then(|v| v.as_deref())
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Everything a statement produced on one backend (or merged across several).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<Column>,
    pub rows: Vec<DataRow>,
    pub tag: String,
}

impl QueryResult {
    pub fn command(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn rows(columns: Vec<Column>, rows: Vec<DataRow>) -> Self {
        let tag = format!("SELECT {}", rows.len());
        Self { columns, rows, tag }
    }
}

/// A statement as it is sent to a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub sql: String,
    pub params: Vec<Option<Vec<u8>>>,
    pub param_formats: Vec<i16>,
    pub param_oids: Vec<i32>,
    pub result_formats: Vec<i16>,
    /// Send with Parse/Bind/Execute instead of a simple Query message.
    pub extended: bool,
}

impl Query {
    pub fn simple(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }

    pub fn with_sql(&self, sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..self.clone()
        }
    }

    /// Format code of parameter `index` per the Bind rules (none, one for all, or one each).
    pub fn param_format(&self, index: usize) -> i16 {
        match self.param_formats.len() {
            0 => 0,
            1 => self.param_formats[0],
            _ => self.param_formats.get(index).copied().unwrap_or(0),
        }
    }
}

/// Parameter and result shapes of a prepared statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub params: Vec<i32>,
    pub columns: Vec<Column>,
}
