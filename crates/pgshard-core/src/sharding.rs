use crate::error::ProxyError;
use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Bigint,
    Uuid,
    Varchar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingMethod {
    #[default]
    Hash,
    Range,
}

/// Keys in `[min, max)` belong to `shard`. A missing bound is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeBound {
    pub shard: ShardId,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

/// A table (or, without a name, any table) sharded by `column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedTable {
    #[serde(default)]
    pub name: Option<String>,
    pub column: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub method: ShardingMethod,
    #[serde(default)]
    pub ranges: Vec<RangeBound>,
}

impl ShardedTable {
    pub fn hashed(name: &str, column: &str) -> Self {
        Self {
            name: Some(name.into()),
            column: column.into(),
            data_type: DataType::Bigint,
            method: ShardingMethod::Hash,
            ranges: Vec::new(),
        }
    }

    /// Does this definition apply to `table`?
    pub fn matches(&self, table: &str) -> bool {
        match &self.name {
            Some(name) => name.eq_ignore_ascii_case(table) || table_suffix(table) == name,
            None => true,
        }
    }
}

fn table_suffix(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

/// Maps a key value to exactly one shard.
#[derive(Debug, Clone)]
pub struct PartitionFunction {
    method: ShardingMethod,
    data_type: DataType,
    shards: usize,
    ranges: BTreeMap<i64, (Option<i64>, ShardId)>,
}

impl PartitionFunction {
    pub fn new(table: &ShardedTable, shards: usize) -> Result<Self, ProxyError> {
        if shards == 0 {
            return Err(ProxyError::Config("cluster has no shards".into()));
        }
        let mut ranges = BTreeMap::new();
        if table.method == ShardingMethod::Range {
            if table.data_type != DataType::Bigint {
                return Err(ProxyError::Config(format!(
                    "range sharding on {} requires a bigint key",
                    table.column
                )));
            }
            for bound in &table.ranges {
                if bound.shard >= shards {
                    return Err(ProxyError::Config(format!(
                        "range references shard {} but cluster has {} shards",
                        bound.shard, shards
                    )));
                }
                let min = bound.min.unwrap_or(i64::MIN);
                if let Some(max) = bound.max {
                    if max <= min {
                        return Err(ProxyError::Config(format!(
                            "empty range [{min}, {max}) for shard {}",
                            bound.shard
                        )));
                    }
                }
                if ranges.insert(min, (bound.max, bound.shard)).is_some() {
                    return Err(ProxyError::Config(format!("overlapping ranges at {min}")));
                }
            }
            let mut previous_max: Option<Option<i64>> = None;
            for (min, (max, _)) in &ranges {
                if let Some(prev) = previous_max {
                    match prev {
                        None => return Err(ProxyError::Config(format!("overlapping ranges at {min}"))),
                        Some(prev) if prev > *min => {
                            return Err(ProxyError::Config(format!("overlapping ranges at {min}")))
                        }
                        _ => {}
                    }
                }
                previous_max = Some(*max);
            }
        }
        Ok(Self {
            method: table.method,
            data_type: table.data_type,
            shards,
            ranges,
        })
    }

    pub fn shard_int(&self, value: i64) -> Option<ShardId> {
        match self.method {
            ShardingMethod::Hash => Some(self.modulo(hash_bytes(&value.to_be_bytes()))),
            ShardingMethod::Range => self
                .ranges
                .range((Bound::Unbounded, Bound::Included(value)))
                .next_back()
                .and_then(|(_, (max, shard))| match max {
                    Some(max) if value >= *max => None,
                    _ => Some(*shard),
                }),
        }
    }

    /// Shard a text-format value. `None` if it does not parse as the key type.
    pub fn shard_text(&self, value: &str) -> Option<ShardId> {
        let value = value.trim();
        match self.data_type {
            DataType::Bigint => value.parse::<i64>().ok().and_then(|v| self.shard_int(v)),
            DataType::Uuid => Uuid::parse_str(value)
                .ok()
                .map(|uuid| self.modulo(hash_bytes(uuid.as_bytes()))),
            DataType::Varchar => Some(self.modulo(hash_bytes(value.as_bytes()))),
        }
    }

    /// Shard a binary-format parameter.
    pub fn shard_binary(&self, bytes: &[u8]) -> Option<ShardId> {
        match self.data_type {
            DataType::Bigint => {
                let value = match bytes.len() {
                    8 => i64::from_be_bytes(bytes.try_into().ok()?),
                    4 => i32::from_be_bytes(bytes.try_into().ok()?) as i64,
                    2 => i16::from_be_bytes(bytes.try_into().ok()?) as i64,
                    _ => return None,
                };
                self.shard_int(value)
            }
            DataType::Uuid => Uuid::from_slice(bytes)
                .ok()
                .map(|uuid| self.modulo(hash_bytes(uuid.as_bytes()))),
            DataType::Varchar => Some(self.modulo(hash_bytes(bytes))),
        }
    }

    /// Shards whose ranges intersect `(lower, upper)`. `None` for hash sharding,
    /// where a range of keys can land anywhere.
    pub fn shards_between(&self, lower: Bound<i64>, upper: Bound<i64>) -> Option<BTreeSet<ShardId>> {
        if self.method != ShardingMethod::Range {
            return None;
        }
        let lo = match lower {
            Bound::Included(v) => v,
            Bound::Excluded(v) => v.checked_add(1)?,
            Bound::Unbounded => i64::MIN,
        };
        let hi = match upper {
            Bound::Included(v) => Some(v),
            Bound::Excluded(v) => Some(v.checked_sub(1)?),
            Bound::Unbounded => None,
        };
        let mut shards = BTreeSet::new();
        for (min, (max, shard)) in &self.ranges {
            let below_hi = hi.map_or(true, |hi| *min <= hi);
            let above_lo = max.map_or(true, |max| max > lo);
            if below_hi && above_lo {
                shards.insert(*shard);
            }
        }
        Some(shards)
    }

    fn modulo(&self, hash: u64) -> ShardId {
        (hash % self.shards as u64) as ShardId
    }
}

/// FNV-1a followed by a 64-bit finalizer. Stable across processes and platforms.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^ (hash >> 33)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranged() -> ShardedTable {
        ShardedTable {
            name: Some("users".into()),
            column: "id".into(),
            data_type: DataType::Bigint,
            method: ShardingMethod::Range,
            ranges: vec![
                RangeBound { shard: 0, min: None, max: Some(100) },
                RangeBound { shard: 1, min: Some(100), max: Some(1_000) },
                RangeBound { shard: 2, min: Some(1_000), max: None },
            ],
        }
    }

    #[test]
    fn hash_routing_is_deterministic() {
        let func = PartitionFunction::new(&ShardedTable::hashed("users", "id"), 4).expect("func");
        for key in [0i64, 1, 42, -7, 5_000_000_000] {
            let first = func.shard_int(key).expect("shard");
            assert!(first < 4);
            for _ in 0..10 {
                assert_eq!(func.shard_int(key), Some(first));
            }
            assert_eq!(func.shard_text(&key.to_string()), Some(first));
            assert_eq!(func.shard_binary(&key.to_be_bytes()), Some(first));
        }
    }

    #[test]
    fn hash_spreads_keys() {
        let func = PartitionFunction::new(&ShardedTable::hashed("users", "id"), 3).expect("func");
        let mut seen = [0usize; 3];
        for key in 0..300i64 {
            seen[func.shard_int(key).expect("shard")] += 1;
        }
        assert!(seen.iter().all(|count| *count > 50), "{seen:?}");
    }

    #[test]
    fn range_routing() {
        let func = PartitionFunction::new(&ranged(), 3).expect("func");
        assert_eq!(func.shard_int(-5), Some(0));
        assert_eq!(func.shard_int(99), Some(0));
        assert_eq!(func.shard_int(100), Some(1));
        assert_eq!(func.shard_int(999), Some(1));
        assert_eq!(func.shard_int(1_000), Some(2));
        assert_eq!(func.shard_text("5000000000"), Some(2));
    }

    #[test]
    fn range_predicates_select_intersecting_shards() {
        let func = PartitionFunction::new(&ranged(), 3).expect("func");
        let set = |lo, hi| func.shards_between(lo, hi).expect("range");
        assert_eq!(
            set(Bound::Included(50), Bound::Excluded(100)),
            BTreeSet::from([0])
        );
        assert_eq!(
            set(Bound::Included(50), Bound::Included(100)),
            BTreeSet::from([0, 1])
        );
        assert_eq!(
            set(Bound::Excluded(999), Bound::Unbounded),
            BTreeSet::from([2])
        );
        assert_eq!(
            set(Bound::Unbounded, Bound::Unbounded),
            BTreeSet::from([0, 1, 2])
        );
        let hashed = PartitionFunction::new(&ShardedTable::hashed("users", "id"), 3).expect("func");
        assert_eq!(hashed.shards_between(Bound::Included(1), Bound::Included(2)), None);
    }

    #[test]
    fn range_gaps_do_not_route() {
        let mut table = ranged();
        table.ranges = vec![RangeBound { shard: 0, min: Some(0), max: Some(10) }];
        let func = PartitionFunction::new(&table, 1).expect("func");
        assert_eq!(func.shard_int(10), None);
        assert_eq!(func.shard_int(-1), None);
    }

    #[test]
    fn overlapping_ranges_rejected() {
        let mut table = ranged();
        table.ranges[1].min = Some(50);
        assert!(PartitionFunction::new(&table, 3).is_err());
    }

    #[test]
    fn unparseable_values_do_not_route() {
        let func = PartitionFunction::new(&ShardedTable::hashed("users", "id"), 2).expect("func");
        assert_eq!(func.shard_text("not-a-number"), None);
        let mut uuid_table = ShardedTable::hashed("users", "id");
        uuid_table.data_type = DataType::Uuid;
        let func = PartitionFunction::new(&uuid_table, 2).expect("func");
        let id = "1f1e1d1c-0000-4000-8000-000000000001";
        assert_eq!(func.shard_text(id), func.shard_text(id));
        assert!(func.shard_text(id).is_some());
        assert_eq!(func.shard_text("nope"), None);
    }
}
