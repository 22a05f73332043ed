use crate::statement::{
    placeholder_index, Analysis, CopyStatement, Filter, InsertRows, KeyValue, RangeEnd,
    StatementKind,
};
use pgshard_core::{PartitionFunction, ProxyError, Query, ShardId, ShardTarget, ShardedTable};
use sqlparser::ast::{visit_expressions_mut, Expr, SetExpr, Statement, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Bound, ControlFlow};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Where a statement has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// The statement, unchanged, on these shards.
    Shards(ShardTarget),
    /// Touches no sharded data; any one shard will do.
    Any,
    /// A rewritten statement per shard (multi-row INSERT).
    Split(Vec<(ShardId, Query)>),
}

impl Plan {
    /// Shards the plan needs; `None` for [`Plan::Any`].
    pub fn shards(&self, shard_count: usize) -> Option<BTreeSet<ShardId>> {
        match self {
            Plan::Shards(target) => Some(target.resolve(shard_count)),
            Plan::Any => None,
            Plan::Split(parts) => Some(parts.iter().map(|(shard, _)| *shard).collect()),
        }
    }
}

struct KeyedTable {
    table: ShardedTable,
    func: PartitionFunction,
}

impl KeyedTable {
    fn is_key(&self, column: &str) -> bool {
        self.table.column.eq_ignore_ascii_case(column)
    }
}

pub struct ShardRouter {
    shards: usize,
    tables: Vec<KeyedTable>,
    next: AtomicUsize,
}

impl ShardRouter {
    pub fn new(shards: usize, tables: &[ShardedTable]) -> Result<Self, ProxyError> {
        let tables = tables
            .iter()
            .map(|table| {
                Ok(KeyedTable {
                    func: PartitionFunction::new(table, shards)?,
                    table: table.clone(),
                })
            })
            .collect::<Result<Vec<_>, ProxyError>>()?;
        Ok(Self {
            shards,
            tables,
            next: AtomicUsize::new(0),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards
    }

    /// Round-robin pick for statements that can run anywhere.
    pub fn any_shard(&self) -> ShardId {
        self.next.fetch_add(1, Ordering::Relaxed) % self.shards.max(1)
    }

    /// Shard of a text key value for `table`; `None` if the table is not
    /// sharded or the value does not parse as its key type.
    pub fn route(&self, table: &str, value: &str) -> Option<ShardId> {
        if self.shards == 1 {
            return Some(0);
        }
        let keyed = self
            .tables
            .iter()
            .find(|t| t.table.name.is_some() && t.table.matches(table))
            .or_else(|| self.tables.iter().find(|t| t.table.name.is_none()))?;
        keyed.func.shard_text(value)
    }

    /// Shards a WHERE clause can touch, for the key column of `table`.
    /// `None` means the predicate does not narrow the statement.
    pub fn route_range(&self, table: &str, filter: &Filter, query: &Query) -> Option<BTreeSet<ShardId>> {
        let keyed = self.tables.iter().find(|t| t.table.matches(table))?;
        self.filter_shards(keyed, filter, query)
    }

    /// Key column position and partition function for a COPY into a sharded table.
    pub fn copy_key(&self, copy: &CopyStatement) -> Result<Option<(usize, &PartitionFunction)>, ProxyError> {
        let keyed = self
            .tables
            .iter()
            .find(|t| t.table.name.is_some() && t.table.matches(&copy.table))
            .or_else(|| {
                self.tables
                    .iter()
                    .find(|t| t.table.name.is_none() && copy.columns.iter().any(|c| t.is_key(c)))
            });
        let Some(keyed) = keyed else {
            return Ok(None);
        };
        let index = copy
            .columns
            .iter()
            .position(|c| keyed.is_key(c))
            .ok_or_else(|| {
                ProxyError::NotSupported(format!(
                    "COPY into sharded table {} must list its key column {}",
                    copy.table, keyed.table.column
                ))
            })?;
        Ok(Some((index, &keyed.func)))
    }

    /// Decide where a statement runs.
    pub fn plan(&self, analysis: &Analysis, query: &Query) -> Result<Plan, ProxyError> {
        if let Some(shard) = analysis.hint {
            if shard >= self.shards {
                return Err(ProxyError::Protocol(format!(
                    "shard hint {shard} is out of range, cluster has {} shards",
                    self.shards
                )));
            }
            return Ok(Plan::Shards(ShardTarget::Direct(shard)));
        }
        if analysis.control.is_some() {
            return Ok(Plan::Any);
        }
        if self.shards == 1 {
            return Ok(Plan::Shards(ShardTarget::Direct(0)));
        }
        if analysis.kind == StatementKind::Ddl {
            return Ok(Plan::Shards(ShardTarget::All));
        }
        if self.reads_sharded(&analysis.nested_tables) {
            // A row written to one shard cannot see the other shards' rows.
            if analysis.insert.is_some() || analysis.cte_write {
                return Err(ProxyError::NotSupported(format!(
                    "{} that reads sharded tables through a subquery",
                    analysis.command
                )));
            }
            debug!(command = %analysis.command, tables = ?analysis.nested_tables, "subquery reads sharded tables");
            return Ok(Plan::Shards(ShardTarget::All));
        }

        let keyed = self.key_table(analysis);
        let plan = match (keyed, &analysis.insert) {
            (Some(keyed), Some(insert)) => self.plan_insert(keyed, insert, analysis, query)?,
            (Some(keyed), None) => match self.filter_shards(keyed, &analysis.filter, query) {
                Some(shards) if !shards.is_empty() => {
                    Plan::Shards(ShardTarget::from_set(shards, self.shards))
                }
                _ => Plan::Shards(ShardTarget::All),
            },
            // Unsharded tables are kept identical on every shard.
            (None, _) if analysis.kind == StatementKind::Write => Plan::Shards(ShardTarget::All),
            (None, _) => Plan::Any,
        };
        debug!(command = %analysis.command, ?plan, "routed statement");
        Ok(plan)
    }

    /// Whether any of `tables` may hold sharded rows. A key column declared
    /// without a table could belong to any of them.
    fn reads_sharded(&self, tables: &[String]) -> bool {
        !tables.is_empty() && self.tables.iter().any(|t| tables.iter().any(|name| t.table.matches(name)))
    }

    fn key_table(&self, analysis: &Analysis) -> Option<&KeyedTable> {
        for table in &analysis.tables {
            if let Some(keyed) = self
                .tables
                .iter()
                .find(|t| t.table.name.is_some() && t.table.matches(table))
            {
                return Some(keyed);
            }
        }
        self.tables.iter().find(|t| {
            t.table.name.is_none()
                && (mentions(&analysis.filter, &t.table.column)
                    || analysis
                        .insert
                        .as_ref()
                        .is_some_and(|insert| insert.columns.iter().any(|c| t.is_key(c))))
        })
    }

    fn value_shard(&self, func: &PartitionFunction, value: &KeyValue, query: &Query) -> Option<ShardId> {
        match value {
            KeyValue::Literal(text) => func.shard_text(text),
            KeyValue::Param(index) => {
                let bytes = query.params.get(*index)?.as_ref()?;
                if query.param_format(*index) == 1 {
                    func.shard_binary(bytes)
                } else {
                    func.shard_text(std::str::from_utf8(bytes).ok()?)
                }
            }
            KeyValue::Null | KeyValue::Other => None,
        }
    }

    fn int_value(&self, value: &KeyValue, query: &Query) -> Option<i64> {
        match value {
            KeyValue::Literal(text) => text.trim().parse().ok(),
            KeyValue::Param(index) => {
                let bytes = query.params.get(*index)?.as_ref()?;
                if query.param_format(*index) == 1 {
                    match bytes.len() {
                        8 => Some(i64::from_be_bytes(bytes.as_slice().try_into().ok()?)),
                        4 => Some(i32::from_be_bytes(bytes.as_slice().try_into().ok()?) as i64),
                        2 => Some(i16::from_be_bytes(bytes.as_slice().try_into().ok()?) as i64),
                        _ => None,
                    }
                } else {
                    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
                }
            }
            KeyValue::Null | KeyValue::Other => None,
        }
    }

    fn bound(&self, end: &Option<RangeEnd>, query: &Query) -> Option<Bound<i64>> {
        match end {
            None => Some(Bound::Unbounded),
            Some(end) => {
                let value = self.int_value(&end.value, query)?;
                Some(if end.inclusive {
                    Bound::Included(value)
                } else {
                    Bound::Excluded(value)
                })
            }
        }
    }

    fn filter_shards(&self, keyed: &KeyedTable, filter: &Filter, query: &Query) -> Option<BTreeSet<ShardId>> {
        match filter {
            Filter::Eq { column, value } if keyed.is_key(column) => self
                .value_shard(&keyed.func, value, query)
                .map(|shard| BTreeSet::from([shard])),
            Filter::In { column, values } if keyed.is_key(column) => {
                let mut shards = BTreeSet::new();
                for value in values {
                    shards.insert(self.value_shard(&keyed.func, value, query)?);
                }
                Some(shards)
            }
            Filter::Range {
                column,
                lower,
                upper,
            } if keyed.is_key(column) => {
                let lower = self.bound(lower, query)?;
                let upper = self.bound(upper, query)?;
                keyed.func.shards_between(lower, upper)
            }
            Filter::And(parts) => {
                let sets: Vec<BTreeSet<ShardId>> = parts
                    .iter()
                    .filter_map(|part| self.filter_shards(keyed, part, query))
                    .collect();
                let (first, rest) = sets.split_first()?;
                let both: BTreeSet<ShardId> = rest.iter().fold(first.clone(), |acc, set| {
                    acc.intersection(set).copied().collect()
                });
                // Contradictory predicates match nothing; any one shard answers that.
                Some(if both.is_empty() { first.clone() } else { both })
            }
            Filter::Or(parts) => {
                let mut shards = BTreeSet::new();
                for part in parts {
                    shards.extend(self.filter_shards(keyed, part, query)?);
                }
                Some(shards)
            }
            _ => None,
        }
    }

    /// Group INSERT rows by shard; rows for different shards become separate statements.
    fn plan_insert(
        &self,
        keyed: &KeyedTable,
        insert: &InsertRows,
        analysis: &Analysis,
        query: &Query,
    ) -> Result<Plan, ProxyError> {
        let index = insert
            .columns
            .iter()
            .position(|c| keyed.is_key(c))
            .ok_or_else(|| {
                ProxyError::NotSupported(format!(
                    "INSERT into sharded table {} must name its key column {}",
                    insert.table, keyed.table.column
                ))
            })?;
        if insert.rows.is_empty() {
            return Err(ProxyError::NotSupported(format!(
                "INSERT into sharded table {} needs a VALUES list",
                insert.table
            )));
        }
        let mut groups: BTreeMap<ShardId, Vec<usize>> = BTreeMap::new();
        for (row, values) in insert.rows.iter().enumerate() {
            let value = values.get(index).unwrap_or(&KeyValue::Other);
            let shard = self.value_shard(&keyed.func, value, query).ok_or_else(|| {
                ProxyError::NotSupported(format!(
                    "cannot determine the shard of row {} inserted into {}",
                    row + 1,
                    insert.table
                ))
            })?;
            groups.entry(shard).or_default().push(row);
        }
        if groups.len() == 1 {
            let shard = groups.keys().next().copied().unwrap_or_default();
            return Ok(Plan::Shards(ShardTarget::Direct(shard)));
        }
        let statement = analysis.statement.as_ref().ok_or_else(|| {
            ProxyError::NotSupported("multi-shard INSERT that cannot be rewritten".into())
        })?;
        let parts = groups
            .into_iter()
            .map(|(shard, rows)| Ok((shard, rewrite_insert(statement, &rows, query)?)))
            .collect::<Result<Vec<_>, ProxyError>>()?;
        Ok(Plan::Split(parts))
    }
}

fn mentions(filter: &Filter, column: &str) -> bool {
    match filter {
        Filter::Eq { column: c, .. } | Filter::In { column: c, .. } | Filter::Range { column: c, .. } => {
            c.eq_ignore_ascii_case(column)
        }
        Filter::And(parts) | Filter::Or(parts) => parts.iter().any(|p| mentions(p, column)),
        Filter::Unknown => false,
    }
}

/// Keep only `rows` of an INSERT, renumbering `$n` across the whole statement
/// (VALUES, ON CONFLICT, RETURNING) so parameters stay dense.
pub fn rewrite_insert(statement: &Statement, rows: &[usize], query: &Query) -> Result<Query, ProxyError> {
    let mut statement = statement.clone();
    let Statement::Insert {
        source: Some(source),
        ..
    } = &mut statement
    else {
        return Err(ProxyError::NotSupported("multi-shard INSERT that cannot be split".into()));
    };
    let SetExpr::Values(values) = source.body.as_mut() else {
        return Err(ProxyError::NotSupported("multi-shard INSERT without VALUES".into()));
    };
    let selected = rows
        .iter()
        .map(|row| {
            values
                .rows
                .get(*row)
                .cloned()
                .ok_or_else(|| ProxyError::Protocol(format!("INSERT row {row} does not exist")))
        })
        .collect::<Result<Vec<_>, ProxyError>>()?;
    values.rows = selected;

    // new position -> original parameter index
    let mut params: Vec<usize> = Vec::new();
    let renumbered = visit_expressions_mut(&mut statement, |expr| {
        if let Expr::Value(Value::Placeholder(placeholder)) = expr {
            let Some(original) = placeholder_index(placeholder) else {
                return ControlFlow::Break(ProxyError::NotSupported(format!("placeholder {placeholder}")));
            };
            let position = match params.iter().position(|p| *p == original) {
                Some(position) => position,
                None => {
                    params.push(original);
                    params.len() - 1
                }
            };
            *placeholder = format!("${}", position + 1);
        }
        ControlFlow::Continue(())
    });
    if let ControlFlow::Break(err) = renumbered {
        return Err(err);
    }

    let mut rewritten = query.with_sql(statement.to_string());
    if !query.params.is_empty() {
        rewritten.params = params
            .iter()
            .map(|i| query.params.get(*i).cloned().flatten())
            .collect();
        if query.param_formats.len() > 1 {
            rewritten.param_formats = params.iter().map(|i| query.param_format(*i)).collect();
        }
        if !query.param_oids.is_empty() {
            rewritten.param_oids = params
                .iter()
                .map(|i| query.param_oids.get(*i).copied().unwrap_or(0))
                .collect();
        }
    }
    Ok(rewritten)
}
