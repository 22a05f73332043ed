use futures::future::join_all;
use pgshard_core::{Column, DataRow, ProxyError, Query, QueryResult, ShardId};
use pgshard_pool::Guard;
use pgshard_router::statement::{Aggregate, AggregateFunction, OrderBy, OrderColumn};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Send each shard its statement concurrently and wait for every answer.
///
/// Results come back in shard-id order. Shards listed in `work` without a
/// connection in `conns` are reported as protocol errors.
pub async fn dispatch(
    conns: &mut BTreeMap<ShardId, Guard>,
    work: &[(ShardId, Query)],
) -> Vec<(ShardId, Result<QueryResult, ProxyError>)> {
    let mut missing = Vec::new();
    for (shard, _) in work {
        if !conns.contains_key(shard) {
            missing.push((
                *shard,
                Err(ProxyError::Protocol(format!("no connection bound for shard {shard}"))),
            ));
        }
    }
    let pending = conns.iter_mut().filter_map(|(shard, conn)| {
        let (_, query) = work.iter().find(|(s, _)| s == shard)?;
        let shard = *shard;
        Some(async move { (shard, conn.execute(query).await) })
    });
    let mut results = join_all(pending).await;
    results.extend(missing);
    results.sort_by_key(|(shard, _)| *shard);
    results
}

/// Merge per-shard results, or surface the first failure in shard order.
pub fn collect(
    results: Vec<(ShardId, Result<QueryResult, ProxyError>)>,
    order_by: &[OrderBy],
    aggregate: Option<&Aggregate>,
) -> Result<QueryResult, ProxyError> {
    let mut ok = Vec::with_capacity(results.len());
    for (shard, result) in results {
        ok.push((shard, result?));
    }
    match aggregate {
        Some(aggregate) if ok.len() > 1 => combine(ok, aggregate, order_by),
        _ => Ok(merge(ok, order_by)),
    }
}

/// Fold per-shard partial aggregates into one row per group: counts and sums
/// add up, MIN and MAX keep the extreme value, NULLs are skipped.
pub fn combine(
    results: Vec<(ShardId, QueryResult)>,
    aggregate: &Aggregate,
    order_by: &[OrderBy],
) -> Result<QueryResult, ProxyError> {
    if let Some(reason) = &aggregate.unsupported {
        return Err(ProxyError::NotSupported(format!("aggregate across shards: {reason}")));
    }
    let columns = results
        .iter()
        .map(|(_, r)| &r.columns)
        .find(|c| !c.is_empty())
        .cloned()
        .unwrap_or_default();

    let mut rows: Vec<DataRow> = Vec::new();
    let mut groups: HashMap<Vec<Option<Vec<u8>>>, usize> = HashMap::new();
    for (_, result) in results {
        for row in result.rows {
            let key: Vec<Option<Vec<u8>>> = aggregate
                .group_by
                .iter()
                .map(|column| row.values.get(*column).cloned().flatten())
                .collect();
            match groups.get(&key) {
                Some(at) => fold(&mut rows[*at], row, aggregate, &columns)?,
                None => {
                    groups.insert(key, rows.len());
                    rows.push(row);
                }
            }
        }
    }

    if let Some(keys) = sort_keys(order_by, &columns) {
        rows.sort_by(|a, b| compare_rows(a, b, &keys));
    }
    let tag = format!("SELECT {}", rows.len());
    Ok(QueryResult { columns, rows, tag })
}

fn fold(acc: &mut DataRow, row: DataRow, aggregate: &Aggregate, columns: &[Column]) -> Result<(), ProxyError> {
    let mut values = row.values;
    for target in &aggregate.targets {
        let column = target.column;
        let Some(next) = values.get_mut(column).and_then(Option::take) else {
            continue;
        };
        let Some(slot) = acc.values.get_mut(column) else {
            continue;
        };
        let Some(current) = slot.as_deref() else {
            *slot = Some(next);
            continue;
        };
        let (type_oid, binary) = columns
            .get(column)
            .map(|c| (c.type_oid, c.format == 1))
            .unwrap_or((0, false));
        let key = SortKey {
            index: column,
            descending: false,
            type_oid,
            binary,
        };
        let merged = match target.function {
            AggregateFunction::Count | AggregateFunction::Sum => {
                Some(add(current, &next, &key).ok_or_else(|| {
                    ProxyError::NotSupported(format!("cannot add values of column {} across shards", column + 1))
                })?)
            }
            AggregateFunction::Min => {
                (compare_values(Some(next.as_slice()), Some(current), &key) == Ordering::Less).then_some(next)
            }
            AggregateFunction::Max => {
                (compare_values(Some(next.as_slice()), Some(current), &key) == Ordering::Greater).then_some(next)
            }
        };
        if let Some(merged) = merged {
            *slot = Some(merged);
        }
    }
    Ok(())
}

fn add(a: &[u8], b: &[u8], key: &SortKey) -> Option<Vec<u8>> {
    if key.binary {
        let sum = match decode_binary(a, key.type_oid)?.zip_add(decode_binary(b, key.type_oid)?)? {
            Number::Int(v) => v,
            Number::Float(v) => return encode_float(v, key.type_oid),
        };
        return match key.type_oid {
            21 => i16::try_from(sum).ok().map(|v| v.to_be_bytes().to_vec()),
            23 => i32::try_from(sum).ok().map(|v| v.to_be_bytes().to_vec()),
            _ => Some(sum.to_be_bytes().to_vec()),
        };
    }
    let (a, b) = (std::str::from_utf8(a).ok()?, std::str::from_utf8(b).ok()?);
    if let (Some(x), Some(y)) = (Decimal::parse(a), Decimal::parse(b)) {
        if let Some(sum) = x.checked_add(&y) {
            return Some(sum.to_string().into_bytes());
        }
    }
    let sum = parse_text(a.as_bytes())?.as_f64() + parse_text(b.as_bytes())?.as_f64();
    Some(sum.to_string().into_bytes())
}

fn encode_float(value: f64, type_oid: i32) -> Option<Vec<u8>> {
    match type_oid {
        700 => Some((value as f32).to_be_bytes().to_vec()),
        701 => Some(value.to_be_bytes().to_vec()),
        _ => None,
    }
}

/// Exact decimal text, as Postgres prints `bigint` and `numeric`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Decimal {
    mantissa: i128,
    scale: u32,
}

impl Decimal {
    fn parse(text: &str) -> Option<Decimal> {
        let text = text.trim();
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        let mut mantissa: i128 = 0;
        for byte in whole.bytes().chain(fraction.bytes()) {
            mantissa = mantissa.checked_mul(10)?.checked_add(i128::from(byte - b'0'))?;
        }
        Some(Decimal {
            mantissa: if negative { -mantissa } else { mantissa },
            scale: u32::try_from(fraction.len()).ok()?,
        })
    }

    fn rescale(&self, scale: u32) -> Option<i128> {
        self.mantissa.checked_mul(10_i128.checked_pow(scale - self.scale)?)
    }

    fn checked_add(&self, other: &Decimal) -> Option<Decimal> {
        let scale = self.scale.max(other.scale);
        Some(Decimal {
            mantissa: self.rescale(scale)?.checked_add(other.rescale(scale)?)?,
            scale,
        })
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        if self.scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let scale = self.scale as usize;
        let digits = format!("{digits:0>width$}", width = scale + 1);
        let (whole, fraction) = digits.split_at(digits.len() - scale);
        write!(f, "{sign}{whole}.{fraction}")
    }
}

pub fn merge(results: Vec<(ShardId, QueryResult)>, order_by: &[OrderBy]) -> QueryResult {
    let columns = results
        .iter()
        .map(|(_, r)| &r.columns)
        .find(|c| !c.is_empty())
        .cloned()
        .unwrap_or_default();
    let tags: Vec<&str> = results.iter().map(|(_, r)| r.tag.as_str()).collect();
    let mut tag = merge_tags(&tags);

    let keys = sort_keys(order_by, &columns);
    let streams: Vec<Vec<DataRow>> = results.into_iter().map(|(_, r)| r.rows).collect();
    let rows = match keys {
        Some(keys) if streams.len() > 1 => merge_sorted(streams, &keys),
        _ => streams.into_iter().flatten().collect(),
    };
    if tag.starts_with("SELECT") {
        tag = format!("SELECT {}", rows.len());
    }
    QueryResult { columns, rows, tag }
}

/// `INSERT 0 2` + `INSERT 0 3` -> `INSERT 0 5`. Tags that do not end in a
/// count, or disagree on the command, are taken from the first shard.
pub fn merge_tags(tags: &[&str]) -> String {
    let Some(first) = tags.first() else {
        return String::new();
    };
    let Some((command, _)) = first.rsplit_once(' ') else {
        return first.to_string();
    };
    let mut total: u64 = 0;
    for tag in tags {
        match tag.rsplit_once(' ') {
            Some((c, count)) if c == command => match count.parse::<u64>() {
                Ok(count) => total += count,
                Err(_) => return first.to_string(),
            },
            _ => return first.to_string(),
        }
    }
    format!("{command} {total}")
}

struct SortKey {
    index: usize,
    descending: bool,
    type_oid: i32,
    binary: bool,
}

fn sort_keys(order_by: &[OrderBy], columns: &[Column]) -> Option<Vec<SortKey>> {
    if order_by.is_empty() {
        return None;
    }
    order_by
        .iter()
        .map(|item| {
            let index = match &item.column {
                OrderColumn::Name(name) => columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))?,
                OrderColumn::Position(position) => position.checked_sub(1)?,
            };
            let column = columns.get(index)?;
            Some(SortKey {
                index,
                descending: item.descending,
                type_oid: column.type_oid,
                binary: column.format == 1,
            })
        })
        .collect()
}

/// k-way merge of per-shard streams that are each already sorted.
fn merge_sorted(streams: Vec<Vec<DataRow>>, keys: &[SortKey]) -> Vec<DataRow> {
    let total = streams.iter().map(Vec::len).sum();
    let mut streams: Vec<VecDeque<DataRow>> = streams.into_iter().map(VecDeque::from).collect();
    let mut out = Vec::with_capacity(total);
    loop {
        // First minimum wins, so ties keep shard order.
        let next = streams
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.front().map(|row| (i, row)))
            .min_by(|(_, a), (_, b)| compare_rows(a, b, keys))
            .map(|(i, _)| i);
        let Some(i) = next else { break };
        if let Some(row) = streams[i].pop_front() {
            out.push(row);
        }
    }
    out
}

fn compare_rows(a: &DataRow, b: &DataRow, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let left = a.values.get(key.index).and_then(|v| v.as_deref());
        let right = b.values.get(key.index).and_then(|v| v.as_deref());
        let ordering = compare_values(left, right, key);
        let ordering = if key.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// NULL sorts above every value, as Postgres does by default.
fn compare_values(a: Option<&[u8]>, b: Option<&[u8]>, key: &SortKey) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let numbers = if key.binary {
                decode_binary(a, key.type_oid).zip(decode_binary(b, key.type_oid))
            } else {
                parse_text(a).zip(parse_text(b))
            };
            match numbers {
                Some((x, y)) => x.compare(&y),
                None => a.cmp(b),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn compare(&self, other: &Number) -> Ordering {
        match (self, other) {
            (Number::Int(x), Number::Int(y)) => x.cmp(y),
            _ => self
                .as_f64()
                .partial_cmp(&other.as_f64())
                .unwrap_or(Ordering::Equal),
        }
    }

    fn zip_add(self, other: Number) -> Option<Number> {
        match (self, other) {
            (Number::Int(x), Number::Int(y)) => x.checked_add(y).map(Number::Int),
            _ => Some(Number::Float(self.as_f64() + other.as_f64())),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Number::Int(v) => *v as f64,
            Number::Float(v) => *v,
        }
    }
}

fn parse_text(value: &[u8]) -> Option<Number> {
    let text = std::str::from_utf8(value).ok()?.trim();
    match text.parse::<i64>() {
        Ok(v) => Some(Number::Int(v)),
        Err(_) => text.parse::<f64>().ok().map(Number::Float),
    }
}

fn decode_binary(value: &[u8], type_oid: i32) -> Option<Number> {
    match (type_oid, value.len()) {
        (21, 2) => Some(Number::Int(i16::from_be_bytes(value.try_into().ok()?) as i64)),
        (23, 4) => Some(Number::Int(i32::from_be_bytes(value.try_into().ok()?) as i64)),
        (20, 8) => Some(Number::Int(i64::from_be_bytes(value.try_into().ok()?))),
        (700, 4) => Some(Number::Float(f32::from_be_bytes(value.try_into().ok()?) as f64)),
        (701, 8) => Some(Number::Float(f64::from_be_bytes(value.try_into().ok()?))),
        _ => None,
    }
}
