//! In-memory stand-in for a set of Postgres shards, used by the server tests.
//!
//! Each shard keeps one table set written by its primary. Replicas read a
//! snapshot of it which, with `lag > 0`, stays stale for that many replica
//! reads after every commit. Writes apply in place and are undone on
//! ROLLBACK, so concurrent transactions see each other's uncommitted rows.

use async_trait::async_trait;
use parking_lot::Mutex;
use pgshard_core::{BackendError, Column, DataRow, Description, ProxyError, Query, QueryResult, Role, ShardId};
use pgshard_pool::{Address, Backend, Connector};
use pgshard_protocol::TransactionState;
use pgshard_router::statement::{object_name, parse_copy, placeholder_index, CopyFormat, CopyStatement};
use sqlparser::ast::{
    BinaryOperator, Expr, FromTable, Query as SqlQuery, SelectItem, SetExpr, Statement, TableFactor,
    UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Int(i64),
    Text(String),
    Bool(bool),
}

impl Value {
    fn render(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(v.to_string().into_bytes()),
            Value::Text(v) => Some(v.clone().into_bytes()),
            Value::Bool(v) => Some(if *v { b"t".to_vec() } else { b"f".to_vec() }),
        }
    }

    fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Text(b)) => b.trim().parse::<i64>().ok().map(|b| a.cmp(&b)),
            (Value::Text(a), Value::Int(b)) => a.trim().parse::<i64>().ok().map(|a| a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Int,
    Text,
    Bool,
}

impl Kind {
    fn from_sql(data_type: &str) -> (Kind, i32) {
        let upper = data_type.to_ascii_uppercase();
        if upper.starts_with("BIGINT") || upper.starts_with("INT8") || upper.starts_with("BIGSERIAL") {
            (Kind::Int, 20)
        } else if upper.starts_with("INT") || upper.starts_with("SMALLINT") || upper.starts_with("SERIAL") {
            (Kind::Int, 23)
        } else if upper.starts_with("BOOL") {
            (Kind::Bool, 16)
        } else {
            (Kind::Text, 25)
        }
    }

    fn coerce(self, value: Value, column: &str) -> Result<Value, ProxyError> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (Kind::Int, Value::Text(text)) => text.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                sql_error("22P02", format!("invalid input syntax for type bigint: \"{text}\" (column {column})"))
            }),
            (Kind::Bool, Value::Text(text)) => match text.to_ascii_lowercase().as_str() {
                "t" | "true" | "1" | "on" | "yes" => Ok(Value::Bool(true)),
                "f" | "false" | "0" | "off" | "no" => Ok(Value::Bool(false)),
                _ => Err(sql_error("22P02", format!("invalid input syntax for type boolean: \"{text}\""))),
            },
            (Kind::Text, Value::Int(v)) => Ok(Value::Text(v.to_string())),
            (Kind::Text, Value::Bool(v)) => Ok(Value::Text(if v { "true".into() } else { "false".into() })),
            (_, value) => Ok(value),
        }
    }
}

#[derive(Debug, Clone)]
struct TableDef {
    name: String,
    kind: Kind,
    oid: i32,
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<TableDef>,
    rows: BTreeMap<u64, Vec<Value>>,
    next_id: u64,
}

impl Table {
    fn position(&self, name: &str) -> Result<usize, ProxyError> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| sql_error("42703", format!("column \"{name}\" does not exist")))
    }
}

type Tables = BTreeMap<String, Table>;

enum Undo {
    Created(String),
    Inserted(String, u64),
    Replaced(String, u64, Vec<Value>),
    Removed(String, u64, Vec<Value>),
}

#[derive(Default)]
struct ShardState {
    primary: Tables,
    snapshot: Tables,
    stale_reads: usize,
}

/// Shard data shared by a connector and every connection it opened.
pub struct Cluster {
    shards: Vec<Mutex<ShardState>>,
    lag: usize,
    failures: Mutex<Vec<(ShardId, String)>>,
    breaks: Mutex<Vec<(ShardId, String)>>,
    connects: AtomicUsize,
    log: Mutex<Vec<(ShardId, Role, String)>>,
}

impl Cluster {
    /// Statements on `shard` containing `pattern` fail with an ERROR.
    pub fn fail_on(&self, shard: ShardId, pattern: &str) {
        self.failures.lock().push((shard, pattern.to_string()));
    }

    /// Statements on `shard` containing `pattern` kill the connection.
    pub fn break_on(&self, shard: ShardId, pattern: &str) {
        self.breaks.lock().push((shard, pattern.to_string()));
    }

    pub fn connections(&self) -> usize {
        self.connects.load(AtomicOrdering::SeqCst)
    }

    /// Statements a shard's primary or replicas received, in arrival order.
    pub fn statements(&self, shard: ShardId, role: Role) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(s, r, _)| *s == shard && *r == role)
            .map(|(_, _, sql)| sql.clone())
            .collect()
    }

    /// Rows of `table` on a shard's primary, as text, in insertion order.
    pub fn rows(&self, shard: ShardId, table: &str) -> Vec<Vec<Option<String>>> {
        let state = self.shards[shard].lock();
        state
            .primary
            .get(table)
            .map(|t| {
                t.rows
                    .values()
                    .map(|row| {
                        row.iter()
                            .map(|v| v.render().map(|b| String::from_utf8_lossy(&b).into_owned()))
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Connector for every shard of one test cluster.
pub struct MemoryConnector {
    cluster: Arc<Cluster>,
}

impl MemoryConnector {
    pub fn new(shards: usize) -> Arc<Self> {
        Self::with_lag(shards, 0)
    }

    /// Replicas keep serving their old snapshot for `lag` reads after a commit.
    pub fn with_lag(shards: usize, lag: usize) -> Arc<Self> {
        Arc::new(Self {
            cluster: Arc::new(Cluster {
                shards: (0..shards).map(|_| Mutex::new(ShardState::default())).collect(),
                lag,
                failures: Mutex::new(Vec::new()),
                breaks: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                log: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl std::ops::Deref for MemoryConnector {
    type Target = Cluster;

    fn deref(&self) -> &Cluster {
        &self.cluster
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, addr: &Address) -> Result<Box<dyn Backend>, ProxyError> {
        if addr.shard >= self.cluster.shards.len() {
            return Err(ProxyError::BackendUnavailable(format!("no server at {addr}")));
        }
        self.cluster.connects.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Box::new(MemoryConnection {
            cluster: self.cluster.clone(),
            shard: addr.shard,
            role: addr.role,
            txn: None,
            copy: None,
            broken: false,
        }))
    }
}

struct Txn {
    undo: Vec<Undo>,
    failed: bool,
}

struct CopyIn {
    statement: CopyStatement,
    data: Vec<u8>,
}

struct MemoryConnection {
    cluster: Arc<Cluster>,
    shard: ShardId,
    role: Role,
    txn: Option<Txn>,
    copy: Option<CopyIn>,
    broken: bool,
}

fn scope<'a>(columns: &'a [TableDef], row: &'a [Value]) -> Option<(&'a [TableDef], &'a [Value])> {
    Some((columns, row))
}

fn sql_error(code: &str, message: impl Into<String>) -> ProxyError {
    ProxyError::Backend(BackendError::new(code, message))
}

fn first_word(sql: &str) -> String {
    let mut rest = sql.trim_start();
    while let Some(comment) = rest.strip_prefix("/*") {
        rest = comment.split_once("*/").map_or("", |(_, after)| after).trim_start();
    }
    rest.split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

impl MemoryConnection {
    fn check_injected(&mut self, sql: &str) -> Result<(), ProxyError> {
        let shard = self.shard;
        if self.cluster.breaks.lock().iter().any(|(s, p)| *s == shard && sql.contains(p.as_str())) {
            self.broken = true;
            return Err(ProxyError::BackendUnavailable(format!("shard {shard} connection lost")));
        }
        if self.cluster.failures.lock().iter().any(|(s, p)| *s == shard && sql.contains(p.as_str())) {
            return Err(sql_error("XX000", format!("injected failure on shard {shard}")));
        }
        Ok(())
    }

    fn read_only_error(&self, command: &str) -> Option<ProxyError> {
        (self.role == Role::Replica).then(|| {
            ProxyError::ReadOnlyTransactionViolation {
                command: command.to_string(),
            }
        })
    }

    fn committed(&self, state: &mut ShardState) {
        state.stale_reads = self.cluster.lag;
        if self.cluster.lag == 0 {
            state.snapshot = state.primary.clone();
        }
    }

    fn run(&mut self, query: &Query) -> Result<QueryResult, ProxyError> {
        if self.broken {
            return Err(ProxyError::BackendUnavailable("connection closed".into()));
        }
        let word = first_word(&query.sql);
        match word.as_str() {
            "BEGIN" | "START" => {
                if self.txn.is_none() {
                    self.txn = Some(Txn {
                        undo: Vec::new(),
                        failed: false,
                    });
                }
                return Ok(QueryResult::command("BEGIN"));
            }
            "COMMIT" | "END" => {
                return Ok(match self.txn.take() {
                    Some(txn) if txn.failed => {
                        self.undo(txn.undo);
                        QueryResult::command("ROLLBACK")
                    }
                    Some(txn) => {
                        if !txn.undo.is_empty() {
                            let mut state = self.cluster.shards[self.shard].lock();
                            self.committed(&mut state);
                        }
                        QueryResult::command("COMMIT")
                    }
                    None => QueryResult::command("COMMIT"),
                });
            }
            "ROLLBACK" | "ABORT" => {
                if let Some(txn) = self.txn.take() {
                    self.undo(txn.undo);
                }
                return Ok(QueryResult::command("ROLLBACK"));
            }
            _ => {}
        }
        if self.txn.as_ref().is_some_and(|t| t.failed) {
            return Err(ProxyError::TransactionAborted);
        }
        let result = self.check_injected(&query.sql).and_then(|()| self.statement(&word, query));
        if let Some(txn) = self.txn.as_mut() {
            if result.is_err() {
                txn.failed = true;
            }
        } else if result.is_ok() && matches!(word.as_str(), "INSERT" | "UPDATE" | "DELETE" | "CREATE") {
            let mut state = self.cluster.shards[self.shard].lock();
            self.committed(&mut state);
        }
        result
    }

    fn undo(&self, undo: Vec<Undo>) {
        let mut state = self.cluster.shards[self.shard].lock();
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Created(name) => {
                    state.primary.remove(&name);
                }
                Undo::Inserted(table, id) => {
                    if let Some(t) = state.primary.get_mut(&table) {
                        t.rows.remove(&id);
                    }
                }
                Undo::Replaced(table, id, row) | Undo::Removed(table, id, row) => {
                    if let Some(t) = state.primary.get_mut(&table) {
                        t.rows.insert(id, row);
                    }
                }
            }
        }
    }

    fn record(&mut self, entry: Undo) {
        if let Some(txn) = self.txn.as_mut() {
            txn.undo.push(entry);
        }
    }

    fn statement(&mut self, word: &str, query: &Query) -> Result<QueryResult, ProxyError> {
        if matches!(word, "SET" | "SAVEPOINT" | "RELEASE" | "RESET" | "DISCARD") {
            return Ok(QueryResult::command(word));
        }
        let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, &query.sql)
            .map_err(|err| sql_error("42601", err.to_string()))?;
        let statement = match (statements.pop(), statements.is_empty()) {
            (Some(statement), true) => statement,
            (None, _) => return Ok(QueryResult::command("")),
            _ => return Err(sql_error("42601", "cannot insert multiple commands into a prepared statement")),
        };
        match &statement {
            Statement::Query(select) => self.select(select, query),
            Statement::CreateTable {
                name,
                columns,
                if_not_exists,
                ..
            } => {
                if let Some(err) = self.read_only_error("CREATE TABLE") {
                    return Err(err);
                }
                let table = object_name(name);
                let mut state = self.cluster.shards[self.shard].lock();
                if state.primary.contains_key(&table) {
                    if *if_not_exists {
                        return Ok(QueryResult::command("CREATE TABLE"));
                    }
                    return Err(sql_error("42P07", format!("relation \"{table}\" already exists")));
                }
                let columns = columns
                    .iter()
                    .map(|c| {
                        let (kind, oid) = Kind::from_sql(&c.data_type.to_string());
                        TableDef {
                            name: c.name.value.clone(),
                            kind,
                            oid,
                        }
                    })
                    .collect();
                state.primary.insert(
                    table.clone(),
                    Table {
                        columns,
                        ..Default::default()
                    },
                );
                drop(state);
                self.record(Undo::Created(table));
                Ok(QueryResult::command("CREATE TABLE"))
            }
            Statement::Insert {
                table_name,
                columns,
                source,
                returning,
                ..
            } => {
                if let Some(err) = self.read_only_error("INSERT") {
                    return Err(err);
                }
                let table = object_name(table_name);
                let rows = match source.as_ref().map(|s| s.body.as_ref()) {
                    Some(SetExpr::Values(values)) => values
                        .rows
                        .iter()
                        .map(|row| row.iter().map(|e| eval(e, None, query)).collect())
                        .collect::<Result<Vec<Vec<Value>>, _>>()?,
                    _ => return Err(sql_error("0A000", "only INSERT ... VALUES is supported")),
                };
                let names: Vec<String> = columns.iter().map(|c| c.value.clone()).collect();
                let mut state = self.cluster.shards[self.shard].lock();
                let t = state.primary.get_mut(&table).ok_or_else(|| missing_table(&table))?;
                let mut inserted = Vec::new();
                for row in rows {
                    let mut full = vec![Value::Null; t.columns.len()];
                    for (i, value) in row.into_iter().enumerate() {
                        let index = match names.get(i) {
                            Some(name) => t.position(name)?,
                            None if names.is_empty() && i < t.columns.len() => i,
                            None => return Err(sql_error("42601", "INSERT has more expressions than target columns")),
                        };
                        full[index] = t.columns[index].kind.coerce(value, &t.columns[index].name)?;
                    }
                    let id = t.next_id;
                    t.next_id += 1;
                    t.rows.insert(id, full.clone());
                    inserted.push((id, full));
                }
                let columns = t.columns.clone();
                drop(state);
                let count = inserted.len();
                let mut out_rows = Vec::new();
                for (id, row) in inserted {
                    self.record(Undo::Inserted(table.clone(), id));
                    out_rows.push(row);
                }
                let tag = format!("INSERT 0 {count}");
                match returning {
                    Some(items) => {
                        let (columns, rows) = project(items, &columns, &out_rows, query)?;
                        Ok(QueryResult { columns, rows, tag })
                    }
                    None => Ok(QueryResult::command(tag)),
                }
            }
            Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => {
                if let Some(err) = self.read_only_error("UPDATE") {
                    return Err(err);
                }
                let name = match &table.relation {
                    TableFactor::Table { name, .. } => object_name(name),
                    _ => return Err(sql_error("0A000", "unsupported UPDATE target")),
                };
                let mut state = self.cluster.shards[self.shard].lock();
                let t = state.primary.get_mut(&name).ok_or_else(|| missing_table(&name))?;
                let mut targets = Vec::new();
                for a in assignments {
                    let column = a.id.last().map(|i| i.value.clone()).unwrap_or_default();
                    targets.push((t.position(&column)?, &a.value));
                }
                let ids = matching(t, selection.as_ref(), query)?;
                let mut undo = Vec::new();
                for id in &ids {
                    let Some(row) = t.rows.get(id).cloned() else { continue };
                    let mut updated = row.clone();
                    for (index, expr) in &targets {
                        let value = eval(expr, scope(&t.columns, &row), query)?;
                        updated[*index] = t.columns[*index].kind.coerce(value, &t.columns[*index].name)?;
                    }
                    t.rows.insert(*id, updated);
                    undo.push(Undo::Replaced(name.clone(), *id, row));
                }
                drop(state);
                undo.into_iter().for_each(|u| self.record(u));
                Ok(QueryResult::command(format!("UPDATE {}", ids.len())))
            }
            Statement::Delete { from, selection, .. } => {
                if let Some(err) = self.read_only_error("DELETE") {
                    return Err(err);
                }
                let relations = match from {
                    FromTable::WithFromKeyword(r) | FromTable::WithoutKeyword(r) => r,
                };
                let name = match relations.first().map(|r| &r.relation) {
                    Some(TableFactor::Table { name, .. }) => object_name(name),
                    _ => return Err(sql_error("0A000", "unsupported DELETE target")),
                };
                let mut state = self.cluster.shards[self.shard].lock();
                let t = state.primary.get_mut(&name).ok_or_else(|| missing_table(&name))?;
                let ids = matching(t, selection.as_ref(), query)?;
                let mut undo = Vec::new();
                for id in &ids {
                    if let Some(row) = t.rows.remove(id) {
                        undo.push(Undo::Removed(name.clone(), *id, row));
                    }
                }
                drop(state);
                undo.into_iter().for_each(|u| self.record(u));
                Ok(QueryResult::command(format!("DELETE {}", ids.len())))
            }
            _ => Err(sql_error("0A000", format!("{word} is not supported by the test backend"))),
        }
    }

    fn select(&mut self, select: &SqlQuery, query: &Query) -> Result<QueryResult, ProxyError> {
        let SetExpr::Select(body) = select.body.as_ref() else {
            return Err(sql_error("0A000", "only plain SELECT is supported"));
        };
        let table_name = match body.from.first().map(|r| &r.relation) {
            Some(TableFactor::Table { name, .. }) => Some(object_name(name)),
            None => None,
            Some(_) => return Err(sql_error("0A000", "unsupported FROM item")),
        };
        let Some(table_name) = table_name else {
            let (columns, rows) = project(&body.projection, &[], &[Vec::new()], query)?;
            return Ok(QueryResult::rows(columns, rows));
        };

        let table = {
            let mut state = self.cluster.shards[self.shard].lock();
            if self.role == Role::Replica {
                if state.stale_reads > 0 {
                    state.stale_reads -= 1;
                } else {
                    state.snapshot = state.primary.clone();
                }
                state.snapshot.get(&table_name).cloned()
            } else {
                state.primary.get(&table_name).cloned()
            }
        };
        // A replica may not have seen the CREATE TABLE yet.
        let table = table.ok_or_else(|| missing_table(&table_name))?;
        let ids = matching(&table, body.selection.as_ref(), query)?;
        let mut rows: Vec<Vec<Value>> = ids.iter().filter_map(|id| table.rows.get(id).cloned()).collect();

        if !select.order_by.is_empty() {
            let mut keyed = Vec::with_capacity(rows.len());
            for row in rows {
                let keys = select
                    .order_by
                    .iter()
                    .map(|o| eval(&o.expr, scope(&table.columns, &row), query).map(|v| (v, o.asc == Some(false))))
                    .collect::<Result<Vec<_>, _>>()?;
                keyed.push((keys, row));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for ((x, desc), (y, _)) in a.iter().zip(b.iter()) {
                    let ordering = match (x, y) {
                        (Value::Null, Value::Null) => Ordering::Equal,
                        (Value::Null, _) => Ordering::Greater,
                        (_, Value::Null) => Ordering::Less,
                        _ => x.compare(y).unwrap_or(Ordering::Equal),
                    };
                    let ordering = if *desc { ordering.reverse() } else { ordering };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
            rows = keyed.into_iter().map(|(_, row)| row).collect();
        }
        if let Some(Expr::Value(SqlValue::Number(n, _))) = &select.limit {
            if let Ok(limit) = n.parse::<usize>() {
                rows.truncate(limit);
            }
        }

        let (columns, rows) = project(&body.projection, &table.columns, &rows, query)?;
        Ok(QueryResult::rows(columns, rows))
    }

    fn finish_copy(&mut self, copy: CopyIn) -> Result<QueryResult, ProxyError> {
        if let Some(err) = self.read_only_error("COPY") {
            return Err(err);
        }
        let statement = copy.statement;
        let records: Vec<Vec<Option<String>>> = match statement.format {
            CopyFormat::Csv => {
                let mut reader = csv::ReaderBuilder::new()
                    .has_headers(statement.header)
                    .delimiter(statement.delimiter)
                    .from_reader(copy.data.as_slice());
                let mut out = Vec::new();
                for record in reader.records() {
                    let record = record.map_err(|err| sql_error("22P04", err.to_string()))?;
                    out.push(
                        record
                            .iter()
                            .map(|f| (f != statement.null).then(|| f.to_string()))
                            .collect(),
                    );
                }
                out
            }
            CopyFormat::Text => String::from_utf8_lossy(&copy.data)
                .lines()
                .filter(|line| !line.is_empty() && *line != "\\.")
                .map(|line| {
                    line.split(statement.delimiter as char)
                        .map(|f| (f != statement.null).then(|| f.to_string()))
                        .collect()
                })
                .collect(),
            CopyFormat::Binary => return Err(sql_error("0A000", "binary COPY is not supported by the test backend")),
        };

        let mut state = self.cluster.shards[self.shard].lock();
        let t = state.primary.get_mut(&statement.table).ok_or_else(|| missing_table(&statement.table))?;
        let positions: Vec<usize> = if statement.columns.is_empty() {
            (0..t.columns.len()).collect()
        } else {
            statement
                .columns
                .iter()
                .map(|c| t.position(c))
                .collect::<Result<_, _>>()?
        };
        let mut inserted = Vec::new();
        for (line, record) in records.into_iter().enumerate() {
            if record.len() != positions.len() {
                return Err(sql_error("22P04", format!("COPY row {} has {} fields, expected {}", line + 1, record.len(), positions.len())));
            }
            let mut row = vec![Value::Null; t.columns.len()];
            for (field, index) in record.into_iter().zip(&positions) {
                let value = field.map(Value::Text).unwrap_or(Value::Null);
                row[*index] = t.columns[*index].kind.coerce(value, &t.columns[*index].name)?;
            }
            let id = t.next_id;
            t.next_id += 1;
            t.rows.insert(id, row);
            inserted.push(id);
        }
        let count = inserted.len();
        if self.txn.is_none() {
            self.committed(&mut state);
        }
        drop(state);
        for id in inserted {
            self.record(Undo::Inserted(statement.table.clone(), id));
        }
        Ok(QueryResult::command(format!("COPY {count}")))
    }
}

fn missing_table(name: &str) -> ProxyError {
    sql_error("42P01", format!("relation \"{name}\" does not exist"))
}

/// Ids of rows passing `selection`, in insertion order.
fn matching(table: &Table, selection: Option<&Expr>, query: &Query) -> Result<Vec<u64>, ProxyError> {
    let mut ids = Vec::new();
    for (id, row) in &table.rows {
        let keep = match selection {
            Some(expr) => eval(expr, scope(&table.columns, row), query)? == Value::Bool(true),
            None => true,
        };
        if keep {
            ids.push(*id);
        }
    }
    Ok(ids)
}

fn project(
    items: &[SelectItem],
    columns: &[TableDef],
    rows: &[Vec<Value>],
    query: &Query,
) -> Result<(Vec<Column>, Vec<DataRow>), ProxyError> {
    if items.iter().any(|item| matches!(item, SelectItem::UnnamedExpr(Expr::Function(f)) if f.name.to_string().eq_ignore_ascii_case("count"))) {
        let row = DataRow::new().add(rows.len());
        return Ok((vec![Column::bigint("count")], vec![row]));
    }
    let mut out_columns = Vec::new();
    let mut exprs: Vec<Option<&Expr>> = Vec::new();
    let mut wildcard_at = Vec::new();
    for item in items {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                for (i, c) in columns.iter().enumerate() {
                    out_columns.push(Column::new(c.name.clone(), c.oid, -1));
                    exprs.push(None);
                    wildcard_at.push(i);
                }
            }
            SelectItem::UnnamedExpr(expr) => {
                out_columns.push(expr_column(expr, columns, None));
                exprs.push(Some(expr));
                wildcard_at.push(0);
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                out_columns.push(expr_column(expr, columns, Some(&alias.value)));
                exprs.push(Some(expr));
                wildcard_at.push(0);
            }
        }
    }
    let mut out_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(exprs.len());
        for (expr, index) in exprs.iter().zip(&wildcard_at) {
            let value = match expr {
                Some(expr) => eval(expr, scope(columns, row), query)?,
                None => row.get(*index).cloned().unwrap_or(Value::Null),
            };
            values.push(value.render());
        }
        out_rows.push(DataRow { values });
    }
    Ok((out_columns, out_rows))
}

fn expr_column(expr: &Expr, columns: &[TableDef], alias: Option<&str>) -> Column {
    let name = match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.clone()).unwrap_or_default(),
        _ => "?column?".to_string(),
    };
    let oid = match expr {
        Expr::Value(SqlValue::Number(..)) => 23,
        Expr::Value(SqlValue::Boolean(_)) => 16,
        _ => columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&name))
            .map_or(25, |c| c.oid),
    };
    Column::new(alias.map(str::to_string).unwrap_or(name), oid, -1)
}

fn eval(expr: &Expr, row: Option<(&[TableDef], &[Value])>, query: &Query) -> Result<Value, ProxyError> {
    Ok(match expr {
        Expr::Identifier(ident) => column_value(&ident.value, row)?,
        Expr::CompoundIdentifier(parts) => {
            column_value(parts.last().map_or("", |p| p.value.as_str()), row)?
        }
        Expr::Value(value) => match value {
            SqlValue::Number(n, _) => n
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(n.clone())),
            SqlValue::SingleQuotedString(s) => Value::Text(s.clone()),
            SqlValue::Boolean(b) => Value::Bool(*b),
            SqlValue::Null => Value::Null,
            SqlValue::Placeholder(p) => param(p, query)?,
            other => Value::Text(other.to_string()),
        },
        Expr::Nested(inner) | Expr::Cast { expr: inner, .. } => eval(inner, row, query)?,
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match eval(expr, row, query)? {
            Value::Int(v) => Value::Int(-v),
            other => other,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => match eval(expr, row, query)? {
            Value::Bool(v) => Value::Bool(!v),
            other => other,
        },
        Expr::IsNull(inner) => Value::Bool(eval(inner, row, query)? == Value::Null),
        Expr::IsNotNull(inner) => Value::Bool(eval(inner, row, query)? != Value::Null),
        Expr::InList { expr, list, negated } => {
            let value = eval(expr, row, query)?;
            let mut found = false;
            for item in list {
                if value.compare(&eval(item, row, query)?) == Some(Ordering::Equal) {
                    found = true;
                }
            }
            Value::Bool(found != *negated)
        }
        Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let value = eval(expr, row, query)?;
            let low = value.compare(&eval(low, row, query)?);
            let high = value.compare(&eval(high, row, query)?);
            match (low, high) {
                (Some(low), Some(high)) => {
                    Value::Bool((low != Ordering::Less && high != Ordering::Greater) != *negated)
                }
                _ => Value::Null,
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let left = eval(left, row, query)?;
            let right = eval(right, row, query)?;
            binary(&left, op, &right)?
        }
        other => {
            return Err(sql_error("0A000", format!("expression {other} is not supported by the test backend")))
        }
    })
}

fn binary(left: &Value, op: &BinaryOperator, right: &Value) -> Result<Value, ProxyError> {
    let ordering = left.compare(right);
    Ok(match op {
        BinaryOperator::And => match (left, right) {
            (Value::Bool(a), Value::Bool(b)) => Value::Bool(*a && *b),
            _ => Value::Bool(false),
        },
        BinaryOperator::Or => match (left, right) {
            (Value::Bool(a), Value::Bool(b)) => Value::Bool(*a || *b),
            (Value::Bool(true), _) | (_, Value::Bool(true)) => Value::Bool(true),
            _ => Value::Bool(false),
        },
        BinaryOperator::Eq => ordering.map_or(Value::Null, |o| Value::Bool(o == Ordering::Equal)),
        BinaryOperator::NotEq => ordering.map_or(Value::Null, |o| Value::Bool(o != Ordering::Equal)),
        BinaryOperator::Lt => ordering.map_or(Value::Null, |o| Value::Bool(o == Ordering::Less)),
        BinaryOperator::LtEq => ordering.map_or(Value::Null, |o| Value::Bool(o != Ordering::Greater)),
        BinaryOperator::Gt => ordering.map_or(Value::Null, |o| Value::Bool(o == Ordering::Greater)),
        BinaryOperator::GtEq => ordering.map_or(Value::Null, |o| Value::Bool(o != Ordering::Less)),
        BinaryOperator::Plus | BinaryOperator::Minus | BinaryOperator::Multiply => {
            let (Some(a), Some(b)) = (as_int(left), as_int(right)) else {
                return Ok(Value::Null);
            };
            Value::Int(match op {
                BinaryOperator::Plus => a.wrapping_add(b),
                BinaryOperator::Minus => a.wrapping_sub(b),
                _ => a.wrapping_mul(b),
            })
        }
        BinaryOperator::StringConcat => match (left, right) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            _ => Value::Text(format!("{}{}", text_of(left), text_of(right))),
        },
        other => return Err(sql_error("0A000", format!("operator {other} is not supported by the test backend"))),
    })
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(*v),
        Value::Text(t) => t.trim().parse().ok(),
        _ => None,
    }
}

fn text_of(value: &Value) -> String {
    value
        .render()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}

fn column_value(name: &str, row: Option<(&[TableDef], &[Value])>) -> Result<Value, ProxyError> {
    let Some((columns, values)) = row else {
        return Err(sql_error("42703", format!("column \"{name}\" does not exist")));
    };
    let index = columns
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| sql_error("42703", format!("column \"{name}\" does not exist")))?;
    Ok(values.get(index).cloned().unwrap_or(Value::Null))
}

fn param(placeholder: &str, query: &Query) -> Result<Value, ProxyError> {
    let index = placeholder_index(placeholder)
        .ok_or_else(|| sql_error("42P02", format!("there is no parameter {placeholder}")))?;
    let value = query
        .params
        .get(index)
        .ok_or_else(|| sql_error("42P02", format!("there is no parameter {placeholder}")))?;
    let Some(bytes) = value else {
        return Ok(Value::Null);
    };
    if query.param_format(index) == 1 {
        return Ok(match bytes.len() {
            8 => Value::Int(i64::from_be_bytes(bytes.as_slice().try_into().unwrap_or_default())),
            4 => Value::Int(i32::from_be_bytes(bytes.as_slice().try_into().unwrap_or_default()) as i64),
            2 => Value::Int(i16::from_be_bytes(bytes.as_slice().try_into().unwrap_or_default()) as i64),
            1 => Value::Bool(bytes[0] != 0),
            _ => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        });
    }
    Ok(Value::Text(String::from_utf8_lossy(bytes).into_owned()))
}

#[async_trait]
impl Backend for MemoryConnection {
    async fn execute(&mut self, query: &Query) -> Result<QueryResult, ProxyError> {
        self.cluster
            .log
            .lock()
            .push((self.shard, self.role, query.sql.clone()));
        self.run(query)
    }

    async fn describe(&mut self, sql: &str, param_oids: &[i32]) -> Result<Description, ProxyError> {
        let statement = Parser::parse_sql(&PostgreSqlDialect {}, sql)
            .map_err(|err| sql_error("42601", err.to_string()))?
            .pop();
        let placeholders = sql
            .match_indices('$')
            .filter_map(|(i, _)| {
                let digits: String = sql[i + 1..].chars().take_while(char::is_ascii_digit).collect();
                digits.parse::<usize>().ok()
            })
            .max()
            .unwrap_or(0);
        let params = (0..placeholders.max(param_oids.len()))
            .map(|i| match param_oids.get(i) {
                Some(oid) if *oid != 0 => *oid,
                _ => 25,
            })
            .collect();
        let tables = self.cluster.shards[self.shard].lock().primary.clone();
        let empty = Query::default();
        let columns = match &statement {
            Some(Statement::Query(select)) => match select.body.as_ref() {
                SetExpr::Select(body) => {
                    let defs = match body.from.first().map(|r| &r.relation) {
                        Some(TableFactor::Table { name, .. }) => {
                            let name = object_name(name);
                            tables.get(&name).ok_or_else(|| missing_table(&name))?.columns.clone()
                        }
                        _ => Vec::new(),
                    };
                    project(&body.projection, &defs, &[], &empty)?.0
                }
                _ => Vec::new(),
            },
            Some(Statement::Insert {
                table_name,
                returning: Some(items),
                ..
            }) => {
                let name = object_name(table_name);
                let defs = tables.get(&name).ok_or_else(|| missing_table(&name))?.columns.clone();
                project(items, &defs, &[], &empty)?.0
            }
            _ => Vec::new(),
        };
        Ok(Description { params, columns })
    }

    async fn copy_in(&mut self, sql: &str) -> Result<(), ProxyError> {
        self.cluster.log.lock().push((self.shard, self.role, sql.to_string()));
        self.check_injected(sql)?;
        let statement = parse_copy(sql).ok_or_else(|| sql_error("42601", "malformed COPY"))?;
        if !self.cluster.shards[self.shard].lock().primary.contains_key(&statement.table) {
            return Err(missing_table(&statement.table));
        }
        self.copy = Some(CopyIn {
            statement,
            data: Vec::new(),
        });
        Ok(())
    }

    async fn copy_data(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        if self.broken {
            return Err(ProxyError::BackendUnavailable("connection closed".into()));
        }
        let copy = self
            .copy
            .as_mut()
            .ok_or_else(|| ProxyError::Protocol("no COPY in progress".into()))?;
        copy.data.extend_from_slice(data);
        Ok(())
    }

    async fn copy_done(&mut self) -> Result<QueryResult, ProxyError> {
        let copy = self
            .copy
            .take()
            .ok_or_else(|| ProxyError::Protocol("no COPY in progress".into()))?;
        let sql = String::from_utf8_lossy(&copy.data).into_owned();
        let result = self.check_injected(&sql).and_then(|()| self.finish_copy(copy));
        if result.is_err() {
            if let Some(txn) = self.txn.as_mut() {
                txn.failed = true;
            }
        }
        result
    }

    async fn copy_fail(&mut self, _message: &str) -> Result<(), ProxyError> {
        self.copy = None;
        if let Some(txn) = self.txn.as_mut() {
            txn.failed = true;
        }
        Ok(())
    }

    fn transaction_state(&self) -> TransactionState {
        match &self.txn {
            None => TransactionState::Idle,
            Some(txn) if txn.failed => TransactionState::Error,
            Some(_) => TransactionState::Transaction,
        }
    }

    fn in_copy(&self) -> bool {
        self.copy.is_some()
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}
