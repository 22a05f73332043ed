use crate::aggregator;
use crate::copy::CopySplitter;
use futures::future::join_all;
use metrics::counter;
use pgshard_core::{BackendError, Description, ProxyError, Query, QueryResult, Role, ShardId, ShardTarget};
use pgshard_pool::{Guard, Outcome, PoolManager};
use pgshard_protocol::TransactionState;
use pgshard_router::statement::{Access, Analysis, Control, StatementKind};
use pgshard_router::{Plan, ReadWriteSplitter, Routed, ShardRouter, TransactionRoles};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a session needs to route statements of one cluster.
pub struct ClusterContext {
    pub name: String,
    pub router: Arc<ShardRouter>,
    pub splitter: ReadWriteSplitter,
    pub pools: Arc<PoolManager>,
}

/// Where a client transaction stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// No transaction, no backend held.
    Idle,
    /// BEGIN seen; nothing routed yet.
    Open,
    /// Backends checked out and pinned until COMMIT or ROLLBACK.
    Bound { role: Role, shards: BTreeSet<ShardId> },
    /// A statement failed; only ROLLBACK (or COMMIT) is accepted.
    Failed,
}

#[derive(Debug, Default)]
struct Transaction {
    begin: Query,
    access: Option<Access>,
    role: Option<Role>,
    /// Set once, when the transaction first touches a backend.
    shards: Option<BTreeSet<ShardId>>,
    /// Session statements (SET, SAVEPOINT) issued before binding, replayed on bind.
    pending: Vec<Query>,
    failed: bool,
}

struct ActiveCopy {
    splitter: CopySplitter,
    /// Connections were checked out for this COPY alone.
    autocommit: bool,
    /// Wrapped in BEGIN/COMMIT across shards.
    implicit: bool,
}

/// What the client needs for its CopyInResponse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyStart {
    pub binary: bool,
    pub columns: usize,
}

/// Binds client transactions to backend connections.
///
/// Outside a transaction every statement checks out, runs and releases. Inside
/// one, BEGIN is held back until the first routed statement; that statement
/// decides the shard set and role, which stay fixed until the transaction ends.
pub struct Coordinator {
    cluster: Arc<ClusterContext>,
    txn: Option<Transaction>,
    conns: BTreeMap<ShardId, Guard>,
    copy: Option<ActiveCopy>,
}

impl Coordinator {
    pub fn new(cluster: Arc<ClusterContext>) -> Self {
        Self {
            cluster,
            txn: None,
            conns: BTreeMap::new(),
            copy: None,
        }
    }

    pub fn status(&self) -> TransactionState {
        match &self.txn {
            None => TransactionState::Idle,
            Some(txn) if txn.failed => TransactionState::Error,
            Some(_) => TransactionState::Transaction,
        }
    }

    pub fn phase(&self) -> Phase {
        match &self.txn {
            None => Phase::Idle,
            Some(txn) if txn.failed => Phase::Failed,
            Some(Transaction {
                shards: Some(shards),
                role,
                ..
            }) => Phase::Bound {
                role: role.unwrap_or(Role::Primary),
                shards: shards.clone(),
            },
            Some(_) => Phase::Open,
        }
    }

    /// Connections currently held by this session.
    pub fn held(&self) -> usize {
        self.conns.len()
    }

    pub async fn execute(&mut self, routed: &Routed) -> Result<QueryResult, ProxyError> {
        let analysis = routed.analysis.as_ref();
        if self.txn.as_ref().is_some_and(|t| t.failed) {
            return match analysis.control {
                Some(Control::Commit) | Some(Control::Rollback) => {
                    self.txn = None;
                    Ok(QueryResult::command("ROLLBACK"))
                }
                _ => Err(ProxyError::TransactionAborted),
            };
        }
        match analysis.control {
            Some(Control::Begin { access }) => {
                if self.txn.is_none() {
                    self.txn = Some(Transaction {
                        begin: routed.query.clone(),
                        access,
                        ..Default::default()
                    });
                }
                return Ok(QueryResult::command("BEGIN"));
            }
            Some(Control::Commit) => return self.finish(true).await,
            Some(Control::Rollback) => return self.finish(false).await,
            None => {}
        }
        if let Some(copy) = &analysis.copy {
            let err = ProxyError::NotSupported(format!(
                "COPY {} is only supported as COPY FROM STDIN over the simple query protocol",
                copy.table
            ));
            self.abort_on(&err).await;
            return Err(err);
        }

        let result = self.run(routed).await;
        if let Err(err) = &result {
            self.abort_on(err).await;
        }
        result
    }

    /// Any error inside a transaction aborts it: backends are rolled back and
    /// released, and the client must end the transaction block.
    pub async fn abort_on(&mut self, err: &ProxyError) {
        let Some(txn) = self.txn.as_mut() else {
            return;
        };
        if txn.failed {
            return;
        }
        txn.failed = true;
        warn!(cluster = %self.cluster.name, error = %err, "transaction aborted");
        counter!("pgshard_transactions_total", "outcome" => "aborted").increment(1);
        self.copy = None;
        let conns = std::mem::take(&mut self.conns);
        rollback_and_release(conns).await;
    }

    /// Client went away: roll back whatever is open and hand everything back.
    pub async fn close(&mut self) {
        if let Some(copy) = self.copy.take() {
            copy_fail_all(&mut self.conns, "client disconnected").await;
            if copy.autocommit && !copy.implicit {
                release_all(std::mem::take(&mut self.conns), Outcome::Clean);
            }
        }
        if self.txn.take().is_some() || !self.conns.is_empty() {
            rollback_and_release(std::mem::take(&mut self.conns)).await;
        }
    }

    async fn finish(&mut self, commit: bool) -> Result<QueryResult, ProxyError> {
        let tag = if commit { "COMMIT" } else { "ROLLBACK" };
        if self.txn.take().is_none() || self.conns.is_empty() {
            return Ok(QueryResult::command(tag));
        }
        let query = Query::simple(tag);
        let results = join_all(
            self.conns
                .iter_mut()
                .map(|(shard, conn)| {
                    let query = &query;
                    async move { (*shard, conn.execute(query).await) }
                }),
        )
        .await;
        let conns = std::mem::take(&mut self.conns);
        let mut first_err = None;
        let mut backend_tag = None;
        for (shard, result) in results {
            match result {
                Ok(result) => {
                    backend_tag.get_or_insert(result.tag);
                }
                Err(err) => {
                    warn!(shard, error = %err, "{tag} failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        let outcome = if first_err.is_some() {
            Outcome::Broken
        } else {
            Outcome::Clean
        };
        release_all(conns, outcome);
        match first_err {
            Some(err) => {
                counter!("pgshard_transactions_total", "outcome" => "failed").increment(1);
                Err(err)
            }
            None => {
                let outcome = if commit { "committed" } else { "rolled_back" };
                counter!("pgshard_transactions_total", "outcome" => outcome).increment(1);
                Ok(QueryResult::command(backend_tag.unwrap_or_else(|| tag.to_string())))
            }
        }
    }

    fn roles(&self) -> TransactionRoles {
        self.txn
            .as_ref()
            .map(|txn| TransactionRoles {
                access: txn.access,
                pinned: txn.role,
            })
            .unwrap_or_default()
    }

    async fn run(&mut self, routed: &Routed) -> Result<QueryResult, ProxyError> {
        let analysis = routed.analysis.as_ref();
        let role = self.cluster.splitter.classify(&self.roles(), analysis)?;
        let shard_count = self.cluster.router.shard_count();
        let work: Vec<(ShardId, Query)> = match &routed.plan {
            Plan::Any => {
                counter!("pgshard_statements_total", "route" => "any").increment(1);
                return self.run_anywhere(routed, role).await;
            }
            Plan::Shards(target) => target
                .resolve(shard_count)
                .into_iter()
                .map(|shard| (shard, routed.query.clone()))
                .collect(),
            Plan::Split(parts) => parts.clone(),
        };
        let shards: BTreeSet<ShardId> = work.iter().map(|(shard, _)| *shard).collect();
        let route = if shards.len() == 1 { "direct" } else { "multi" };
        counter!("pgshard_statements_total", "route" => route).increment(1);
        debug!(cluster = %self.cluster.name, command = %analysis.command, ?shards, %role, "dispatching");

        if self.txn.is_some() {
            self.bind(&shards, role).await?;
            self.dispatch(work, analysis).await
        } else {
            self.autocommit(work, role, analysis).await
        }
    }

    /// Statements that touch no sharded data.
    async fn run_anywhere(&mut self, routed: &Routed, role: Role) -> Result<QueryResult, ProxyError> {
        let analysis = routed.analysis.as_ref();
        let query = &routed.query;
        if self.txn.is_none() {
            let shard = self.cluster.router.any_shard();
            return self.standalone(shard, role, query).await;
        }
        if !self.conns.is_empty() {
            let targets: Vec<ShardId> = if analysis.kind == StatementKind::Read {
                self.conns.keys().take(1).copied().collect()
            } else {
                self.conns.keys().copied().collect()
            };
            let work = targets.into_iter().map(|s| (s, query.clone())).collect();
            return self.dispatch(work, analysis).await;
        }
        if analysis.kind != StatementKind::Read {
            if let Some(txn) = self.txn.as_mut() {
                txn.pending.push(query.clone());
            }
            return Ok(QueryResult::command(analysis.command.clone()));
        }
        // Reads inside the block must see its snapshot, so they bind it.
        let shard = self.cluster.router.any_shard();
        self.bind(&BTreeSet::from([shard]), role).await?;
        self.dispatch(vec![(shard, query.clone())], analysis).await
    }

    async fn standalone(&self, shard: ShardId, role: Role, query: &Query) -> Result<QueryResult, ProxyError> {
        let mut conn = self.checkout(shard, role).await?;
        let result = conn.execute(query).await;
        conn.release(outcome_of(&result));
        result
    }

    async fn checkout(&self, shard: ShardId, role: Role) -> Result<Guard, ProxyError> {
        self.cluster.pools.checkout(&self.cluster.name, shard, role).await
    }

    async fn checkout_all(&self, shards: &BTreeSet<ShardId>, role: Role) -> Result<BTreeMap<ShardId, Guard>, ProxyError> {
        let results = join_all(shards.iter().map(|shard| async move { (*shard, self.checkout(*shard, role).await) })).await;
        let mut conns = BTreeMap::new();
        let mut first_err = None;
        for (shard, result) in results {
            match result {
                Ok(conn) => {
                    conns.insert(shard, conn);
                }
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => {
                release_all(conns, Outcome::Clean);
                Err(err)
            }
            None => Ok(conns),
        }
    }

    /// Pin the transaction to `shards` on its first routed statement; later
    /// statements must stay within that set.
    async fn bind(&mut self, shards: &BTreeSet<ShardId>, role: Role) -> Result<(), ProxyError> {
        let Some(txn) = self.txn.as_ref() else {
            return Err(ProxyError::Protocol("no transaction to bind".into()));
        };
        if let Some(bound) = &txn.shards {
            if shards.is_subset(bound) {
                return Ok(());
            }
            let shard_count = self.cluster.router.shard_count();
            return Err(ProxyError::CrossShardTransaction {
                bound: ShardTarget::from_set(bound.clone(), shard_count).to_string(),
                requested: ShardTarget::from_set(shards.clone(), shard_count).to_string(),
            });
        }

        let mut conns = self.checkout_all(shards, role).await?;
        let mut setup = vec![txn.begin.clone()];
        setup.extend(txn.pending.iter().cloned());
        if let Err(err) = broadcast(&mut conns, &setup).await {
            rollback_and_release(conns).await;
            return Err(err);
        }
        let served = if conns.values().all(|c| c.role() == Role::Primary) {
            Role::Primary
        } else {
            role
        };
        debug!(cluster = %self.cluster.name, ?shards, role = %served, "transaction bound");
        self.conns = conns;
        if let Some(txn) = self.txn.as_mut() {
            txn.shards = Some(shards.clone());
            txn.role = Some(served);
            txn.pending.clear();
        }
        Ok(())
    }

    async fn dispatch(&mut self, work: Vec<(ShardId, Query)>, analysis: &Analysis) -> Result<QueryResult, ProxyError> {
        if let [(shard, query)] = work.as_slice() {
            let conn = self.conns.get_mut(shard).ok_or_else(|| {
                ProxyError::Protocol(format!("no connection bound for shard {shard}"))
            })?;
            return conn.execute(query).await;
        }
        let results = aggregator::dispatch(&mut self.conns, &work).await;
        aggregator::collect(results, &analysis.order_by, analysis.aggregate.as_ref())
    }

    /// A statement outside any transaction block. Writes spanning shards run
    /// inside BEGIN/COMMIT on every shard, rolled back everywhere on failure.
    async fn autocommit(&self, work: Vec<(ShardId, Query)>, role: Role, analysis: &Analysis) -> Result<QueryResult, ProxyError> {
        if let [(shard, query)] = work.as_slice() {
            return self.standalone(*shard, role, query).await;
        }
        let shards: BTreeSet<ShardId> = work.iter().map(|(s, _)| *s).collect();
        let mut conns = self.checkout_all(&shards, role).await?;
        let implicit = analysis.kind == StatementKind::Write;
        if implicit {
            if let Err(err) = broadcast(&mut conns, &[Query::simple("BEGIN")]).await {
                rollback_and_release(conns).await;
                return Err(err);
            }
        }
        let results = aggregator::dispatch(&mut conns, &work).await;
        let merged = aggregator::collect(results, &analysis.order_by, analysis.aggregate.as_ref());
        if !implicit {
            let outcome = match &merged {
                Err(err) if err.is_connection_error() => Outcome::Broken,
                _ => Outcome::Clean,
            };
            release_all(conns, outcome);
            return merged;
        }
        match merged {
            Ok(result) => match broadcast(&mut conns, &[Query::simple("COMMIT")]).await {
                Ok(()) => {
                    release_all(conns, Outcome::Clean);
                    counter!("pgshard_transactions_total", "outcome" => "committed").increment(1);
                    Ok(result)
                }
                Err(err) => {
                    warn!(error = %err, "cross-shard commit failed; shards may disagree");
                    rollback_and_release(conns).await;
                    Err(err)
                }
            },
            Err(err) => {
                rollback_and_release(conns).await;
                counter!("pgshard_transactions_total", "outcome" => "aborted").increment(1);
                Err(err)
            }
        }
    }

    /// Parameter and row shapes of a statement, asked of a backend.
    pub async fn describe(&mut self, analysis: &Analysis, sql: &str, param_oids: &[i32]) -> Result<Description, ProxyError> {
        if self.txn.as_ref().is_some_and(|t| t.failed) {
            return Err(ProxyError::TransactionAborted);
        }
        if let Some(conn) = self.conns.values_mut().next() {
            return conn.describe(sql, param_oids).await;
        }
        let role = self
            .cluster
            .splitter
            .classify(&self.roles(), analysis)
            .unwrap_or(Role::Primary);
        let shard = analysis
            .hint
            .filter(|shard| *shard < self.cluster.router.shard_count())
            .unwrap_or_else(|| self.cluster.router.any_shard());
        let mut conn = self.checkout(shard, role).await?;
        let result = conn.describe(sql, param_oids).await;
        conn.release(outcome_of(&result));
        result
    }

    /// Open `COPY ... FROM STDIN` on every shard the rows may go to.
    pub async fn copy_start(&mut self, routed: &Routed) -> Result<CopyStart, ProxyError> {
        let result = self.open_copy(routed).await;
        if let Err(err) = &result {
            self.abort_on(err).await;
        }
        result
    }

    async fn open_copy(&mut self, routed: &Routed) -> Result<CopyStart, ProxyError> {
        if self.txn.as_ref().is_some_and(|t| t.failed) {
            return Err(ProxyError::TransactionAborted);
        }
        let analysis = routed.analysis.as_ref();
        let copy = analysis
            .copy
            .as_ref()
            .ok_or_else(|| ProxyError::Protocol("not a COPY statement".into()))?;
        if !copy.from_stdin {
            return Err(ProxyError::NotSupported("COPY TO STDOUT".into()));
        }
        let role = self.cluster.splitter.classify(&self.roles(), analysis)?;
        let router = &self.cluster.router;
        let shard_count = router.shard_count();
        let (key, shards) = match analysis.hint {
            Some(shard) if shard < shard_count => (None, BTreeSet::from([shard])),
            Some(shard) => {
                return Err(ProxyError::Protocol(format!(
                    "shard hint {shard} is out of range, cluster has {shard_count} shards"
                )))
            }
            None if shard_count == 1 => (None, BTreeSet::from([0])),
            None => {
                let key = router.copy_key(copy)?.map(|(index, func)| (index, func.clone()));
                (key, (0..shard_count).collect())
            }
        };
        let splitter = CopySplitter::new(copy, key, shards.iter().copied().collect())?;

        let autocommit = self.txn.is_none();
        let implicit = autocommit && shards.len() > 1;
        if autocommit {
            let mut conns = self.checkout_all(&shards, role).await?;
            if implicit {
                if let Err(err) = broadcast(&mut conns, &[Query::simple("BEGIN")]).await {
                    rollback_and_release(conns).await;
                    return Err(err);
                }
            }
            self.conns = conns;
        } else {
            self.bind(&shards, role).await?;
        }

        let sql = &routed.query.sql;
        let opened = join_all(
            self.conns
                .iter_mut()
                .filter(|(shard, _)| shards.contains(*shard))
                .map(|(_, conn)| async move { conn.copy_in(sql).await }),
        )
        .await;
        if let Some(err) = opened.into_iter().find_map(Result::err) {
            self.copy = Some(ActiveCopy {
                splitter,
                autocommit,
                implicit,
            });
            self.abandon_copy("COPY could not start on every shard").await;
            return Err(err);
        }
        debug!(table = %copy.table, ?shards, "COPY started");
        self.copy = Some(ActiveCopy {
            splitter,
            autocommit,
            implicit,
        });
        Ok(CopyStart {
            binary: copy.format == pgshard_router::statement::CopyFormat::Binary,
            columns: copy.columns.len(),
        })
    }

    pub async fn copy_data(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        let Some(copy) = self.copy.as_mut() else {
            return Err(ProxyError::Protocol("no COPY in progress".into()));
        };
        let batches = match copy.splitter.feed(data) {
            Ok(batches) => batches,
            Err(err) => {
                self.abandon_copy(&err.to_string()).await;
                return Err(err);
            }
        };
        if let Err(err) = send_batches(&mut self.conns, batches).await {
            self.abandon_copy(&err.to_string()).await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn copy_done(&mut self) -> Result<QueryResult, ProxyError> {
        let Some(copy) = self.copy.as_mut() else {
            return Err(ProxyError::Protocol("no COPY in progress".into()));
        };
        let tail = match copy.splitter.finish() {
            Ok(tail) => tail,
            Err(err) => {
                self.abandon_copy(&err.to_string()).await;
                return Err(err);
            }
        };
        if let Err(err) = send_batches(&mut self.conns, tail).await {
            self.abandon_copy(&err.to_string()).await;
            return Err(err);
        }
        let Some(copy) = self.copy.take() else {
            return Err(ProxyError::Protocol("no COPY in progress".into()));
        };
        let targets: BTreeSet<ShardId> = copy.splitter.targets().iter().copied().collect();
        let results = join_all(
            self.conns
                .iter_mut()
                .filter(|(shard, _)| targets.contains(*shard))
                .map(|(shard, conn)| async move { (*shard, conn.copy_done().await) }),
        )
        .await;
        let merged = aggregator::collect(results, &[], None);
        counter!("pgshard_copy_rows_total").increment(copy.splitter.rows());

        match (&merged, copy.autocommit) {
            (Err(err), false) => {
                self.abort_on(err).await;
            }
            (Err(_), true) => {
                rollback_and_release(std::mem::take(&mut self.conns)).await;
            }
            (Ok(_), true) if copy.implicit => {
                let mut conns = std::mem::take(&mut self.conns);
                if let Err(err) = broadcast(&mut conns, &[Query::simple("COMMIT")]).await {
                    rollback_and_release(conns).await;
                    return Err(err);
                }
                release_all(conns, Outcome::Clean);
            }
            (Ok(_), true) => release_all(std::mem::take(&mut self.conns), Outcome::Clean),
            (Ok(_), false) => {}
        }
        merged
    }

    /// The client sent CopyFail.
    pub async fn copy_fail(&mut self, message: &str) -> ProxyError {
        self.abandon_copy(message).await;
        ProxyError::Backend(BackendError::new(
            "57014",
            format!("COPY from stdin failed: {message}"),
        ))
    }

    async fn abandon_copy(&mut self, reason: &str) {
        let Some(copy) = self.copy.take() else {
            return;
        };
        copy_fail_all(&mut self.conns, reason).await;
        if copy.autocommit {
            rollback_and_release(std::mem::take(&mut self.conns)).await;
        } else {
            let err = ProxyError::Backend(BackendError::new("57014", reason));
            self.abort_on(&err).await;
        }
    }
}

fn outcome_of<T>(result: &Result<T, ProxyError>) -> Outcome {
    match result {
        Err(err) if err.is_connection_error() => Outcome::Broken,
        _ => Outcome::Clean,
    }
}

fn release_all(conns: BTreeMap<ShardId, Guard>, outcome: Outcome) {
    for (_, conn) in conns {
        conn.release(outcome);
    }
}

/// Run `queries` in order on every connection; first failure wins.
async fn broadcast(conns: &mut BTreeMap<ShardId, Guard>, queries: &[Query]) -> Result<(), ProxyError> {
    let results = join_all(conns.values_mut().map(|conn| async move {
        for query in queries {
            conn.execute(query).await?;
        }
        Ok::<(), ProxyError>(())
    }))
    .await;
    results.into_iter().collect()
}

async fn rollback_and_release(mut conns: BTreeMap<ShardId, Guard>) {
    let rollback = Query::simple("ROLLBACK");
    let results = join_all(conns.values_mut().map(|conn| {
        let rollback = &rollback;
        async move {
            match conn.execute(rollback).await {
                Ok(_) => Outcome::Clean,
                Err(err) if err.is_connection_error() => Outcome::Broken,
                Err(_) => Outcome::Clean,
            }
        }
    }))
    .await;
    for ((_, conn), outcome) in conns.into_iter().zip(results) {
        conn.release(outcome);
    }
}

async fn copy_fail_all(conns: &mut BTreeMap<ShardId, Guard>, reason: &str) {
    join_all(
        conns
            .values_mut()
            .filter(|conn| conn.in_copy())
            .map(|conn| async move {
                let _ = conn.copy_fail(reason).await;
            }),
    )
    .await;
}

async fn send_batches(conns: &mut BTreeMap<ShardId, Guard>, batches: BTreeMap<ShardId, Vec<u8>>) -> Result<(), ProxyError> {
    let results = join_all(conns.iter_mut().filter_map(|(shard, conn)| {
        let data = batches.get(shard)?;
        Some(async move { conn.copy_data(data).await })
    }))
    .await;
    results.into_iter().collect()
}
