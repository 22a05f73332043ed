use crate::parser::split_statements;
use crate::router::{Plan, ShardRouter};
use crate::statement::{analyze, Analysis};
use pgshard_core::{BackendError, ProxyError, Query};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// A statement with its analysis and where it has to run.
#[derive(Debug, Clone)]
pub struct Routed {
    pub analysis: Arc<Analysis>,
    pub query: Query,
    pub plan: Plan,
}

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub sql: String,
    pub param_oids: Vec<i32>,
    pub analysis: Arc<Analysis>,
}

#[derive(Debug, Clone)]
pub struct Portal {
    pub statement: String,
    pub routed: Routed,
}

/// Per-session view of prepared statements and portals.
///
/// Statements are analyzed once at Parse; the shard is decided at Bind, the
/// first point where parameter values are known.
pub struct BindingInterceptor {
    router: Arc<ShardRouter>,
    statements: HashMap<String, PreparedStatement>,
    portals: HashMap<String, Portal>,
}

impl BindingInterceptor {
    pub fn new(router: Arc<ShardRouter>) -> Self {
        Self {
            router,
            statements: HashMap::new(),
            portals: HashMap::new(),
        }
    }

    /// Analyze and route a simple Query. `None` for an empty query string.
    pub fn simple_query(&self, sql: &str) -> Result<Option<Routed>, ProxyError> {
        let statements = split_statements(sql);
        if statements.len() > 1 {
            return Err(ProxyError::MultiStatementRejected);
        }
        let Some(statement) = statements.first() else {
            return Ok(None);
        };
        let analysis = Arc::new(analyze(statement));
        let query = Query::simple(sql);
        let plan = self.router.plan(&analysis, &query)?;
        Ok(Some(Routed {
            analysis,
            query,
            plan,
        }))
    }

    pub fn parse(&mut self, name: &str, sql: &str, param_oids: Vec<i32>) -> Result<(), ProxyError> {
        let statements = split_statements(sql);
        if statements.len() > 1 {
            return Err(ProxyError::MultiStatementRejected);
        }
        if !name.is_empty() && self.statements.contains_key(name) {
            return Err(ProxyError::Backend(BackendError::new(
                "42P05",
                format!("prepared statement \"{name}\" already exists"),
            )));
        }
        let analysis = Arc::new(analyze(statements.first().copied().unwrap_or_default()));
        trace!(name, command = %analysis.command, "parsed statement");
        self.statements.insert(
            name.to_string(),
            PreparedStatement {
                sql: sql.to_string(),
                param_oids,
                analysis,
            },
        );
        Ok(())
    }

    pub fn bind(
        &mut self,
        portal: &str,
        statement: &str,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    ) -> Result<&Portal, ProxyError> {
        let prepared = self.statements.get(statement).ok_or_else(|| {
            ProxyError::Backend(BackendError::new(
                "26000",
                format!("prepared statement \"{statement}\" does not exist"),
            ))
        })?;
        let query = Query {
            sql: prepared.sql.clone(),
            params,
            param_formats,
            param_oids: prepared.param_oids.clone(),
            result_formats,
            extended: true,
        };
        let plan = self.router.plan(&prepared.analysis, &query)?;
        let bound = Portal {
            statement: statement.to_string(),
            routed: Routed {
                analysis: prepared.analysis.clone(),
                query,
                plan,
            },
        };
        self.portals.insert(portal.to_string(), bound);
        self.portal(portal).ok_or_else(|| {
            ProxyError::Protocol(format!("portal \"{portal}\" does not exist"))
        })
    }

    pub fn statement(&self, name: &str) -> Option<&PreparedStatement> {
        self.statements.get(name)
    }

    pub fn portal(&self, name: &str) -> Option<&Portal> {
        self.portals.get(name)
    }

    pub fn close_statement(&mut self, name: &str) {
        self.statements.remove(name);
    }

    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
    }

    /// Portals do not outlive the transaction that created them.
    pub fn clear_portals(&mut self) {
        self.portals.clear();
    }
}
