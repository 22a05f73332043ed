use crate::parser::{first_keyword, parse_sql, shard_hint, strip_comments};
use pgshard_core::ShardId;
use sqlparser::ast::{
    BinaryOperator, Expr, FromTable, GroupByExpr, ObjectName, Query, SelectItem, SetExpr,
    Statement, TableFactor, TableWithJoins, TransactionAccessMode, TransactionMode, UnaryOperator,
    Value, Visit, Visitor,
};
use std::ops::ControlFlow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
    Ddl,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Transaction control statements, handled by the session rather than routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Begin { access: Option<Access> },
    Commit,
    Rollback,
}

/// A value compared against a column: a literal, a `$n` parameter, or something else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    Literal(String),
    /// Zero-based parameter index.
    Param(usize),
    Null,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEnd {
    pub value: KeyValue,
    pub inclusive: bool,
}

/// The parts of a WHERE clause that can narrow a statement to some shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq {
        column: String,
        value: KeyValue,
    },
    In {
        column: String,
        values: Vec<KeyValue>,
    },
    Range {
        column: String,
        lower: Option<RangeEnd>,
        upper: Option<RangeEnd>,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderColumn {
    Name(String),
    /// One-based position in the select list.
    Position(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: OrderColumn,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertRows {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<KeyValue>>,
    pub returning: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateTarget {
    /// Zero-based position in the select list.
    pub column: usize,
    pub function: AggregateFunction,
}

/// Aggregates in a select list, merged row by row when the query spans shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub targets: Vec<AggregateTarget>,
    /// Zero-based select list positions of the GROUP BY columns.
    pub group_by: Vec<usize>,
    /// Set when per-shard results cannot be combined into the right answer.
    pub unsupported: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFormat {
    Text,
    Csv,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub from_stdin: bool,
    pub format: CopyFormat,
    pub delimiter: u8,
    pub header: bool,
    pub null: String,
}

/// What the router needs to know about one statement.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub kind: StatementKind,
    /// Command word as Postgres names it in errors and tags, e.g. `INSERT`.
    pub command: String,
    pub control: Option<Control>,
    pub tables: Vec<String>,
    pub filter: Filter,
    pub insert: Option<InsertRows>,
    pub order_by: Vec<OrderBy>,
    pub aggregate: Option<Aggregate>,
    /// Tables read by subqueries, derived tables and CTE bodies, which the
    /// WHERE clause of the outer statement does not narrow.
    pub nested_tables: Vec<String>,
    /// The write sits in a `WITH` clause; `tables`, `filter` and `insert` describe it.
    pub cte_write: bool,
    pub copy: Option<CopyStatement>,
    pub hint: Option<ShardId>,
    pub statement: Option<Statement>,
}

impl Analysis {
    fn keyword_only(command: String, kind: StatementKind) -> Self {
        Self {
            kind,
            command,
            control: None,
            tables: Vec::new(),
            filter: Filter::Unknown,
            insert: None,
            order_by: Vec::new(),
            aggregate: None,
            nested_tables: Vec::new(),
            cte_write: false,
            copy: None,
            hint: None,
            statement: None,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, StatementKind::Write | StatementKind::Ddl)
    }
}

/// Classify a single statement and pull out what routing needs.
pub fn analyze(sql: &str) -> Analysis {
    let command = first_keyword(sql);
    let hint = shard_hint(sql);
    let mut analysis = if command == "COPY" {
        let mut analysis = Analysis::keyword_only(command, StatementKind::Write);
        analysis.copy = parse_copy(sql);
        if let Some(copy) = &analysis.copy {
            analysis.tables.push(copy.table.clone());
            if !copy.from_stdin {
                analysis.kind = StatementKind::Read;
            }
        }
        analysis
    } else {
        match parse_sql(sql) {
            Ok(mut statements) if statements.len() == 1 => match statements.pop() {
                Some(statement) => from_statement(command, statement),
                None => classify_keyword(command, sql),
            },
            _ => classify_keyword(command, sql),
        }
    };
    analysis.hint = hint;
    analysis
}

fn from_statement(command: String, statement: Statement) -> Analysis {
    let mut analysis = Analysis::keyword_only(command, StatementKind::Other);
    match &statement {
        Statement::Query(query) => match modifying_part(query) {
            Some((cte, inner)) => {
                let inner = from_statement(first_keyword(&inner.to_string()), inner.clone());
                analysis.kind = StatementKind::Write;
                analysis.cte_write = cte.is_some();
                analysis.command = inner.command;
                analysis.tables = inner.tables;
                analysis.filter = inner.filter;
                analysis.insert = inner.insert;
                analysis.nested_tables = inner.nested_tables;
                // Whatever else the statement reads, outside the write itself.
                let ctes = cte_names(query);
                let mut others = Vec::new();
                if let Some(with) = &query.with {
                    for (index, entry) in with.cte_tables.iter().enumerate() {
                        if cte != Some(index) {
                            others.extend(relations_below(entry.query.as_ref(), 0));
                        }
                    }
                }
                if cte.is_some() {
                    others.extend(relations_below(query.body.as_ref(), 0));
                }
                for name in others {
                    if !analysis.nested_tables.contains(&name) {
                        analysis.nested_tables.push(name);
                    }
                }
                analysis
                    .nested_tables
                    .retain(|name| !ctes.iter().any(|cte| cte.eq_ignore_ascii_case(name)));
            }
            None => {
                analysis.kind = query_kind(query);
                collect_query(query, &mut analysis);
                analysis.order_by = order_by(query);
                analysis.aggregate = aggregate(query);
                analysis.nested_tables = relations_below(query.as_ref(), 2);
            }
        },
        Statement::Insert {
            table_name,
            columns,
            source,
            returning,
            ..
        } => {
            analysis.kind = StatementKind::Write;
            let table = object_name(table_name);
            analysis.tables.push(table.clone());
            let mut rows = Vec::new();
            let mut literal_rows = true;
            if let Some(source) = source {
                match source.body.as_ref() {
                    SetExpr::Values(values) => {
                        for row in &values.rows {
                            rows.push(row.iter().map(key_value).collect());
                        }
                    }
                    _ => {
                        literal_rows = false;
                        collect_query(source, &mut analysis);
                    }
                }
            }
            analysis.nested_tables = relations_below(&statement, 2);
            if literal_rows {
                analysis.insert = Some(InsertRows {
                    table,
                    columns: columns.iter().map(|c| c.value.clone()).collect(),
                    rows,
                    returning: returning.is_some(),
                });
            }
        }
        Statement::Update {
            table, selection, ..
        } => {
            analysis.kind = StatementKind::Write;
            collect_relation(table, &mut analysis.tables);
            analysis.filter = selection.as_ref().map(filter).unwrap_or(Filter::Unknown);
            analysis.nested_tables = relations_below(&statement, 1);
        }
        Statement::Delete {
            from, selection, ..
        } => {
            analysis.kind = StatementKind::Write;
            let relations = match from {
                FromTable::WithFromKeyword(relations) => relations,
                FromTable::WithoutKeyword(relations) => relations,
            };
            for relation in relations {
                collect_relation(relation, &mut analysis.tables);
            }
            analysis.filter = selection.as_ref().map(filter).unwrap_or(Filter::Unknown);
            analysis.nested_tables = relations_below(&statement, 1);
        }
        Statement::StartTransaction { modes, .. } => {
            analysis.control = Some(Control::Begin {
                access: access_mode(modes),
            });
        }
        Statement::Commit { .. } => analysis.control = Some(Control::Commit),
        Statement::Rollback {
            savepoint: None, ..
        } => analysis.control = Some(Control::Rollback),
        _ => {
            analysis.kind = keyword_kind(&analysis.command);
        }
    }
    analysis.statement = Some(statement);
    analysis
}

/// Fallback for statements the parser does not understand.
fn classify_keyword(command: String, sql: &str) -> Analysis {
    let upper = strip_comments(sql).to_ascii_uppercase();
    let mut kind = keyword_kind(&command);
    if command == "WITH"
        && upper
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .any(|word| matches!(word, "INSERT" | "UPDATE" | "DELETE" | "MERGE"))
    {
        kind = StatementKind::Write;
    }
    let mut analysis = Analysis::keyword_only(command, kind);
    analysis.control = match analysis.command.as_str() {
        "BEGIN" | "START" => Some(Control::Begin {
            access: if upper.contains("READ ONLY") {
                Some(Access::ReadOnly)
            } else if upper.contains("READ WRITE") {
                Some(Access::ReadWrite)
            } else {
                None
            },
        }),
        "COMMIT" | "END" => Some(Control::Commit),
        "ROLLBACK" | "ABORT" if !upper.contains(" TO ") => Some(Control::Rollback),
        _ => None,
    };
    if analysis.control.is_some() {
        analysis.kind = StatementKind::Other;
    }
    analysis
}

fn keyword_kind(command: &str) -> StatementKind {
    match command {
        "SELECT" | "SHOW" | "VALUES" | "TABLE" | "EXPLAIN" | "WITH" => StatementKind::Read,
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "COPY" | "TRUNCATE" | "CALL" | "LOCK" => {
            StatementKind::Write
        }
        "CREATE" | "ALTER" | "DROP" | "COMMENT" | "GRANT" | "REVOKE" | "REINDEX" | "VACUUM"
        | "ANALYZE" | "CLUSTER" => StatementKind::Ddl,
        _ => StatementKind::Other,
    }
}

fn query_kind(query: &Query) -> StatementKind {
    if !query.locks.is_empty() {
        return StatementKind::Write;
    }
    match query.body.as_ref() {
        SetExpr::Insert(_) | SetExpr::Update(_) => StatementKind::Write,
        _ => StatementKind::Read,
    }
}

/// The INSERT or UPDATE a query wraps: its own body (`WITH ... INSERT`), or
/// the first `WITH` entry that writes, with that entry's position.
fn modifying_part(query: &Query) -> Option<(Option<usize>, &Statement)> {
    if let SetExpr::Insert(statement) | SetExpr::Update(statement) = query.body.as_ref() {
        return Some((None, statement));
    }
    query
        .with
        .as_ref()?
        .cte_tables
        .iter()
        .enumerate()
        .find_map(|(index, cte)| match cte.query.body.as_ref() {
            SetExpr::Insert(statement) | SetExpr::Update(statement) => Some((Some(index), statement)),
            _ => None,
        })
}

fn cte_names(query: &Query) -> Vec<String> {
    query
        .with
        .iter()
        .flat_map(|with| with.cte_tables.iter().map(|cte| cte.alias.name.value.clone()))
        .collect()
}

/// Collects relations named at or below query level `from`, minus CTE names.
struct Relations {
    depth: usize,
    from: usize,
    found: Vec<String>,
    ctes: Vec<String>,
}

impl Visitor for Relations {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        self.depth += 1;
        self.ctes.extend(cte_names(query));
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<()> {
        self.depth = self.depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<()> {
        if self.depth >= self.from {
            let name = object_name(relation);
            if !self.found.contains(&name) {
                self.found.push(name);
            }
        }
        ControlFlow::Continue(())
    }
}

/// Relations of `node` at query nesting level `from` or deeper. A SELECT
/// names its own FROM list at level one, UPDATE and DELETE at level zero, so
/// `from` one past that yields what subqueries, derived tables and CTEs read.
fn relations_below<T: Visit>(node: &T, from: usize) -> Vec<String> {
    let mut visitor = Relations {
        depth: 0,
        from,
        found: Vec::new(),
        ctes: Vec::new(),
    };
    let _ = node.visit(&mut visitor);
    let Relations { found, ctes, .. } = visitor;
    found
        .into_iter()
        .filter(|name| !ctes.iter().any(|cte| cte.eq_ignore_ascii_case(name)))
        .collect()
}

const OTHER_AGGREGATES: &[&str] = &[
    "avg",
    "array_agg",
    "string_agg",
    "bool_and",
    "bool_or",
    "every",
    "bit_and",
    "bit_or",
    "stddev",
    "stddev_pop",
    "stddev_samp",
    "variance",
    "var_pop",
    "var_samp",
    "json_agg",
    "jsonb_agg",
    "json_object_agg",
    "jsonb_object_agg",
    "percentile_cont",
    "percentile_disc",
    "mode",
];

fn aggregate(query: &Query) -> Option<Aggregate> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let mut targets = Vec::new();
    let mut plain = Vec::new();
    let mut unsupported: Option<String> = None;
    for (column, item) in select.projection.iter().enumerate() {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => {
                plain.push(column);
                continue;
            }
        };
        match aggregate_call(expr) {
            Some(Ok(function)) => targets.push(AggregateTarget { column, function }),
            Some(Err(reason)) => {
                unsupported.get_or_insert(reason);
            }
            None => {
                let text = expr.to_string().to_ascii_uppercase();
                if ["COUNT(", "SUM(", "MIN(", "MAX(", "AVG("]
                    .iter()
                    .any(|call| text.contains(call))
                {
                    unsupported.get_or_insert_with(|| format!("aggregate inside {expr}"));
                }
                plain.push(column);
            }
        }
    }
    if targets.is_empty() && unsupported.is_none() {
        return None;
    }

    let mut group_by = Vec::new();
    match &select.group_by {
        GroupByExpr::Expressions(exprs) => {
            for expr in exprs {
                match group_position(expr, &select.projection) {
                    Some(position) => group_by.push(position),
                    None => {
                        unsupported.get_or_insert_with(|| format!("GROUP BY {expr} outside the select list"));
                    }
                }
            }
        }
        GroupByExpr::All => {
            unsupported.get_or_insert_with(|| "GROUP BY ALL".to_string());
        }
    }
    if plain.iter().any(|column| !group_by.contains(column)) {
        unsupported.get_or_insert_with(|| "ungrouped columns next to aggregates".to_string());
    }
    if select.having.is_some() {
        unsupported.get_or_insert_with(|| "HAVING".to_string());
    }
    if select.distinct.is_some() {
        unsupported.get_or_insert_with(|| "SELECT DISTINCT with aggregates".to_string());
    }
    Some(Aggregate {
        targets,
        group_by,
        unsupported,
    })
}

/// `Some(Ok(_))` for an aggregate that merges across shards, `Some(Err(_))`
/// for one that does not, `None` for anything else.
fn aggregate_call(expr: &Expr) -> Option<Result<AggregateFunction, String>> {
    let Expr::Function(function) = expr else {
        return None;
    };
    let name = function.name.to_string().to_ascii_lowercase();
    let merged = match name.as_str() {
        "count" => AggregateFunction::Count,
        "sum" => AggregateFunction::Sum,
        "min" => AggregateFunction::Min,
        "max" => AggregateFunction::Max,
        other if OTHER_AGGREGATES.contains(&other) => return Some(Err(other.to_string())),
        _ => return None,
    };
    let text = function.to_string().to_ascii_uppercase();
    if text.contains("DISTINCT") || text.contains(" OVER ") || text.contains(" OVER(") {
        return Some(Err(format!("{name} with DISTINCT or a window")));
    }
    Some(Ok(merged))
}

fn group_position(expr: &Expr, projection: &[SelectItem]) -> Option<usize> {
    if let Expr::Value(Value::Number(n, _)) = expr {
        return n
            .parse::<usize>()
            .ok()?
            .checked_sub(1)
            .filter(|position| *position < projection.len());
    }
    let name = column_name(expr)?;
    let same = |e: &Expr| column_name(e).is_some_and(|c| c.eq_ignore_ascii_case(&name));
    projection.iter().position(|item| match item {
        SelectItem::UnnamedExpr(e) => same(e),
        SelectItem::ExprWithAlias { expr: e, alias } => alias.value.eq_ignore_ascii_case(&name) || same(e),
        _ => false,
    })
}

fn access_mode(modes: &[TransactionMode]) -> Option<Access> {
    modes.iter().find_map(|mode| match mode {
        TransactionMode::AccessMode(TransactionAccessMode::ReadOnly) => Some(Access::ReadOnly),
        TransactionMode::AccessMode(TransactionAccessMode::ReadWrite) => Some(Access::ReadWrite),
        _ => None,
    })
}

fn collect_query(query: &Query, analysis: &mut Analysis) {
    collect_set_expr(query.body.as_ref(), analysis);
}

fn collect_set_expr(body: &SetExpr, analysis: &mut Analysis) {
    match body {
        SetExpr::Select(select) => {
            for relation in &select.from {
                collect_relation(relation, &mut analysis.tables);
            }
            if let Some(selection) = &select.selection {
                analysis.filter = filter(selection);
            }
        }
        SetExpr::Query(query) => collect_query(query, analysis),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, analysis);
            let left_filter = std::mem::replace(&mut analysis.filter, Filter::Unknown);
            collect_set_expr(right, analysis);
            let right_filter = std::mem::replace(&mut analysis.filter, Filter::Unknown);
            analysis.filter = Filter::Or(vec![left_filter, right_filter]);
        }
        _ => {}
    }
}

fn collect_relation(relation: &TableWithJoins, tables: &mut Vec<String>) {
    collect_factor(&relation.relation, tables);
    for join in &relation.joins {
        collect_factor(&join.relation, tables);
    }
}

fn collect_factor(factor: &TableFactor, tables: &mut Vec<String>) {
    if let TableFactor::Table { name, .. } = factor {
        let name = object_name(name);
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
}

fn order_by(query: &Query) -> Vec<OrderBy> {
    let mut out = Vec::new();
    for item in &query.order_by {
        let column = match &item.expr {
            Expr::Identifier(ident) => OrderColumn::Name(ident.value.clone()),
            Expr::CompoundIdentifier(parts) => match parts.last() {
                Some(part) => OrderColumn::Name(part.value.clone()),
                None => return Vec::new(),
            },
            Expr::Value(Value::Number(n, _)) => match n.parse::<usize>() {
                Ok(position) if position >= 1 => OrderColumn::Position(position),
                _ => return Vec::new(),
            },
            // Expressions cannot be matched to result columns; give up on merging.
            _ => return Vec::new(),
        };
        out.push(OrderBy {
            column,
            descending: item.asc == Some(false),
        });
    }
    out
}

/// Reduce a WHERE expression to the predicates that can select shards.
pub fn filter(expr: &Expr) -> Filter {
    match expr {
        Expr::Nested(inner) => filter(inner),
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => {
                let mut parts = Vec::new();
                for side in [left, right] {
                    match filter(side) {
                        Filter::And(inner) => parts.extend(inner),
                        other => parts.push(other),
                    }
                }
                Filter::And(parts)
            }
            BinaryOperator::Or => {
                let mut parts = Vec::new();
                for side in [left, right] {
                    match filter(side) {
                        Filter::Or(inner) => parts.extend(inner),
                        other => parts.push(other),
                    }
                }
                Filter::Or(parts)
            }
            BinaryOperator::Eq => match column_and_value(left, right) {
                Some((column, value, _)) => Filter::Eq { column, value },
                None => Filter::Unknown,
            },
            BinaryOperator::Gt | BinaryOperator::GtEq | BinaryOperator::Lt | BinaryOperator::LtEq => {
                match column_and_value(left, right) {
                    Some((column, value, flipped)) => {
                        let inclusive = matches!(op, BinaryOperator::GtEq | BinaryOperator::LtEq);
                        let greater = matches!(op, BinaryOperator::Gt | BinaryOperator::GtEq);
                        let end = Some(RangeEnd { value, inclusive });
                        // `5 < id` is a lower bound on id.
                        if greater != flipped {
                            Filter::Range {
                                column,
                                lower: end,
                                upper: None,
                            }
                        } else {
                            Filter::Range {
                                column,
                                lower: None,
                                upper: end,
                            }
                        }
                    }
                    None => Filter::Unknown,
                }
            }
            _ => Filter::Unknown,
        },
        Expr::InList {
            expr,
            list,
            negated: false,
        } => match column_name(expr) {
            Some(column) => Filter::In {
                column,
                values: list.iter().map(key_value).collect(),
            },
            None => Filter::Unknown,
        },
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => match column_name(expr) {
            Some(column) => Filter::Range {
                column,
                lower: Some(RangeEnd {
                    value: key_value(low),
                    inclusive: true,
                }),
                upper: Some(RangeEnd {
                    value: key_value(high),
                    inclusive: true,
                }),
            },
            None => Filter::Unknown,
        },
        _ => Filter::Unknown,
    }
}

/// `(column, value, flipped)` where `flipped` means the value was on the left.
fn column_and_value(left: &Expr, right: &Expr) -> Option<(String, KeyValue, bool)> {
    if let Some(column) = column_name(left) {
        let value = key_value(right);
        if value != KeyValue::Other {
            return Some((column, value, false));
        }
    }
    if let Some(column) = column_name(right) {
        let value = key_value(left);
        if value != KeyValue::Other {
            return Some((column, value, true));
        }
    }
    None
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.clone()),
        Expr::Nested(inner) => column_name(inner),
        _ => None,
    }
}

pub fn key_value(expr: &Expr) -> KeyValue {
    match expr {
        Expr::Value(Value::Number(n, _)) => KeyValue::Literal(n.clone()),
        Expr::Value(Value::SingleQuotedString(s)) => KeyValue::Literal(s.clone()),
        Expr::Value(Value::Placeholder(p)) => placeholder_index(p)
            .map(KeyValue::Param)
            .unwrap_or(KeyValue::Other),
        Expr::Value(Value::Null) => KeyValue::Null,
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(Value::Number(n, _)) => KeyValue::Literal(format!("-{n}")),
            _ => KeyValue::Other,
        },
        Expr::Cast { expr, .. } | Expr::Nested(expr) => key_value(expr),
        _ => KeyValue::Other,
    }
}

/// `$3` -> 2.
pub fn placeholder_index(placeholder: &str) -> Option<usize> {
    placeholder
        .strip_prefix('$')?
        .parse::<usize>()
        .ok()?
        .checked_sub(1)
}

pub fn object_name(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

/// Parse the header of a COPY statement:
/// `COPY table [(cols)] FROM STDIN [WITH] [(options) | legacy options]`.
pub fn parse_copy(sql: &str) -> Option<CopyStatement> {
    let tokens = copy_tokens(strip_comments(sql));
    let mut iter = tokens.iter().peekable();
    if !iter.next()?.eq_ignore_ascii_case("COPY") {
        return None;
    }
    let table = iter.next()?.clone();
    if table == "(" {
        return None;
    }
    let mut columns = Vec::new();
    if iter.peek().map(|t| t.as_str()) == Some("(") {
        iter.next();
        for token in iter.by_ref() {
            match token.as_str() {
                ")" => break,
                "," => {}
                name => columns.push(name.to_string()),
            }
        }
    }
    let direction = iter.next()?.to_ascii_uppercase();
    let source = iter.next()?.to_ascii_uppercase();
    let from_stdin = direction == "FROM" && source == "STDIN";

    let mut copy = CopyStatement {
        table,
        columns,
        from_stdin,
        format: CopyFormat::Text,
        delimiter: b'\t',
        header: false,
        null: "\\N".into(),
    };
    let rest: Vec<String> = iter
        .filter(|t| !matches!(t.as_str(), "(" | ")" | ","))
        .cloned()
        .collect();
    let mut i = 0;
    while i < rest.len() {
        let option = rest[i].to_ascii_uppercase();
        let value = rest.get(i + 1).cloned();
        match option.as_str() {
            "BINARY" => copy.format = CopyFormat::Binary,
            "CSV" => {
                copy.format = CopyFormat::Csv;
                copy.delimiter = b',';
                copy.null = String::new();
            }
            "FORMAT" => {
                if let Some(value) = value {
                    match value.to_ascii_uppercase().as_str() {
                        "CSV" => {
                            copy.format = CopyFormat::Csv;
                            copy.delimiter = b',';
                            copy.null = String::new();
                        }
                        "BINARY" => copy.format = CopyFormat::Binary,
                        _ => copy.format = CopyFormat::Text,
                    }
                    i += 1;
                }
            }
            "DELIMITER" => {
                if let Some(value) = value {
                    if let Some(byte) = value.bytes().next() {
                        copy.delimiter = byte;
                    }
                    i += 1;
                }
            }
            "NULL" => {
                if let Some(value) = value {
                    copy.null = value;
                    i += 1;
                }
            }
            "HEADER" => {
                match value.as_deref().map(|v| v.to_ascii_uppercase()) {
                    Some(v) if v == "FALSE" || v == "OFF" || v == "0" => {
                        copy.header = false;
                        i += 1;
                    }
                    Some(v) if v == "TRUE" || v == "ON" || v == "1" || v == "MATCH" => {
                        copy.header = true;
                        i += 1;
                    }
                    _ => copy.header = true,
                }
            }
            _ => {}
        }
        i += 1;
    }
    Some(copy)
}

/// Words, quoted strings (unquoted), and single punctuation characters.
fn copy_tokens(sql: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() || c == ';' => {}
            '(' | ')' | ',' => tokens.push(c.to_string()),
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                while let Some(next) = chars.next() {
                    if next == quote {
                        if chars.peek() == Some(&quote) {
                            chars.next();
                            value.push(quote);
                            continue;
                        }
                        break;
                    }
                    value.push(next);
                }
                tokens.push(unescape(&value));
            }
            'E' | 'e' if chars.peek() == Some(&'\'') => {}
            _ => {
                let mut word = c.to_string();
                while let Some(next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '(' | ')' | ',' | ';') {
                        break;
                    }
                    word.push(*next);
                    chars.next();
                }
                tokens.push(word);
            }
        }
    }
    tokens
}

fn unescape(value: &str) -> String {
    match value {
        "\\t" => "\t".into(),
        _ => value.to_string(),
    }
}
