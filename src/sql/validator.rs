//! SQL Safety Validator
//!
//! Static gate between generated SQL and the database. Checks run in a fixed
//! order and stop at the first failure:
//!
//! 1. a single `SELECT` (or `WITH ... SELECT`) with no forbidden vocabulary
//! 2. every referenced table is in the schema snapshot
//! 3. an explicit row limit is present, or one is synthesized
//! 4. no residual syntax anomaly (quoting, parentheses, parse failure)
//!
//! The output is a [`ValidatedQuery`], the only thing the executor accepts.

use super::lexer::{tokenize, Span, Token};
use crate::schema::SchemaSnapshot;
use serde::Serialize;
use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, TableFactor, Visit, Visitor};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token as SqlToken;
use std::ops::ControlFlow;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

const FORBIDDEN_WORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "MERGE", "EXEC",
    "EXECUTE", "GRANT", "REVOKE", "DENY", "INTO", "DECLARE", "SET", "USE", "WAITFOR", "SHUTDOWN",
    "DBCC", "BACKUP", "RESTORE", "BULK", "OPENROWSET", "OPENQUERY", "OPENDATASOURCE", "OPENXML",
    "KILL", "RECONFIGURE", "ATTACH", "DETACH", "PRAGMA",
];

const FORBIDDEN_PREFIXES: &[&str] = &["xp_", "sp_"];

const SET_OPERATORS: &[&str] = &["UNION", "EXCEPT", "INTERSECT"];

/// Why a candidate was refused. Reported verbatim to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum RejectionReason {
    #[error("forbidden operation: {detail}")]
    ForbiddenOperation { detail: String },

    #[error("unknown table: {}", unknown_table_detail(.table))]
    UnknownTable { table: Option<String> },

    #[error("malformed query: {detail}")]
    MalformedQuery { detail: String },
}

fn unknown_table_detail(table: &Option<String>) -> String {
    match table {
        Some(name) => format!("'{}' is not in the schema", name),
        None => "query references no table from the schema".to_string(),
    }
}

impl RejectionReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::ForbiddenOperation { .. } => "ForbiddenOperation",
            RejectionReason::UnknownTable { .. } => "UnknownTable",
            RejectionReason::MalformedQuery { .. } => "MalformedQuery",
        }
    }

    fn forbidden(detail: impl Into<String>) -> Self {
        RejectionReason::ForbiddenOperation { detail: detail.into() }
    }

    fn malformed(detail: impl Into<String>) -> Self {
        RejectionReason::MalformedQuery { detail: detail.into() }
    }
}

/// Row-limit literal in the validated text
#[derive(Debug, Clone, PartialEq, Eq)]
struct LimitLiteral {
    span: Span,
    value: u64,
}

/// SQL that passed every check, with its enforced row cap.
///
/// Only [`SqlSafetyValidator::validate`] builds one. Validating `sql()` again
/// with the same validator yields an equal value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedQuery {
    sql: String,
    row_cap: usize,
    #[serde(skip)]
    max_rows: usize,
    #[serde(skip)]
    limits: Vec<LimitLiteral>,
}

impl ValidatedQuery {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Most rows a caller will ever receive for this query.
    pub fn row_cap(&self) -> usize {
        self.row_cap
    }

    /// Text sent to the engine. Limits at or above the policy cap are raised
    /// to `cap + 1` so the executor can tell a full page from a truncated one.
    pub(crate) fn execution_sql(&self) -> String {
        let over_cap = (self.max_rows as u64).saturating_add(1).to_string();
        let mut sql = self.sql.clone();
        for limit in self.limits.iter().rev() {
            if limit.value >= self.max_rows as u64 {
                sql.replace_range(limit.span.start..limit.span.end, &over_cap);
            }
        }
        sql
    }
}

#[derive(Default)]
struct RelationCollector {
    ctes: Vec<String>,
    relations: Vec<Vec<String>>,
}

impl RelationCollector {
    /// CTE names declared by `query`, its set-operation branches and its CTE bodies.
    fn collect_ctes(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.push(cte.alias.name.value.clone());
                self.collect_ctes(&cte.query);
            }
        }
        self.collect_branch_ctes(&query.body);
    }

    fn collect_branch_ctes(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Query(query) => self.collect_ctes(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_branch_ctes(left);
                self.collect_branch_ctes(right);
            }
            _ => {}
        }
    }
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        if let Statement::Query(query) = statement {
            self.collect_ctes(query);
        }
        ControlFlow::Continue(())
    }

    // Subqueries may declare their own WITH
    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Derived { subquery, .. } = table_factor {
            self.collect_ctes(subquery);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Subquery(subquery) | Expr::ArraySubquery(subquery) => self.collect_ctes(subquery),
            Expr::InSubquery { subquery, .. } | Expr::Exists { subquery, .. } => self.collect_ctes(subquery),
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations
            .push(relation.0.iter().map(|ident| ident.value.clone()).collect());
        ControlFlow::Continue(())
    }
}

/// Explicit limits found on the main statement
struct LimitScan {
    /// Insert points for branches without a `TOP`
    missing_top: Vec<usize>,
    literals: Vec<LimitLiteral>,
    branch_count: usize,
    /// `TOP` value when the statement has exactly one branch
    single_top: Option<u64>,
    /// Trailing `LIMIT n` / `FETCH FIRST n ROWS ONLY` value
    statement_limit: Option<u64>,
}

pub struct SqlSafetyValidator {
    schema: Arc<SchemaSnapshot>,
    max_rows: usize,
}

impl SqlSafetyValidator {
    pub fn new(schema: Arc<SchemaSnapshot>, max_rows: usize) -> Self {
        Self {
            schema,
            max_rows: max_rows.max(1),
        }
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn validate(&self, candidate: &str) -> Result<ValidatedQuery, RejectionReason> {
        debug!(candidate = %candidate, "Validating SQL candidate");
        let result = self.check(candidate);
        match &result {
            Ok(query) => info!(row_cap = query.row_cap, rewritten = query.sql != candidate.trim(), "SQL accepted"),
            Err(reason) => info!(code = reason.code(), reason = %reason, "SQL rejected"),
        }
        result
    }

    fn check(&self, candidate: &str) -> Result<ValidatedQuery, RejectionReason> {
        // Step 1: single read-only SELECT
        let raw = tokenize(candidate);
        let statements = raw.statements();
        match statements.len() {
            0 => return Err(RejectionReason::forbidden("no SQL statement found")),
            1 => {}
            n => return Err(RejectionReason::forbidden(format!("{} statements found, only one SELECT is allowed", n))),
        }
        check_vocabulary(statements[0])?;
        main_select_index(statements[0])?;

        let cleaned = clean(candidate, &raw.comments);
        let lexed = tokenize(&cleaned);
        let tokens = &lexed.tokens;
        let main_start = main_select_index(tokens)?;

        // Step 2: table references
        let parsed = parse_single(&cleaned);
        let (relations, ctes) = match &parsed {
            Ok(statement) => {
                let mut collector = RelationCollector::default();
                let _ = statement.visit(&mut collector);
                (collector.relations, collector.ctes)
            }
            Err(_) => scan_relations(tokens, main_start),
        };
        self.check_tables(&relations, &ctes)?;

        // Step 3: row limit
        let scan = scan_limits(tokens, main_start)?;
        let cap = self.max_rows;
        let (sql, literals) = if scan.statement_limit.is_none() && !scan.missing_top.is_empty() {
            insert_caps(&cleaned, &scan, cap)
        } else {
            (cleaned.clone(), scan.literals.clone())
        };
        let row_cap = match (scan.statement_limit, scan.single_top) {
            (Some(n), _) => clamp(n, cap),
            (None, Some(n)) if scan.branch_count == 1 => clamp(n, cap),
            _ => cap,
        };

        // Step 4: residual anomalies
        if let Some(anomaly) = raw.anomalies.first().or_else(|| lexed.anomalies.first()) {
            return Err(RejectionReason::malformed(anomaly.to_string()));
        }
        check_parentheses(tokens)?;
        if let Err(err) = parsed {
            return Err(RejectionReason::malformed(err));
        }
        if sql != cleaned {
            parse_single(&sql).map_err(|err| RejectionReason::malformed(format!("row-capped query does not parse: {}", err)))?;
        }

        Ok(ValidatedQuery {
            sql,
            row_cap,
            max_rows: cap,
            limits: literals,
        })
    }

    fn check_tables(&self, relations: &[Vec<String>], ctes: &[String]) -> Result<(), RejectionReason> {
        let mut known = 0;
        for parts in relations {
            let is_cte = parts.len() == 1 && ctes.iter().any(|c| c.eq_ignore_ascii_case(&parts[0]));
            if is_cte {
                continue;
            }
            if self.schema.find_table(parts).is_none() {
                return Err(RejectionReason::UnknownTable {
                    table: Some(parts.join(".")),
                });
            }
            known += 1;
        }
        if known == 0 {
            return Err(RejectionReason::UnknownTable { table: None });
        }
        Ok(())
    }
}

/// Insert ` TOP {cap}` at every uncapped branch, moving existing literal spans
/// past the inserted text.
fn insert_caps(text: &str, scan: &LimitScan, cap: usize) -> (String, Vec<LimitLiteral>) {
    let insert = format!(" TOP {}", cap);
    let digits = cap.to_string().len();

    let mut literals: Vec<LimitLiteral> = scan
        .literals
        .iter()
        .map(|literal| {
            let shift = insert.len() * scan.missing_top.iter().filter(|&&at| at <= literal.span.start).count();
            LimitLiteral {
                span: Span {
                    start: literal.span.start + shift,
                    end: literal.span.end + shift,
                },
                value: literal.value,
            }
        })
        .collect();

    for (k, &at) in scan.missing_top.iter().enumerate() {
        let start = at + k * insert.len() + " TOP ".len();
        literals.push(LimitLiteral {
            span: Span {
                start,
                end: start + digits,
            },
            value: cap as u64,
        });
    }
    literals.sort_by_key(|literal| literal.span.start);

    let mut sql = text.to_string();
    for &at in scan.missing_top.iter().rev() {
        sql.insert_str(at, &insert);
    }
    (sql, literals)
}

fn clamp(n: u64, cap: usize) -> usize {
    usize::try_from(n).map(|n| n.min(cap)).unwrap_or(cap)
}

fn check_vocabulary(tokens: &[Token<'_>]) -> Result<(), RejectionReason> {
    for token in tokens.iter().filter(|t| t.is_word()) {
        let upper = token.text.to_ascii_uppercase();
        if FORBIDDEN_WORDS.contains(&upper.as_str()) {
            return Err(RejectionReason::forbidden(format!("'{}' is not allowed", upper)));
        }
        let lower = token.text.to_ascii_lowercase();
        if FORBIDDEN_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            return Err(RejectionReason::forbidden(format!("procedure '{}' is not allowed", token.text)));
        }
    }
    Ok(())
}

/// Index of the main statement's `SELECT`.
fn main_select_index(tokens: &[Token<'_>]) -> Result<usize, RejectionReason> {
    let first = tokens
        .first()
        .ok_or_else(|| RejectionReason::forbidden("no SQL statement found"))?;
    if first.is_keyword("SELECT") {
        return Ok(0);
    }
    if !first.is_keyword("WITH") {
        return Err(RejectionReason::forbidden(format!(
            "statement starts with '{}', only SELECT queries are allowed",
            first.text
        )));
    }

    let mut depth = 0i32;
    for (i, token) in tokens.iter().enumerate().skip(1) {
        match token.token {
            SqlToken::LParen => depth += 1,
            SqlToken::RParen => depth -= 1,
            _ if depth == 0 && token.is_keyword("SELECT") => return Ok(i),
            _ => {}
        }
    }
    Err(RejectionReason::forbidden("WITH clause is not followed by a SELECT"))
}

/// Remove comments and trailing semicolons; keep every other byte.
fn clean(candidate: &str, comments: &[Span]) -> String {
    let mut text = String::with_capacity(candidate.len());
    let mut cursor = 0;
    for span in comments {
        text.push_str(&candidate[cursor..span.start]);
        text.push(' ');
        cursor = span.end;
    }
    text.push_str(&candidate[cursor..]);

    let mut trimmed = text.trim();
    while let Some(rest) = trimmed.strip_suffix(';') {
        trimmed = rest.trim_end();
    }
    trimmed.to_string()
}

fn parse_single(sql: &str) -> Result<Statement, String> {
    let mut statements = Parser::parse_sql(&MsSqlDialect {}, sql).map_err(|e| e.to_string())?;
    if statements.len() != 1 {
        return Err(format!("expected one statement, parsed {}", statements.len()));
    }
    match statements.remove(0) {
        statement @ Statement::Query(_) => Ok(statement),
        other => Err(format!("not a query: {}", other)),
    }
}

/// Token-level table discovery, used when the parser gave up.
fn scan_relations(tokens: &[Token<'_>], main_start: usize) -> (Vec<Vec<String>>, Vec<String>) {
    let mut ctes = Vec::new();
    let mut depth = 0i32;
    for token in &tokens[..main_start] {
        match token.token {
            SqlToken::LParen => depth += 1,
            SqlToken::RParen => depth -= 1,
            _ if depth == 0
                && token.is_identifier()
                && !token.is_keyword("WITH")
                && !token.is_keyword("AS")
                && !token.is_keyword("RECURSIVE") =>
            {
                ctes.push(token.ident_value())
            }
            _ => {}
        }
    }

    let mut relations = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].is_keyword("FROM") || tokens[i].is_keyword("JOIN") {
            let mut parts = Vec::new();
            let mut j = i + 1;
            while let Some(token) = tokens.get(j) {
                if !token.is_identifier() {
                    break;
                }
                parts.push(token.ident_value());
                if tokens.get(j + 1).map(|t| t.token == SqlToken::Period).unwrap_or(false) {
                    j += 2;
                } else {
                    j += 1;
                    break;
                }
            }
            if !parts.is_empty() {
                relations.push(parts);
            }
            i = j.max(i + 1);
        } else {
            i += 1;
        }
    }
    (relations, ctes)
}

fn is_set_operator(token: &Token<'_>) -> bool {
    SET_OPERATORS.iter().any(|op| token.is_keyword(op))
}

/// Whether the `SELECT` at `index` heads a branch of the main statement: it is
/// the main `SELECT`, or follows a top-level set operator through any number
/// of opening parentheses.
fn is_branch_head(tokens: &[Token<'_>], index: usize, main_start: usize, depth: i32) -> bool {
    if index == main_start {
        return true;
    }
    let mut back = index;
    let mut parens = 0;
    while back > main_start {
        back -= 1;
        let token = &tokens[back];
        match token.token {
            SqlToken::LParen => parens += 1,
            _ if token.is_keyword("ALL") || token.is_keyword("DISTINCT") => {}
            _ => return is_set_operator(token) && depth - parens == 0,
        }
    }
    false
}

fn parse_limit_value(token: Option<&Token<'_>>, clause: &str) -> Result<(u64, Span), RejectionReason> {
    match token {
        Some(t) if t.number().is_some() => t
            .text
            .parse::<u64>()
            .map(|n| (n, t.span))
            .map_err(|_| RejectionReason::malformed(format!("{} needs a whole-number row count, got '{}'", clause, t.text))),
        Some(t) => Err(RejectionReason::malformed(format!("{} needs a literal row count, got '{}'", clause, t.text))),
        None => Err(RejectionReason::malformed(format!("{} is missing its row count", clause))),
    }
}

fn scan_limits(tokens: &[Token<'_>], main_start: usize) -> Result<LimitScan, RejectionReason> {
    let mut scan = LimitScan {
        missing_top: Vec::new(),
        literals: Vec::new(),
        branch_count: 0,
        single_top: None,
        statement_limit: None,
    };

    let mut depth = 0i32;
    let mut i = main_start;
    while i < tokens.len() {
        let token = &tokens[i];
        match token.token {
            SqlToken::LParen => depth += 1,
            SqlToken::RParen => depth -= 1,
            _ if token.is_keyword("SELECT") && is_branch_head(tokens, i, main_start, depth) => {
                scan.branch_count += 1;
                let mut after = i;
                if tokens
                    .get(i + 1)
                    .map(|t| t.is_keyword("DISTINCT") || t.is_keyword("ALL"))
                    .unwrap_or(false)
                {
                    after = i + 1;
                }
                let next = tokens.get(after + 1);
                if next.map(|t| t.is_keyword("TOP")).unwrap_or(false) {
                    let (value, span, end) = match tokens.get(after + 2) {
                        Some(t) if t.token == SqlToken::LParen => {
                            let (value, span) = parse_limit_value(tokens.get(after + 3), "TOP")?;
                            if tokens.get(after + 4).map(|t| t.token != SqlToken::RParen).unwrap_or(true) {
                                return Err(RejectionReason::malformed("TOP (n) needs a single literal row count"));
                            }
                            (value, span, after + 4)
                        }
                        other => {
                            let (value, span) = parse_limit_value(other, "TOP")?;
                            (value, span, after + 2)
                        }
                    };
                    if tokens.get(end + 1).map(|t| t.is_keyword("PERCENT")).unwrap_or(false) {
                        return Err(RejectionReason::malformed("TOP ... PERCENT is not supported"));
                    }
                    scan.literals.push(LimitLiteral { span, value });
                    scan.single_top = Some(value);
                    i = end + 1;
                    continue;
                }
                scan.missing_top.push(tokens[after].span.end);
            }
            _ if depth == 0 && token.is_keyword("LIMIT") => {
                let (value, span) = parse_limit_value(tokens.get(i + 1), "LIMIT")?;
                if tokens.get(i + 2).map(|t| t.token == SqlToken::Comma).unwrap_or(false) {
                    return Err(RejectionReason::malformed("LIMIT offset, count is not supported"));
                }
                scan.literals.push(LimitLiteral { span, value });
                scan.statement_limit = Some(value);
                i += 2;
                continue;
            }
            _ if depth == 0 && token.is_keyword("FETCH") => {
                let direction = tokens.get(i + 1);
                if !direction.map(|t| t.is_keyword("FIRST") || t.is_keyword("NEXT")).unwrap_or(false) {
                    return Err(RejectionReason::malformed("FETCH must be FETCH FIRST|NEXT n ROWS ONLY"));
                }
                let count = tokens.get(i + 2);
                let (value, literal, rows_at) = if count.map(|t| t.is_keyword("ROW") || t.is_keyword("ROWS")).unwrap_or(false) {
                    (1, None, i + 2)
                } else {
                    let (value, span) = parse_limit_value(count, "FETCH")?;
                    (value, Some(span), i + 3)
                };
                let rows_ok = tokens.get(rows_at).map(|t| t.is_keyword("ROW") || t.is_keyword("ROWS")).unwrap_or(false);
                let only_ok = tokens.get(rows_at + 1).map(|t| t.is_keyword("ONLY")).unwrap_or(false);
                if !rows_ok || !only_ok {
                    return Err(RejectionReason::malformed("FETCH must be FETCH FIRST|NEXT n ROWS ONLY"));
                }
                if let Some(span) = literal {
                    scan.literals.push(LimitLiteral { span, value });
                }
                scan.statement_limit = Some(value);
                i = rows_at + 2;
                continue;
            }
            _ => {}
        }
        i += 1;
    }

    if scan.branch_count != 1 {
        scan.single_top = None;
    }
    Ok(scan)
}

fn check_parentheses(tokens: &[Token<'_>]) -> Result<(), RejectionReason> {
    let mut depth = 0i32;
    for token in tokens {
        match token.token {
            SqlToken::LParen => depth += 1,
            SqlToken::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Err(RejectionReason::malformed(format!(
                        "unbalanced ')' at byte {}",
                        token.span.start
                    )));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(RejectionReason::malformed(format!("{} unclosed '('", depth)));
    }
    Ok(())
}
