//! Dialect Shim
//!
//! Validated SQL is T-SQL. SQLite and PostgreSQL have no `TOP` and do not
//! share its paging or quoting, so before a query reaches them it is parsed,
//! rewritten on the AST and rendered again:
//!
//! - `SELECT TOP n` becomes `LIMIT n` on the query that owns the `SELECT`
//! - a capped branch of a set operation becomes a derived table with its own `LIMIT`
//! - `OFFSET m ROWS FETCH NEXT n ROWS ONLY` becomes `LIMIT n OFFSET m`
//! - `[name]` becomes `"name"`

use sqlparser::ast::{
    Expr, Ident, ObjectName, OffsetRows, Query, Select, SelectItem, SetExpr, Statement, TableFactor, VisitMut,
    VisitorMut,
};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::{Parser, ParserError};
use std::ops::ControlFlow;
use tracing::{debug, warn};

/// Alias of the derived table that carries a branch's `LIMIT`
const BRANCH_ALIAS: &str = "capped_branch";

/// Rewrite T-SQL row limits and quoting for engines without `TOP`.
///
/// Text that does not parse is returned unchanged and left for the engine to
/// reject.
pub fn top_to_limit(sql: &str) -> String {
    match rewrite(sql) {
        Ok(rewritten) => rewritten,
        Err(err) => {
            warn!(error = %err, "Dialect shim could not parse query, sending it unchanged");
            sql.to_string()
        }
    }
}

fn rewrite(sql: &str) -> Result<String, ParserError> {
    let mut statements = Parser::parse_sql(&MsSqlDialect {}, sql)?;
    for statement in &mut statements {
        let _ = statement.visit(&mut LimitRewriter);
    }
    Ok(statements
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; "))
}

fn parse_query(sql: &str) -> Result<Box<Query>, ParserError> {
    match Parser::parse_sql(&MsSqlDialect {}, sql)?.pop() {
        Some(Statement::Query(query)) => Ok(query),
        _ => Err(ParserError::ParserError(format!("not a query: {}", sql))),
    }
}

/// Visits every query that can own a `SELECT`: the statement itself, derived
/// tables and subquery expressions. CTEs and parenthesised branches are
/// reached through [`limit_query`].
struct LimitRewriter;

impl VisitorMut for LimitRewriter {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &mut Statement) -> ControlFlow<Self::Break> {
        if let Statement::Query(query) = statement {
            limit_query(query);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &mut TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Derived { subquery, alias, .. } => {
                limit_query(subquery);
                if let Some(alias) = alias {
                    requote(&mut alias.name);
                }
            }
            TableFactor::Table { alias: Some(alias), .. } => requote(&mut alias.name),
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &mut ObjectName) -> ControlFlow<Self::Break> {
        relation.0.iter_mut().for_each(requote);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => requote(ident),
            Expr::CompoundIdentifier(idents) => idents.iter_mut().for_each(requote),
            Expr::Subquery(query)
            | Expr::ArraySubquery(query)
            | Expr::InSubquery { subquery: query, .. }
            | Expr::Exists { subquery: query, .. } => limit_query(query),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn requote(ident: &mut Ident) {
    if ident.quote_style == Some('[') {
        ident.quote_style = Some('"');
    }
}

fn requote_projection(select: &mut Select) {
    for item in &mut select.projection {
        match item {
            SelectItem::ExprWithAlias { alias, .. } => requote(alias),
            SelectItem::QualifiedWildcard(name, _) => name.0.iter_mut().for_each(requote),
            _ => {}
        }
    }
}

/// `TOP n` without `PERCENT`, removed from the `SELECT`. `WITH TIES` has no
/// `LIMIT` form and is dropped with it.
fn take_top(select: &mut Select) -> Option<Expr> {
    if select.top.as_ref().map(|top| top.percent).unwrap_or(false) {
        return None;
    }
    select.top.take().and_then(|top| top.quantity)
}

fn limit_query(query: &mut Query) {
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            requote(&mut cte.alias.name);
            limit_query(&mut cte.query);
        }
    }

    match &mut *query.body {
        SetExpr::Select(select) => {
            requote_projection(select);
            if let Some(count) = take_top(select) {
                query.limit.get_or_insert(count);
            }
        }
        body => limit_branches(body),
    }

    let plain_fetch = matches!(
        &query.fetch,
        Some(fetch) if fetch.quantity.is_some() && !fetch.percent && !fetch.with_ties
    );
    if plain_fetch && query.limit.is_none() {
        query.limit = query.fetch.take().and_then(|fetch| fetch.quantity);
        if let Some(offset) = &mut query.offset {
            offset.rows = OffsetRows::None;
        }
    }
}

fn limit_branches(body: &mut SetExpr) {
    match body {
        SetExpr::SetOperation { left, right, .. } => {
            limit_branch(left);
            limit_branch(right);
        }
        SetExpr::Query(query) => limit_query(query),
        SetExpr::Select(select) => requote_projection(select),
        _ => {}
    }
}

/// A bare `SELECT` inside a set operation cannot carry a `LIMIT`, so a capped
/// one becomes `SELECT * FROM (<select> LIMIT n) AS capped_branch`.
fn limit_branch(branch: &mut SetExpr) {
    let SetExpr::Select(select) = &mut *branch else {
        return limit_branches(branch);
    };
    requote_projection(select);
    let mut capped = select.clone();
    let Some(count) = take_top(&mut capped) else {
        return;
    };
    let wrapped = format!("SELECT * FROM ({} LIMIT {}) AS {}", capped, count, BRANCH_ALIAS);
    match parse_query(&wrapped) {
        Ok(query) => *branch = *query.body,
        Err(err) => debug!(error = %err, branch = %wrapped, "Capped branch left as TOP"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_level_top() {
        assert_eq!(
            top_to_limit("SELECT TOP 5 Product_Name, Price FROM Products ORDER BY Price DESC"),
            "SELECT Product_Name, Price FROM Products ORDER BY Price DESC LIMIT 5"
        );
        assert_eq!(
            top_to_limit("SELECT DISTINCT TOP (3) Product_Name FROM Products"),
            "SELECT DISTINCT Product_Name FROM Products LIMIT 3"
        );
    }

    #[test]
    fn test_subqueries_keep_their_own_limits() {
        assert_eq!(
            top_to_limit("SELECT TOP 1001 * FROM (SELECT TOP 10 * FROM Products ORDER BY Price) AS p"),
            "SELECT * FROM (SELECT * FROM Products ORDER BY Price LIMIT 10) AS p LIMIT 1001"
        );
        assert_eq!(
            top_to_limit("SELECT TOP 1001 Product_Name FROM Products WHERE Price > (SELECT TOP 1 Price FROM Products ORDER BY Price)"),
            "SELECT Product_Name FROM Products WHERE Price > (SELECT Price FROM Products ORDER BY Price LIMIT 1) LIMIT 1001"
        );
    }

    #[test]
    fn test_union_branches_are_limited_separately() {
        assert_eq!(
            top_to_limit("SELECT TOP 1001 a FROM t UNION ALL SELECT TOP 3 a FROM u"),
            "SELECT * FROM (SELECT a FROM t LIMIT 1001) AS capped_branch UNION ALL \
             SELECT * FROM (SELECT a FROM u LIMIT 3) AS capped_branch"
        );
    }

    #[test]
    fn test_fetch_paging_becomes_limit_offset() {
        assert_eq!(
            top_to_limit("SELECT Product_Name FROM Products ORDER BY Price OFFSET 5 ROWS FETCH NEXT 10 ROWS ONLY"),
            "SELECT Product_Name FROM Products ORDER BY Price LIMIT 10 OFFSET 5"
        );
    }

    #[test]
    fn test_brackets_become_double_quotes() {
        assert_eq!(
            top_to_limit("SELECT TOP 3 [p].[Product_Name] AS [Name] FROM [dbo].[Products] AS [p]"),
            "SELECT \"p\".\"Product_Name\" AS \"Name\" FROM \"dbo\".\"Products\" AS \"p\" LIMIT 3"
        );
    }

    #[test]
    fn test_queries_without_top_pass_through() {
        let sql = "SELECT name FROM sqlite_master WHERE name = 'TOP 5'";
        assert_eq!(top_to_limit(sql), sql);
        let limited = "SELECT a FROM t LIMIT 10";
        assert_eq!(top_to_limit(limited), limited);
        let broken = "SELECT a FROM (";
        assert_eq!(top_to_limit(broken), broken);
    }
}
