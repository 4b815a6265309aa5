//! Label injection for PromQL expressions.
//!
//! Queries are parsed into an AST, every vector and matrix selector receives an additional label
//! matcher, and the AST is serialized back into query text. Queries are never patched textually.

use crate::{CLUSTER_LABEL, MANAGED_CLUSTER_LABEL_METRIC, NAME_LABEL};
use promql_parser::{
    label::{MatchOp, Matcher},
    parser::{self, Expr, VectorSelector},
};
use regex::Regex;

const METRIC_NAME: &str = "__name__";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse query: {0}")]
    Parse(String),

    #[error("invalid label matcher regex: {0}")]
    Regex(#[from] regex::Error),
}

/// Appends a matcher on `label` to every selector in `query`.
///
/// A single value produces an equality matcher and multiple values produce a regex matcher that
/// alternates over all of them. No values produces `label=""`, which selects nothing: a caller
/// without access gets an empty result rather than an error.
///
/// Existing matchers on the same label are left in place.
pub fn inject_label(query: &str, label: &str, values: &[String]) -> Result<String, Error> {
    let mut expr = parse(query)?;
    let matcher = matcher(label, values)?;
    visit_selectors_mut(&mut expr, &mut |vs| push_matcher(vs, &matcher));
    Ok(expr.to_string())
}

/// Appends a cluster matcher to every selector in `query`.
///
/// Selectors on the synthetic managed-cluster label metric identify clusters with the `name`
/// label; every other selector uses `cluster`. A query that joins the two kinds of series is
/// therefore filtered correctly on both sides.
pub fn inject_cluster_labels(query: &str, values: &[String]) -> Result<String, Error> {
    let mut expr = parse(query)?;
    let by_name = matcher(NAME_LABEL, values)?;
    let by_cluster = matcher(CLUSTER_LABEL, values)?;
    visit_selectors_mut(&mut expr, &mut |vs| {
        if metric_name(vs) == Some(MANAGED_CLUSTER_LABEL_METRIC) {
            push_matcher(vs, &by_name)
        } else {
            push_matcher(vs, &by_cluster)
        }
    });
    Ok(expr.to_string())
}

pub fn parse(query: &str) -> Result<Expr, Error> {
    parser::parse(query).map_err(Error::Parse)
}

/// Builds the matcher that restricts `label` to `values`.
pub fn matcher(label: &str, values: &[String]) -> Result<Matcher, Error> {
    match values {
        [] => Ok(Matcher::new(MatchOp::Equal, label, "")),
        [value] => Ok(Matcher::new(MatchOp::Equal, label, value)),
        values => {
            let pattern = values.join("|");
            let re = anchored(&pattern)?;
            Ok(Matcher::new(MatchOp::Re(re), label, &pattern))
        }
    }
}

/// Compiles a matcher pattern the way PromQL evaluates it: fully anchored.
pub fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// Returns the metric name a selector selects, if it names one.
pub fn metric_name(vs: &VectorSelector) -> Option<&str> {
    if let Some(name) = vs.name.as_deref() {
        return Some(name);
    }
    vs.matchers
        .matchers
        .iter()
        .find(|m| m.name == METRIC_NAME && matches!(m.op, MatchOp::Equal))
        .map(|m| m.value.as_str())
}

/// Calls `f` with every vector selector in `expr`. Matrix selectors are visited through their
/// embedded vector selector.
pub fn visit_selectors<'e>(expr: &'e Expr, f: &mut impl FnMut(&'e VectorSelector)) {
    match expr {
        Expr::Aggregate(agg) => {
            visit_selectors(&agg.expr, f);
            if let Some(param) = agg.param.as_deref() {
                visit_selectors(param, f);
            }
        }
        Expr::Unary(unary) => visit_selectors(&unary.expr, f),
        Expr::Binary(binary) => {
            visit_selectors(&binary.lhs, f);
            visit_selectors(&binary.rhs, f);
        }
        Expr::Paren(paren) => visit_selectors(&paren.expr, f),
        Expr::Subquery(subquery) => visit_selectors(&subquery.expr, f),
        Expr::VectorSelector(vs) => f(vs),
        Expr::MatrixSelector(ms) => f(&ms.vs),
        Expr::Call(call) => {
            for arg in &call.args.args {
                visit_selectors(arg, f);
            }
        }
        _ => {}
    }
}

fn visit_selectors_mut(expr: &mut Expr, f: &mut impl FnMut(&mut VectorSelector)) {
    match expr {
        Expr::Aggregate(agg) => {
            visit_selectors_mut(&mut agg.expr, f);
            if let Some(param) = agg.param.as_deref_mut() {
                visit_selectors_mut(param, f);
            }
        }
        Expr::Unary(unary) => visit_selectors_mut(&mut unary.expr, f),
        Expr::Binary(binary) => {
            visit_selectors_mut(&mut binary.lhs, f);
            visit_selectors_mut(&mut binary.rhs, f);
        }
        Expr::Paren(paren) => visit_selectors_mut(&mut paren.expr, f),
        Expr::Subquery(subquery) => visit_selectors_mut(&mut subquery.expr, f),
        Expr::VectorSelector(vs) => f(vs),
        Expr::MatrixSelector(ms) => f(&mut ms.vs),
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                visit_selectors_mut(arg, f);
            }
        }
        _ => {}
    }
}

// `{a="x" or b="y"}` selects the union of its branches, so each branch must carry the matcher.
fn push_matcher(vs: &mut VectorSelector, matcher: &Matcher) {
    vs.matchers.matchers.push(matcher.clone());
    for branch in vs.matchers.or_matchers.iter_mut() {
        branch.push(matcher.clone());
    }
}
