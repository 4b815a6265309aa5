//! Per-cluster namespace access.

use crate::{rewrite, CLUSTER_LABEL, WILDCARD};
use promql_parser::label::MatchOp;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// The namespaces a user may see, keyed by cluster name.
///
/// An empty namespace set, or one containing `"*"`, grants every namespace on the cluster. Once
/// resolved, the map never holds a `"*"` cluster key.
pub type AccessControlMap = BTreeMap<String, BTreeSet<String>>;

/// Converts a raw access-review result into an [`AccessControlMap`], folding the `"*"` cluster
/// entry into every known cluster.
///
/// The wildcard's namespaces are unioned with any explicit entry for a cluster; an explicit entry
/// never narrows a wildcard grant.
pub fn merge_wildcard<'c>(
    raw: BTreeMap<String, Vec<String>>,
    clusters: impl IntoIterator<Item = &'c str>,
) -> AccessControlMap {
    let mut access = raw
        .into_iter()
        .map(|(cluster, namespaces)| (cluster, namespaces.into_iter().collect()))
        .collect::<AccessControlMap>();

    if let Some(wildcard) = access.remove(WILDCARD) {
        for cluster in clusters {
            if cluster == WILDCARD {
                continue;
            }
            access
                .entry(cluster.to_string())
                .or_default()
                .extend(wildcard.iter().cloned());
        }
    }

    access
}

/// Grants full access to every cluster in `clusters` that has no entry yet.
pub fn grant_clusters(access: &mut AccessControlMap, clusters: impl IntoIterator<Item = String>) {
    for cluster in clusters {
        access
            .entry(cluster)
            .or_insert_with(|| std::iter::once(WILDCARD.to_string()).collect());
    }
}

/// Indicates whether a namespace set grants every namespace.
pub fn is_unrestricted(namespaces: &BTreeSet<String>) -> bool {
    namespaces.is_empty() || namespaces.contains(WILDCARD)
}

/// Returns true iff every cluster in `clusters` is present in `access` with unrestricted
/// namespaces. An empty cluster set is never considered fully accessible.
pub fn can_access_all<'c>(
    access: &AccessControlMap,
    clusters: impl IntoIterator<Item = &'c str>,
) -> bool {
    let mut any = false;
    for cluster in clusters {
        any = true;
        match access.get(cluster) {
            Some(namespaces) if is_unrestricted(namespaces) => {}
            _ => return false,
        }
    }
    any
}

/// Returns the namespaces visible on every cluster in `clusters`, sorted.
///
/// An empty `clusters` slice considers every cluster in `access`. Clusters with unrestricted access
/// do not constrain the result; if all of them are unrestricted, `["*"]` is returned and callers
/// must skip namespace filtering.
pub fn common_namespaces_across_clusters(
    clusters: &[String],
    access: &AccessControlMap,
) -> Vec<String> {
    let considered = if clusters.is_empty() {
        access.keys().collect::<BTreeSet<_>>()
    } else {
        clusters.iter().collect()
    };
    if considered.is_empty() {
        return Vec::new();
    }

    let mut counts = HashMap::<&str, usize>::new();
    let mut unrestricted = 0;
    for cluster in &considered {
        match access.get(*cluster) {
            Some(namespaces) if is_unrestricted(namespaces) => unrestricted += 1,
            Some(namespaces) => {
                for ns in namespaces {
                    *counts.entry(ns.as_str()).or_default() += 1;
                }
            }
            None => {}
        }
    }

    if unrestricted == considered.len() {
        return vec![WILDCARD.to_string()];
    }

    let mut common = counts
        .into_iter()
        .filter(|(_, count)| count + unrestricted == considered.len())
        .map(|(ns, _)| ns.to_string())
        .collect::<Vec<_>>();
    common.sort();
    common
}

/// Resolves the `cluster` matchers in `query` against `accessible` clusters.
///
/// Returns the sorted set of accessible clusters the query is scoped to. An empty result means the
/// query does not constrain clusters, i.e. it targets all accessible clusters. Matchers with an
/// invalid regex are ignored.
pub fn clusters_referenced_in_query(
    query: &str,
    accessible: &[String],
) -> Result<Vec<String>, rewrite::Error> {
    let expr = rewrite::parse(query)?;

    let mut referenced = BTreeSet::new();
    rewrite::visit_selectors(&expr, &mut |vs| {
        let matchers = vs
            .matchers
            .matchers
            .iter()
            .chain(vs.matchers.or_matchers.iter().flatten())
            .filter(|m| m.name == CLUSTER_LABEL);
        for m in matchers {
            let re = match &m.op {
                MatchOp::Re(_) | MatchOp::NotRe(_) => match rewrite::anchored(&m.value) {
                    Ok(re) => Some(re),
                    Err(_) => continue,
                },
                _ => None,
            };
            let matched = |cluster: &str| match (&m.op, &re) {
                (MatchOp::Equal, _) => cluster == m.value,
                (MatchOp::NotEqual, _) => cluster != m.value,
                (MatchOp::Re(_), Some(re)) => re.is_match(cluster),
                (MatchOp::NotRe(_), Some(re)) => !re.is_match(cluster),
                _ => false,
            };
            referenced.extend(accessible.iter().filter(|c| matched(c.as_str())).cloned());
        }
    });

    Ok(referenced.into_iter().collect())
}
