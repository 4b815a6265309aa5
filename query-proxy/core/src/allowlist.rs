//! The managed-cluster label allowlist.
//!
//! Managed clusters carry arbitrary labels. The allowlist records which of those labels are
//! exposed through the synthetic label-discovery metric (`label_list`) and which an administrator
//! suppressed (`ignore_list`). The list is persisted in a ConfigMap and kept in sync with the labels
//! actually observed on clusters.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The label holding a managed cluster's name.
pub const NAME_LABEL: &str = "name";

/// The label holding the cluster set a managed cluster belongs to.
pub const CLUSTERSET_LABEL: &str = "cluster.open-cluster-management.io/clusterset";

/// Labels that are always enabled and can never be ignored.
pub const REQUIRED_LABELS: [&str; 2] = [NAME_LABEL, CLUSTERSET_LABEL];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedClusterLabelAllowList {
    #[serde(rename = "labels", default)]
    pub label_list: Vec<String>,

    #[serde(rename = "ignore_labels", default)]
    pub ignore_list: Vec<String>,

    /// Metric-safe names of every enabled label. Always derived from the other two lists.
    #[serde(skip)]
    pub regex_label_list: Vec<String>,
}

// === impl ManagedClusterLabelAllowList ===

impl ManagedClusterLabelAllowList {
    pub fn new(
        labels: impl IntoIterator<Item = String>,
        ignored: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut list = Self {
            label_list: labels.into_iter().collect(),
            ignore_list: ignored.into_iter().collect(),
            regex_label_list: Vec::new(),
        };
        list.normalize();
        list
    }

    /// The allowlist written when none exists: only the required labels.
    pub fn minimal() -> Self {
        Self::new(REQUIRED_LABELS.iter().map(|l| l.to_string()), None)
    }

    /// Sorts and deduplicates both lists, strips required labels from the ignore list, and
    /// recomputes the regex list.
    pub fn normalize(&mut self) {
        self.ignore_list.retain(|l| !is_required(l));
        self.label_list.sort();
        self.label_list.dedup();
        self.ignore_list.sort();
        self.ignore_list.dedup();

        let ignored = self.ignore_list.iter().collect::<BTreeSet<_>>();
        self.regex_label_list = self
            .label_list
            .iter()
            .filter(|l| !ignored.contains(l))
            .map(|l| regex_label(l))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
    }

    /// Compares two allowlists irrespective of list order.
    pub fn equivalent(&self, other: &Self) -> bool {
        let mut this = self.clone();
        let mut other = other.clone();
        this.normalize();
        other.normalize();
        this == other
    }

    /// Folds on-cluster edits into this allowlist.
    ///
    /// Labels are only ever added here. Newly ignored labels are suppressed at once, but labels
    /// that were ignored stay in the ignore list until the next reconcile so that it still knows
    /// them; see [`generate_allowlist`].
    pub fn merge_edits(&mut self, edited: &Self) {
        self.label_list.extend(edited.label_list.iter().cloned());
        self.ignore_list.extend(edited.ignore_list.iter().cloned());
        self.normalize();
    }

    /// Labels that are enabled, i.e. listed and not ignored.
    pub fn enabled_labels(&self) -> impl Iterator<Item = &str> {
        self.label_list
            .iter()
            .filter(|l| !self.ignore_list.contains(l))
            .map(String::as_str)
    }
}

/// Computes the allowlist to persist.
///
/// - Every label discovered on a managed cluster and every required label is included.
/// - A label in `last_known`'s ignore list is always kept. If it was deleted from both of
///   `current`'s lists it is listed again.
/// - A label in `last_known`'s label list survives while it is still discovered or still present
///   in `current`; a label that was deleted from the ConfigMap and is no longer on any cluster is
///   dropped.
/// - The ignore list is `current`'s, less required labels. Ignored labels are not enabled.
pub fn generate_allowlist(
    current: &ManagedClusterLabelAllowList,
    last_known: &ManagedClusterLabelAllowList,
    label_sets: &BTreeMap<String, BTreeSet<String>>,
) -> ManagedClusterLabelAllowList {
    let discovered = label_sets.values().flatten().collect::<BTreeSet<_>>();
    let ignored = current
        .ignore_list
        .iter()
        .filter(|l| !is_required(l))
        .cloned()
        .collect::<BTreeSet<_>>();
    let in_current =
        |l: &String| current.label_list.contains(l) || current.ignore_list.contains(l);

    let mut labels = REQUIRED_LABELS
        .iter()
        .map(|l| l.to_string())
        .collect::<BTreeSet<_>>();
    labels.extend(discovered.iter().map(|l| l.to_string()));
    labels.extend(current.label_list.iter().cloned());
    labels.extend(
        last_known
            .label_list
            .iter()
            .filter(|l| discovered.contains(l) || in_current(l))
            .cloned(),
    );
    labels.extend(last_known.ignore_list.iter().cloned());
    labels.retain(|l| is_required(l) || !ignored.contains(l));

    ManagedClusterLabelAllowList::new(labels, ignored)
}

pub fn is_required(label: &str) -> bool {
    REQUIRED_LABELS.contains(&label)
}

/// Converts a label key into a valid metric label name by replacing every non-word character.
pub fn regex_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
