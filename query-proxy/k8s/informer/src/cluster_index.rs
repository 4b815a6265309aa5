use ahash::AHashMap as HashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Tracks the label keys set on each managed cluster.
///
/// Every mutation reports whether the set of distinct labels across all clusters changed, i.e.
/// whether a label gained its first owning cluster or lost its last one. Only those changes can
/// affect the allowlist.
#[derive(Debug, Default)]
pub struct ClusterIndex {
    labels_by_cluster: BTreeMap<String, BTreeSet<String>>,
    owners_by_label: HashMap<String, usize>,
}

// === impl ClusterIndex ===

impl ClusterIndex {
    /// Records the labels of a new or updated cluster.
    pub fn apply(&mut self, cluster: String, labels: BTreeSet<String>) -> bool {
        let mut changed = false;
        if let Some(previous) = self.labels_by_cluster.get(&cluster) {
            if *previous == labels {
                return false;
            }
            let previous = previous.clone();
            for label in previous.difference(&labels) {
                changed |= self.release(label);
            }
            for label in labels.difference(&previous) {
                changed |= self.acquire(label);
            }
        } else {
            for label in &labels {
                changed |= self.acquire(label);
            }
        }
        self.labels_by_cluster.insert(cluster, labels);
        changed
    }

    /// Forgets a removed cluster.
    pub fn delete(&mut self, cluster: &str) -> bool {
        let Some(labels) = self.labels_by_cluster.remove(cluster) else {
            return false;
        };
        let mut changed = false;
        for label in &labels {
            changed |= self.release(label);
        }
        changed
    }

    /// Replaces the index with a full list of clusters.
    pub fn reset(&mut self, clusters: impl IntoIterator<Item = (String, BTreeSet<String>)>) -> bool {
        let before = self.distinct_labels();
        self.labels_by_cluster.clear();
        self.owners_by_label.clear();
        for (cluster, labels) in clusters {
            self.apply(cluster, labels);
        }
        before != self.distinct_labels()
    }

    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.labels_by_cluster.keys().map(String::as_str)
    }

    pub fn label_sets(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.labels_by_cluster
    }

    pub fn len(&self) -> usize {
        self.labels_by_cluster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels_by_cluster.is_empty()
    }

    fn distinct_labels(&self) -> BTreeSet<String> {
        self.owners_by_label.keys().cloned().collect()
    }

    fn acquire(&mut self, label: &str) -> bool {
        let owners = self.owners_by_label.entry(label.to_string()).or_default();
        *owners += 1;
        *owners == 1
    }

    fn release(&mut self, label: &str) -> bool {
        match self.owners_by_label.get_mut(label) {
            Some(owners) if *owners > 1 => {
                *owners -= 1;
                false
            }
            Some(_) => {
                self.owners_by_label.remove(label);
                true
            }
            None => false,
        }
    }
}
