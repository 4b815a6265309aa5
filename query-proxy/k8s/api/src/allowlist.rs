//! Encodes the label allowlist into, and decodes it from, its ConfigMap.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use rbac_query_proxy_core::ManagedClusterLabelAllowList;
use std::collections::BTreeMap;

/// The ConfigMap data key holding the YAML-encoded allowlist.
pub const ALLOWLIST_KEY: &str = "managed_cluster.yaml";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configmap has no {ALLOWLIST_KEY} key")]
    MissingKey,

    #[error("invalid allowlist yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Decodes the allowlist held by `cm`. The regex label list is derived on decode.
pub fn decode(cm: &ConfigMap) -> Result<ManagedClusterLabelAllowList, Error> {
    let yaml = cm
        .data
        .as_ref()
        .and_then(|data| data.get(ALLOWLIST_KEY))
        .ok_or(Error::MissingKey)?;
    let mut list = serde_yaml::from_str::<ManagedClusterLabelAllowList>(yaml)?;
    list.normalize();
    Ok(list)
}

/// Builds a ConfigMap named `name` in `namespace` holding `list`.
pub fn encode(
    namespace: &str,
    name: &str,
    list: &ManagedClusterLabelAllowList,
) -> Result<ConfigMap, Error> {
    let mut cm = ConfigMap {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        ..ConfigMap::default()
    };
    set(&mut cm, list)?;
    Ok(cm)
}

/// Replaces the allowlist held by `cm`, preserving its metadata and any other keys.
pub fn set(cm: &mut ConfigMap, list: &ManagedClusterLabelAllowList) -> Result<(), Error> {
    let yaml = serde_yaml::to_string(list)?;
    cm.data
        .get_or_insert_with(BTreeMap::new)
        .insert(ALLOWLIST_KEY.to_string(), yaml);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn configmap(yaml: &str) -> ConfigMap {
        ConfigMap {
            data: Some(btreemap! { ALLOWLIST_KEY.to_string() => yaml.to_string() }),
            ..ConfigMap::default()
        }
    }

    #[test]
    fn decodes_lists_and_derives_regex_labels() {
        let cm = configmap(
            "labels:\n- vendor\n- cloud\n- feature.open-cluster-management.io/addon\nignore_labels:\n- clusterID\n",
        );
        let list = decode(&cm).expect("allowlist must decode");
        assert_eq!(
            list.label_list,
            vec![
                "cloud".to_string(),
                "feature.open-cluster-management.io/addon".to_string(),
                "vendor".to_string(),
            ]
        );
        assert_eq!(list.ignore_list, vec!["clusterID".to_string()]);
        assert_eq!(
            list.regex_label_list,
            vec![
                "cloud".to_string(),
                "feature_open_cluster_management_io_addon".to_string(),
                "vendor".to_string(),
            ]
        );
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let list = decode(&configmap("labels: [cloud]\n")).expect("allowlist must decode");
        assert_eq!(list.label_list, vec!["cloud".to_string()]);
        assert!(list.ignore_list.is_empty());
    }

    #[test]
    fn missing_key_is_an_error() {
        assert!(matches!(
            decode(&ConfigMap::default()),
            Err(Error::MissingKey)
        ));
        assert!(matches!(decode(&configmap("labels: {")), Err(Error::Yaml(_))));
    }

    #[test]
    fn encoding_omits_regex_labels() {
        let list = ManagedClusterLabelAllowList::new(
            vec!["cloud".to_string(), "name".to_string()],
            vec!["vendor".to_string()],
        );
        let cm = encode("observability", "allowlist", &list).expect("allowlist must encode");
        assert_eq!(cm.metadata.namespace.as_deref(), Some("observability"));
        assert_eq!(cm.metadata.name.as_deref(), Some("allowlist"));

        let yaml = &cm.data.as_ref().expect("data must be set")[ALLOWLIST_KEY];
        assert!(yaml.contains("ignore_labels"));
        assert!(!yaml.contains("regex"));
        assert!(decode(&cm).expect("allowlist must decode").equivalent(&list));
    }

    #[test]
    fn set_preserves_other_keys() {
        let mut cm = ConfigMap {
            data: Some(btreemap! { "other".to_string() => "x".to_string() }),
            ..ConfigMap::default()
        };
        set(&mut cm, &ManagedClusterLabelAllowList::minimal()).expect("allowlist must encode");
        let data = cm.data.expect("data must be set");
        assert_eq!(data["other"], "x");
        assert!(data.contains_key(ALLOWLIST_KEY));
    }
}
