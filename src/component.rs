use strum_macros::{Display, EnumString};

/// Logical role of an instance within the cluster. Drives tag filtering,
/// strategy selection and the masters-before-workers scheduling gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum Component {
    #[strum(serialize = "k8s-node")]
    K8sNode,
    #[strum(serialize = "k8s-master")]
    K8sMaster,
    #[strum(serialize = "etcd")]
    Etcd,
}

impl Component {
    pub fn all() -> [Component; 3] {
        [Component::K8sNode, Component::K8sMaster, Component::Etcd]
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Component::K8sMaster)
    }

    /// `ServiceComponent` tag value used to filter instances by component.
    pub fn tag_value(&self) -> &'static str {
        match self {
            Component::K8sNode => "k8s-node",
            Component::K8sMaster => "k8s-master",
            Component::Etcd => "etcd",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_known_component_names() {
        assert_eq!(Component::from_str("k8s-node").unwrap(), Component::K8sNode);
        assert_eq!(Component::from_str("k8s-master").unwrap(), Component::K8sMaster);
        assert_eq!(Component::from_str("etcd").unwrap(), Component::Etcd);
    }

    #[test]
    fn rejects_unknown_component_names() {
        assert!(Component::from_str("k8s-bogus").is_err());
    }

    #[test]
    fn display_round_trips_through_tag_value() {
        for c in Component::all() {
            assert_eq!(c.to_string(), c.tag_value());
        }
    }
}
