use std::fmt;

/// Describes a tracked resource type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    /// The API group. Empty for the core group.
    pub group: String,
    pub version: String,
    pub kind: String,

    /// The lowercased plural name used in API paths and authorization checks.
    pub plural: String,
}

/// Uniquely addresses a single tracked object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    pub group: String,
    pub kind: String,

    /// Unset for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

// === impl ResourceKind ===

impl ResourceKind {
    pub fn new(
        group: impl ToString,
        version: impl ToString,
        kind: impl ToString,
        plural: impl ToString,
    ) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    /// Returns the `apiVersion` string for this kind, e.g. `v1` or `apps/v1`.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Secret-bearing kinds never have their data stored or published.
    pub fn is_secret(&self) -> bool {
        self.group.is_empty() && self.kind == "Secret"
    }

    pub fn is_namespace(&self) -> bool {
        self.group.is_empty() && self.kind == "Namespace"
    }

    /// Builds the identity of an object of this kind.
    pub fn identity(&self, namespace: Option<String>, name: impl ToString) -> ResourceIdentity {
        ResourceIdentity {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.plural)
        } else {
            write!(f, "{}.{}", self.plural, self.group)
        }
    }
}

// === impl ResourceIdentity ===

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.group.is_empty() {
            write!(f, ".{}", self.group)?;
        }
        match self.namespace {
            Some(ref ns) => write!(f, " {}/{}", ns, self.name),
            None => write!(f, " {}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version() {
        let ns = ResourceKind::new("", "v1", "Namespace", "namespaces");
        assert_eq!(ns.api_version(), "v1");
        assert!(ns.is_namespace());
        assert!(!ns.is_secret());

        let cd = ResourceKind::new(
            "hive.openshift.io",
            "v1",
            "ClusterDeployment",
            "clusterdeployments",
        );
        assert_eq!(cd.api_version(), "hive.openshift.io/v1");
        assert_eq!(cd.to_string(), "clusterdeployments.hive.openshift.io");
    }

    #[test]
    fn secrets_are_core_only() {
        assert!(ResourceKind::new("", "v1", "Secret", "secrets").is_secret());
        assert!(!ResourceKind::new("example.com", "v1", "Secret", "secrets").is_secret());
    }

    #[test]
    fn identity_display() {
        let pods = ResourceKind::new("", "v1", "Pod", "pods");
        assert_eq!(
            pods.identity(Some("default".to_string()), "a").to_string(),
            "Pod default/a"
        );
        let nodes = ResourceKind::new("", "v1", "Node", "nodes");
        assert_eq!(nodes.identity(None, "node-0").to_string(), "Node node-0");
    }
}
