use crate::identity::{ResourceIdentity, ResourceKind};
use serde::{ser::SerializeMap, Serialize, Serializer};
use std::{fmt, sync::Arc};

/// A position in the event log.
///
/// Ids are assigned from a single sequence shared by all kinds and are never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Bookmark,
}

/// A single decoded upstream change notification.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedChange {
    pub resource: Arc<ResourceKind>,

    /// The upstream version of the object (or of the stream, for bookmarks).
    pub resource_version: Option<String>,

    pub event: ChangeEvent,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    Added {
        identity: ResourceIdentity,
        object: serde_json::Value,
    },
    Modified {
        identity: ResourceIdentity,
        object: serde_json::Value,
    },
    /// Deletions only ever carry the object's identity.
    Deleted { identity: ResourceIdentity },
    Bookmark,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventLogEntry {
    pub id: EventId,
    pub change: TrackedChange,
}

/// An item delivered to a viewer session.
#[derive(Clone, Debug)]
pub enum Notification {
    /// A mirror entry replayed when the session connected. Always presented as a modification.
    Replay(Arc<EventLogEntry>),

    /// A live change, in log order.
    Event(Arc<EventLogEntry>),

    /// Marks the end of the initial replay.
    Loaded,
}

// === impl EventId ===

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl ChangeType ===

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Bookmark => "BOOKMARK",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl TrackedChange ===

impl TrackedChange {
    pub fn added(
        resource: Arc<ResourceKind>,
        identity: ResourceIdentity,
        resource_version: Option<String>,
        object: serde_json::Value,
    ) -> Self {
        Self {
            resource,
            resource_version,
            event: ChangeEvent::Added { identity, object },
        }
    }

    pub fn modified(
        resource: Arc<ResourceKind>,
        identity: ResourceIdentity,
        resource_version: Option<String>,
        object: serde_json::Value,
    ) -> Self {
        Self {
            resource,
            resource_version,
            event: ChangeEvent::Modified { identity, object },
        }
    }

    pub fn deleted(
        resource: Arc<ResourceKind>,
        identity: ResourceIdentity,
        resource_version: Option<String>,
    ) -> Self {
        Self {
            resource,
            resource_version,
            event: ChangeEvent::Deleted { identity },
        }
    }

    pub fn bookmark(resource: Arc<ResourceKind>, resource_version: Option<String>) -> Self {
        Self {
            resource,
            resource_version,
            event: ChangeEvent::Bookmark,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self.event {
            ChangeEvent::Added { .. } => ChangeType::Added,
            ChangeEvent::Modified { .. } => ChangeType::Modified,
            ChangeEvent::Deleted { .. } => ChangeType::Deleted,
            ChangeEvent::Bookmark => ChangeType::Bookmark,
        }
    }

    pub fn identity(&self) -> Option<&ResourceIdentity> {
        match self.event {
            ChangeEvent::Added { ref identity, .. }
            | ChangeEvent::Modified { ref identity, .. }
            | ChangeEvent::Deleted { ref identity } => Some(identity),
            ChangeEvent::Bookmark => None,
        }
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        match self.event {
            ChangeEvent::Added { ref object, .. } | ChangeEvent::Modified { ref object, .. } => {
                Some(object)
            }
            ChangeEvent::Deleted { .. } | ChangeEvent::Bookmark => None,
        }
    }

    /// Renders the object as it is published to viewers.
    pub fn object(&self) -> serde_json::Value {
        serde_json::to_value(WireObject(self)).unwrap_or(serde_json::Value::Null)
    }
}

// === impl Notification ===

impl Notification {
    /// The change type as presented to the viewer.
    pub fn change_type(&self) -> Option<ChangeType> {
        match self {
            Self::Replay(_) => Some(ChangeType::Modified),
            Self::Event(entry) => Some(entry.change.change_type()),
            Self::Loaded => None,
        }
    }

    pub fn entry(&self) -> Option<&Arc<EventLogEntry>> {
        match self {
            Self::Replay(entry) | Self::Event(entry) => Some(entry),
            Self::Loaded => None,
        }
    }
}

/// Serializes as `{"type": ..., "object": ...}`, or `{"type": "LOADED"}` for the replay marker.
impl Serialize for Notification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Loaded => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("type", "LOADED")?;
                map.end()
            }
            Self::Replay(entry) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", ChangeType::Modified.as_str())?;
                map.serialize_entry("object", &WireObject(&entry.change))?;
                map.end()
            }
            Self::Event(entry) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", entry.change.change_type().as_str())?;
                map.serialize_entry("object", &WireObject(&entry.change))?;
                map.end()
            }
        }
    }
}

/// Borrows a change to serialize its published object without copying the payload.
struct WireObject<'c>(&'c TrackedChange);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MinimalObject<'c> {
    kind: &'c str,
    api_version: String,
    metadata: MinimalMeta<'c>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MinimalMeta<'c> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'c str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'c str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_version: Option<&'c str>,
}

impl Serialize for WireObject<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let change = self.0;
        match change.event {
            ChangeEvent::Added { ref object, .. } | ChangeEvent::Modified { ref object, .. } => {
                object.serialize(serializer)
            }
            ChangeEvent::Deleted { ref identity } => MinimalObject {
                kind: &identity.kind,
                api_version: change.resource.api_version(),
                metadata: MinimalMeta {
                    name: Some(&identity.name),
                    namespace: identity.namespace.as_deref(),
                    resource_version: None,
                },
            }
            .serialize(serializer),
            ChangeEvent::Bookmark => MinimalObject {
                kind: &change.resource.kind,
                api_version: change.resource.api_version(),
                metadata: MinimalMeta {
                    name: None,
                    namespace: None,
                    resource_version: change.resource_version.as_deref(),
                },
            }
            .serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pods() -> Arc<ResourceKind> {
        Arc::new(ResourceKind::new("", "v1", "Pod", "pods"))
    }

    #[test]
    fn deleted_objects_are_minimal() {
        let pods = pods();
        let change = TrackedChange::deleted(
            pods.clone(),
            pods.identity(Some("default".to_string()), "a"),
            Some("12".to_string()),
        );
        assert_eq!(change.payload(), None);
        assert_eq!(
            change.object(),
            json!({
                "kind": "Pod",
                "apiVersion": "v1",
                "metadata": { "name": "a", "namespace": "default" },
            })
        );
    }

    #[test]
    fn cluster_scoped_deletions_omit_namespace() {
        let nodes = Arc::new(ResourceKind::new("", "v1", "Node", "nodes"));
        let change = TrackedChange::deleted(nodes.clone(), nodes.identity(None, "node-0"), None);
        assert_eq!(
            change.object(),
            json!({
                "kind": "Node",
                "apiVersion": "v1",
                "metadata": { "name": "node-0" },
            })
        );
    }

    #[test]
    fn notifications_serialize_with_type_tags() {
        let pods = pods();
        let object = json!({
            "kind": "Pod",
            "apiVersion": "v1",
            "metadata": { "name": "a", "namespace": "default" },
            "spec": { "nodeName": "node-0" },
        });
        let entry = Arc::new(EventLogEntry {
            id: EventId(7),
            change: TrackedChange::added(
                pods.clone(),
                pods.identity(Some("default".to_string()), "a"),
                Some("1".to_string()),
                object.clone(),
            ),
        });

        assert_eq!(
            serde_json::to_value(Notification::Event(entry.clone())).unwrap(),
            json!({ "type": "ADDED", "object": object }),
        );
        assert_eq!(
            serde_json::to_value(Notification::Replay(entry)).unwrap(),
            json!({ "type": "MODIFIED", "object": object }),
        );
        assert_eq!(
            serde_json::to_value(Notification::Loaded).unwrap(),
            json!({ "type": "LOADED" }),
        );
    }

    #[test]
    fn bookmarks_carry_only_a_version() {
        let change = TrackedChange::bookmark(pods(), Some("1234".to_string()));
        assert_eq!(change.identity(), None);
        assert_eq!(
            change.object(),
            json!({
                "kind": "Pod",
                "apiVersion": "v1",
                "metadata": { "resourceVersion": "1234" },
            })
        );
    }
}
