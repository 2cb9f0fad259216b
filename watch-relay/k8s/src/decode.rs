use kube::{
    api::DynamicObject,
    core::{TypeMeta, WatchEvent},
};
use std::sync::Arc;
use watch_relay_core::{ResourceIdentity, ResourceKind, TrackedChange};

type Sanitized = (ResourceIdentity, Option<String>, serde_json::Value);

/// Secret annotations that carry no secret content. All others are dropped, since tooling such as
/// `kubectl apply` copies the full manifest into annotations.
const SECRET_ANNOTATIONS: [&str; 2] = [
    "kubernetes.io/service-account.name",
    "kubernetes.io/service-account.uid",
];

/// The result of decoding a single watch notification.
#[derive(Debug)]
pub(crate) enum Decoded {
    Change(TrackedChange),

    /// The server no longer has the requested resource version.
    Expired,

    /// The server ended the watch with an error status.
    Failed {
        code: u16,
        reason: String,
        message: String,
    },

    Skipped(&'static str),
}

pub(crate) fn decode(resource: &Arc<ResourceKind>, line: &str) -> serde_json::Result<Decoded> {
    let event = serde_json::from_str::<WatchEvent<DynamicObject>>(line)?;
    let decoded = match event {
        WatchEvent::Added(obj) => match sanitize(resource, obj)? {
            Some((identity, version, object)) => Decoded::Change(TrackedChange::added(
                resource.clone(),
                identity,
                version,
                object,
            )),
            None => Decoded::Skipped("object has no name"),
        },
        WatchEvent::Modified(obj) => match sanitize(resource, obj)? {
            Some((identity, version, object)) => Decoded::Change(TrackedChange::modified(
                resource.clone(),
                identity,
                version,
                object,
            )),
            None => Decoded::Skipped("object has no name"),
        },
        WatchEvent::Deleted(obj) => match obj.metadata.name {
            Some(name) => Decoded::Change(TrackedChange::deleted(
                resource.clone(),
                resource.identity(obj.metadata.namespace, name),
                obj.metadata.resource_version,
            )),
            None => Decoded::Skipped("object has no name"),
        },
        WatchEvent::Bookmark(bookmark) => Decoded::Change(TrackedChange::bookmark(
            resource.clone(),
            Some(bookmark.metadata.resource_version),
        )),
        WatchEvent::Error(error) if error.code == 410 => Decoded::Expired,
        WatchEvent::Error(error) => Decoded::Failed {
            code: error.code,
            reason: error.reason,
            message: error.message,
        },
    };
    Ok(decoded)
}

/// Converts an object from a list response into a change.
///
/// Returns `Ok(None)` for objects without a name.
pub(crate) fn listed(
    resource: &Arc<ResourceKind>,
    obj: DynamicObject,
) -> serde_json::Result<Option<TrackedChange>> {
    Ok(sanitize(resource, obj)?.map(|(identity, version, object)| {
        TrackedChange::added(resource.clone(), identity, version, object)
    }))
}

/// Strips server bookkeeping and secret data from an object before it is stored.
fn sanitize(
    resource: &ResourceKind,
    mut obj: DynamicObject,
) -> serde_json::Result<Option<Sanitized>> {
    let name = match obj.metadata.name.clone() {
        Some(name) => name,
        None => return Ok(None),
    };

    obj.metadata.managed_fields = None;
    obj.metadata.self_link = None;
    if resource.is_secret() {
        if let Some(fields) = obj.data.as_object_mut() {
            fields.remove("data");
            fields.remove("stringData");
        }
        if let Some(mut annotations) = obj.metadata.annotations.take() {
            annotations.retain(|name, _| SECRET_ANNOTATIONS.contains(&name.as_str()));
            if !annotations.is_empty() {
                obj.metadata.annotations = Some(annotations);
            }
        }
    }
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: resource.api_version(),
            kind: resource.kind.clone(),
        });
    }

    let identity = resource.identity(obj.metadata.namespace.clone(), name);
    let version = obj.metadata.resource_version.clone();
    Ok(Some((identity, version, serde_json::to_value(&obj)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watch_relay_core::{ChangeEvent, ChangeType};

    fn pods() -> Arc<ResourceKind> {
        Arc::new(ResourceKind::new("", "v1", "Pod", "pods"))
    }

    fn change(decoded: Decoded) -> TrackedChange {
        match decoded {
            Decoded::Change(change) => change,
            d => panic!("expected a change, got {d:?}"),
        }
    }

    #[test]
    fn strips_server_bookkeeping() {
        let line = json!({
            "type": "ADDED",
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "a",
                    "namespace": "default",
                    "labels": { "app": "web", "tier": "frontend" },
                    "resourceVersion": "12",
                    "selfLink": "/api/v1/namespaces/default/pods/a",
                    "managedFields": [{ "manager": "kubectl", "operation": "Apply" }],
                },
                "spec": { "nodeName": "node-0" },
            },
        })
        .to_string();

        let change = change(decode(&pods(), &line).unwrap());
        assert_eq!(change.change_type(), ChangeType::Added);
        assert_eq!(change.resource_version.as_deref(), Some("12"));
        let identity = change.identity().unwrap();
        assert_eq!(identity.namespace.as_deref(), Some("default"));
        assert_eq!(identity.name, "a");

        let object = change.payload().unwrap();
        assert_eq!(object["spec"]["nodeName"], json!("node-0"));
        assert!(object["metadata"].get("selfLink").is_none());
        assert!(object["metadata"].get("managedFields").is_none());
        assert_eq!(
            object["metadata"]["labels"],
            serde_json::to_value(maplit::btreemap! {
                "app" => "web",
                "tier" => "frontend",
            })
            .unwrap()
        );
    }

    #[test]
    fn strips_secret_data() {
        let secrets = Arc::new(ResourceKind::new("", "v1", "Secret", "secrets"));
        let line = json!({
            "type": "MODIFIED",
            "object": {
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": { "name": "db-cred", "namespace": "ops", "resourceVersion": "3" },
                "type": "Opaque",
                "data": { "password": "aHVudGVyMg==" },
                "stringData": { "user": "admin" },
            },
        })
        .to_string();

        let change = change(decode(&secrets, &line).unwrap());
        let object = change.payload().unwrap();
        assert!(object.get("data").is_none());
        assert!(object.get("stringData").is_none());
        assert_eq!(object["type"], json!("Opaque"));
        assert!(!object.to_string().contains("aHVudGVyMg=="));
    }

    #[test]
    fn strips_secret_annotations() {
        let secrets = Arc::new(ResourceKind::new("", "v1", "Secret", "secrets"));
        let applied = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "db-cred", "namespace": "ops" },
            "data": { "password": "aHVudGVyMg==" },
        })
        .to_string();
        let line = json!({
            "type": "ADDED",
            "object": {
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {
                    "name": "db-cred",
                    "namespace": "ops",
                    "resourceVersion": "3",
                    "labels": { "app": "db" },
                    "annotations": {
                        "kubectl.kubernetes.io/last-applied-configuration": applied,
                        "kubernetes.io/service-account.name": "builder",
                        "example.com/notes": "rotated by hand",
                    },
                },
                "type": "kubernetes.io/service-account-token",
                "data": { "token": "dG9rZW4=" },
            },
        })
        .to_string();

        let change = change(decode(&secrets, &line).unwrap());
        let object = change.payload().unwrap();
        assert!(!object.to_string().contains("aHVudGVyMg=="));
        assert!(!object.to_string().contains("dG9rZW4="));
        assert_eq!(
            object["metadata"]["annotations"],
            json!({ "kubernetes.io/service-account.name": "builder" })
        );
        assert_eq!(object["metadata"]["labels"], json!({ "app": "db" }));
    }

    #[test]
    fn other_kinds_keep_their_annotations() {
        let line = json!({
            "type": "ADDED",
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "a",
                    "namespace": "default",
                    "annotations": { "example.com/notes": "canary" },
                },
            },
        })
        .to_string();

        let change = change(decode(&pods(), &line).unwrap());
        assert_eq!(
            change.payload().unwrap()["metadata"]["annotations"],
            json!({ "example.com/notes": "canary" })
        );
    }

    #[test]
    fn listed_objects_are_sanitized() {
        let secrets = Arc::new(ResourceKind::new("", "v1", "Secret", "secrets"));
        let obj = serde_json::from_value::<DynamicObject>(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": "db-cred",
                "namespace": "ops",
                "resourceVersion": "3",
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{\"data\":{}}",
                },
            },
            "data": { "password": "aHVudGVyMg==" },
        }))
        .unwrap();

        let change = listed(&secrets, obj).unwrap().expect("named objects are listed");
        assert_eq!(change.change_type(), ChangeType::Added);
        assert_eq!(change.resource_version.as_deref(), Some("3"));
        let object = change.payload().unwrap();
        assert!(object.get("data").is_none());
        assert!(object["metadata"].get("annotations").is_none());

        let nameless = serde_json::from_value::<DynamicObject>(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {},
        }))
        .unwrap();
        assert!(listed(&secrets, nameless).unwrap().is_none());
    }

    #[test]
    fn fills_missing_type_meta() {
        let line = json!({
            "type": "ADDED",
            "object": { "metadata": { "name": "a", "namespace": "default" } },
        })
        .to_string();

        let change = change(decode(&pods(), &line).unwrap());
        let object = change.payload().unwrap();
        assert_eq!(object["kind"], json!("Pod"));
        assert_eq!(object["apiVersion"], json!("v1"));
    }

    #[test]
    fn deletions_keep_only_the_identity() {
        let line = json!({
            "type": "DELETED",
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": "a", "namespace": "default", "resourceVersion": "14" },
                "spec": { "nodeName": "node-0" },
            },
        })
        .to_string();

        let change = change(decode(&pods(), &line).unwrap());
        assert!(matches!(change.event, ChangeEvent::Deleted { .. }));
        assert_eq!(change.resource_version.as_deref(), Some("14"));
        assert!(change.payload().is_none());
    }

    #[test]
    fn bookmarks() {
        let line = json!({
            "type": "BOOKMARK",
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "resourceVersion": "20" },
            },
        })
        .to_string();

        let change = change(decode(&pods(), &line).unwrap());
        assert_eq!(change.change_type(), ChangeType::Bookmark);
        assert_eq!(change.resource_version.as_deref(), Some("20"));
    }

    #[test]
    fn errors() {
        let expired = json!({
            "type": "ERROR",
            "object": {
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "too old resource version: 1 (20)",
                "reason": "Expired",
                "code": 410,
            },
        })
        .to_string();
        assert!(matches!(decode(&pods(), &expired).unwrap(), Decoded::Expired));

        let forbidden = json!({
            "type": "ERROR",
            "object": {
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "pods is forbidden",
                "reason": "Forbidden",
                "code": 403,
            },
        })
        .to_string();
        match decode(&pods(), &forbidden).unwrap() {
            Decoded::Failed { code, reason, .. } => {
                assert_eq!(code, 403);
                assert_eq!(reason, "Forbidden");
            }
            d => panic!("expected a failure, got {d:?}"),
        }
    }

    #[test]
    fn nameless_objects_are_skipped() {
        let line = json!({
            "type": "ADDED",
            "object": { "apiVersion": "v1", "kind": "Pod", "metadata": { "namespace": "default" } },
        })
        .to_string();
        assert!(matches!(
            decode(&pods(), &line).unwrap(),
            Decoded::Skipped(_)
        ));
    }

    #[test]
    fn malformed_lines_fail() {
        assert!(decode(&pods(), "{\"type\":").is_err());
        assert!(decode(&pods(), "{\"type\":\"UNKNOWN\",\"object\":{}}").is_err());
    }
}
