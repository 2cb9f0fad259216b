use crate::{
    access::{AccessCache, AccessTarget, Subject, Verb},
    change::{ChangeEvent, TrackedChange},
    identity::ResourceKind,
};
use std::sync::Arc;

/// Decides whether a viewer may see a change.
#[derive(Clone, Debug)]
pub struct AccessFilter {
    cache: Arc<AccessCache>,

    /// `(group, kind)` pairs that every viewer may see.
    public_kinds: Arc<[(String, String)]>,
}

impl AccessFilter {
    /// Public kinds are named as `Kind.group`, or just `Kind` for the core group.
    pub fn new(cache: Arc<AccessCache>, public_kinds: impl IntoIterator<Item = String>) -> Self {
        let public_kinds = public_kinds
            .into_iter()
            .map(|qualified| match qualified.split_once('.') {
                Some((kind, group)) => (group.to_string(), kind.to_string()),
                None => (String::new(), qualified),
            })
            .collect();
        Self {
            cache,
            public_kinds,
        }
    }

    pub fn cache(&self) -> &Arc<AccessCache> {
        &self.cache
    }

    /// Returns true if the subject may see the change.
    ///
    /// Bookmarks and deletions carry no object data and are always visible. Otherwise the
    /// subject must be able to list the kind cluster-wide, list it in the object's namespace, or
    /// get the object itself. Checks stop at the first that succeeds.
    //
    // TODO(deletes): only forward a deletion to viewers that were shown the object's prior state.
    pub async fn is_visible(&self, subject: &Subject, change: &TrackedChange) -> bool {
        let identity = match change.event {
            ChangeEvent::Bookmark | ChangeEvent::Deleted { .. } => return true,
            ChangeEvent::Added { ref identity, .. }
            | ChangeEvent::Modified { ref identity, .. } => identity,
        };

        let kind = &*change.resource;
        if self.is_public(kind) {
            return true;
        }

        if self
            .cache
            .is_allowed(subject, &AccessTarget::cluster(kind), Verb::List)
            .await
        {
            return true;
        }

        if let Some(ref ns) = identity.namespace {
            if self
                .cache
                .is_allowed(subject, &AccessTarget::namespace(kind, ns), Verb::List)
                .await
            {
                return true;
            }
        }

        self.cache
            .is_allowed(subject, &AccessTarget::object(kind, identity), Verb::Get)
            .await
    }

    fn is_public(&self, kind: &ResourceKind) -> bool {
        self.public_kinds
            .iter()
            .any(|(group, name)| *group == kind.group && *name == kind.kind)
    }
}
