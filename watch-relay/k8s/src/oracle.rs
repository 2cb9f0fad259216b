use anyhow::Result;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::{
    api::{Api, PostParams},
    Client,
};
use watch_relay_core::{AccessOracle, AccessTarget, Subject, Verb};

/// Asks the API server's authorizer by posting a `SubjectAccessReview` for each query.
#[derive(Clone)]
pub struct SubjectAccessReviewOracle {
    api: Api<SubjectAccessReview>,
}

// === impl SubjectAccessReviewOracle ===

impl SubjectAccessReviewOracle {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait::async_trait]
impl AccessOracle for SubjectAccessReviewOracle {
    async fn allowed(&self, subject: &Subject, target: &AccessTarget, verb: Verb) -> Result<bool> {
        let review = self
            .api
            .create(&PostParams::default(), &review(subject, target, verb))
            .await?;
        Ok(review.status.is_some_and(|status| status.allowed))
    }
}

impl std::fmt::Debug for SubjectAccessReviewOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectAccessReviewOracle").finish_non_exhaustive()
    }
}

fn review(subject: &Subject, target: &AccessTarget, verb: Verb) -> SubjectAccessReview {
    SubjectAccessReview {
        spec: SubjectAccessReviewSpec {
            user: Some(subject.user.clone()),
            groups: Some(subject.groups.clone()),
            resource_attributes: Some(ResourceAttributes {
                group: Some(target.group.clone()),
                resource: Some(target.resource.clone()),
                namespace: target.namespace.clone(),
                name: target.name.clone(),
                verb: Some(verb.as_str().to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watch_relay_core::ResourceKind;

    #[test]
    fn namespaced_get() {
        let secrets = ResourceKind::new("", "v1", "Secret", "secrets");
        let subject = Subject::new("grace", ["dev"]);
        let target = AccessTarget::object(
            &secrets,
            &secrets.identity(Some("ops".to_string()), "db-cred"),
        );

        let review = serde_json::to_value(review(&subject, &target, Verb::Get)).unwrap();
        assert_eq!(
            review["spec"],
            json!({
                "user": "grace",
                "groups": ["dev"],
                "resourceAttributes": {
                    "group": "",
                    "resource": "secrets",
                    "namespace": "ops",
                    "name": "db-cred",
                    "verb": "get",
                },
            })
        );
    }

    #[test]
    fn cluster_list() {
        let deploys = ResourceKind::new("apps", "v1", "Deployment", "deployments");
        let subject = Subject::new("erin", Vec::<String>::new());
        let review =
            serde_json::to_value(review(&subject, &AccessTarget::cluster(&deploys), Verb::List))
                .unwrap();
        let attrs = &review["spec"]["resourceAttributes"];
        assert_eq!(attrs["group"], json!("apps"));
        assert_eq!(attrs["resource"], json!("deployments"));
        assert_eq!(attrs["verb"], json!("list"));
        assert!(attrs.get("namespace").is_none());
        assert!(attrs.get("name").is_none());
    }
}
