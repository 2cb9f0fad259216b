use std::str::FromStr;

/// A `--watch` argument: `<apiVersion> <Kind> [labels=<sel>] [fields=<sel>] [plural=<name>]`.
///
/// Options are separated by whitespace, so selectors must be written without spaces (e.g.
/// `labels=app=web,tier!=cache`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchSpec {
    pub api_version: String,
    pub kind: String,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub plural: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseWatchError {
    #[error("missing apiVersion")]
    MissingApiVersion,

    #[error("missing kind")]
    MissingKind,

    #[error("invalid apiVersion: {0}")]
    InvalidApiVersion(String),

    #[error("unknown option: {0}")]
    UnknownOption(String),

    #[error("duplicate option: {0}")]
    DuplicateOption(String),

    #[error("option has no value: {0}")]
    EmptyOption(String),
}

impl FromStr for WatchSpec {
    type Err = ParseWatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let api_version = words.next().ok_or(ParseWatchError::MissingApiVersion)?;
        let kind = words.next().ok_or(ParseWatchError::MissingKind)?;
        if !valid_api_version(api_version) {
            return Err(ParseWatchError::InvalidApiVersion(api_version.to_string()));
        }

        let mut spec = WatchSpec {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            label_selector: None,
            field_selector: None,
            plural: None,
        };
        for option in words {
            let (name, value) = option
                .split_once('=')
                .ok_or_else(|| ParseWatchError::UnknownOption(option.to_string()))?;
            let slot = match name {
                "labels" => &mut spec.label_selector,
                "fields" => &mut spec.field_selector,
                "plural" => &mut spec.plural,
                _ => return Err(ParseWatchError::UnknownOption(name.to_string())),
            };
            if value.is_empty() {
                return Err(ParseWatchError::EmptyOption(name.to_string()));
            }
            if slot.replace(value.to_string()).is_some() {
                return Err(ParseWatchError::DuplicateOption(name.to_string()));
            }
        }

        Ok(spec)
    }
}

fn valid_api_version(api_version: &str) -> bool {
    let mut parts = api_version.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(version), None, None) => !version.is_empty(),
        (Some(group), Some(version), None) => !group.is_empty() && !version.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_kind() {
        let spec = "v1 Pod".parse::<WatchSpec>().unwrap();
        assert_eq!(
            spec,
            WatchSpec {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
                label_selector: None,
                field_selector: None,
                plural: None,
            }
        );
    }

    #[test]
    fn options() {
        let spec = "apps/v1 Deployment labels=app=web,tier!=cache fields=metadata.namespace=prod"
            .parse::<WatchSpec>()
            .unwrap();
        assert_eq!(spec.api_version, "apps/v1");
        assert_eq!(spec.kind, "Deployment");
        assert_eq!(spec.label_selector.as_deref(), Some("app=web,tier!=cache"));
        assert_eq!(
            spec.field_selector.as_deref(),
            Some("metadata.namespace=prod")
        );

        let spec = "config.openshift.io/v1  FeatureGate plural=featuregates"
            .parse::<WatchSpec>()
            .unwrap();
        assert_eq!(spec.plural.as_deref(), Some("featuregates"));
    }

    #[test]
    fn invalid() {
        assert_eq!(
            "".parse::<WatchSpec>(),
            Err(ParseWatchError::MissingApiVersion)
        );
        assert_eq!("v1".parse::<WatchSpec>(), Err(ParseWatchError::MissingKind));
        assert_eq!(
            "a/b/c Pod".parse::<WatchSpec>(),
            Err(ParseWatchError::InvalidApiVersion("a/b/c".to_string()))
        );
        assert_eq!(
            "v1 Pod namespace=default".parse::<WatchSpec>(),
            Err(ParseWatchError::UnknownOption("namespace".to_string()))
        );
        assert_eq!(
            "v1 Pod web".parse::<WatchSpec>(),
            Err(ParseWatchError::UnknownOption("web".to_string()))
        );
        assert_eq!(
            "v1 Pod labels=".parse::<WatchSpec>(),
            Err(ParseWatchError::EmptyOption("labels".to_string()))
        );
        assert_eq!(
            "v1 Pod labels=a=b labels=c=d".parse::<WatchSpec>(),
            Err(ParseWatchError::DuplicateOption("labels".to_string()))
        );
    }
}
