use std::{collections::BTreeMap, sync::Arc};

use crate::config::RepositoryConfig;

/// Read-only mapping from repository identifiers (`owner/repo`) to their deployment
/// configuration.
///
/// Built once at startup and shared with every request handler, it never changes while the
/// process runs.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    repositories: BTreeMap<String, Arc<RepositoryConfig>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound {
    pub identifier: String,
    pub known: Vec<String>,
}

impl Registry {
    pub fn new(repositories: BTreeMap<String, RepositoryConfig>) -> Self {
        Self {
            repositories: repositories
                .into_iter()
                .map(|(identifier, config)| (identifier, Arc::new(config)))
                .collect(),
        }
    }

    pub fn lookup(&self, identifier: &str) -> Result<&Arc<RepositoryConfig>, NotFound> {
        self.repositories.get(identifier).ok_or_else(|| NotFound {
            identifier: identifier.to_owned(),
            known: self.identifiers(),
        })
    }

    /// All registered identifiers, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        self.repositories.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RepositoryConfig)> {
        self.repositories
            .iter()
            .map(|(identifier, config)| (identifier.as_str(), config.as_ref()))
    }

    /// Maps a URL path segment back to a registered identifier.
    ///
    /// Webhook URLs can't contain the `/` of `owner/repo`, so it is replaced by `-` when the
    /// URL is built. Owners and repositories may contain dashes themselves, so registered
    /// identifiers are matched first, and only then is the first `-` turned back into a `/`.
    pub fn resolve_segment(&self, segment: &str) -> String {
        if self.repositories.contains_key(segment) {
            return segment.to_owned();
        }

        self.repositories
            .keys()
            .find(|identifier| webhook_segment(identifier) == segment)
            .cloned()
            .unwrap_or_else(|| segment.replacen('-', "/", 1))
    }
}

pub fn webhook_segment(identifier: &str) -> String {
    identifier.replace('/', "-")
}

pub fn webhook_path(identifier: &str) -> String {
    format!("/webhook/{}", webhook_segment(identifier))
}

#[cfg(test)]
pub(crate) fn repository(branch: &str, script: &str) -> RepositoryConfig {
    RepositoryConfig {
        secret: "topsecret".to_owned(),
        verify_signature: true,
        branch: branch.to_owned(),
        project_name: "Test Project".to_owned(),
        deploy_script: script.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let mut repositories = BTreeMap::new();
        repositories.insert("acme/site".to_owned(), repository("main", "/tmp/a.sh"));
        repositories.insert("my-org/web-app".to_owned(), repository("prod", "/tmp/b.sh"));
        Registry::new(repositories)
    }

    #[test]
    fn lookup_known_repository() {
        let registry = registry();
        let config = registry.lookup("acme/site").unwrap();
        assert_eq!(config.branch, "main");
    }

    #[test]
    fn lookup_unknown_lists_all_identifiers() {
        let registry = registry();
        let err = registry.lookup("acme/unknown").unwrap_err();
        assert_eq!(err.identifier, "acme/unknown");
        assert_eq!(err.known, vec!["acme/site", "my-org/web-app"]);
    }

    #[test]
    fn resolve_segment_handles_dashes() {
        let registry = registry();
        assert_eq!(registry.resolve_segment("acme-site"), "acme/site");
        assert_eq!(registry.resolve_segment("my-org-web-app"), "my-org/web-app");
        assert_eq!(registry.resolve_segment("other-thing"), "other/thing");
        assert_eq!(registry.resolve_segment("nodash"), "nodash");
    }

    #[test]
    fn webhook_paths() {
        assert_eq!(webhook_path("acme/site"), "/webhook/acme-site");
    }
}
