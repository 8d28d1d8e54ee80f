// Secret provider interface
// The core consumes secrets from an external collaborator; values reach
// steps through a validated handle and are registered with the log masker.

use std::collections::HashMap;

/// Where a secret lookup happens: a repo plus optional deployment
/// environment. Environment-scoped values shadow repo-scoped ones, which
/// shadow org-scoped ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretQuery {
    pub repo: String,
    pub environment: Option<String>,
}

impl SecretQuery {
    pub fn repo(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            environment: None,
        }
    }

    pub fn org(&self) -> Option<&str> {
        self.repo.split('/').next()
    }
}

/// External secret source.
pub trait SecretProvider: Send + Sync {
    /// Resolve a secret by name within the query's scope, or None.
    fn secret(&self, query: &SecretQuery, name: &str) -> Option<String>;
}

/// In-memory provider with org/repo/environment layers; used by tests and
/// the CLI.
#[derive(Debug, Default)]
pub struct StaticSecrets {
    org: HashMap<String, HashMap<String, String>>,
    repo: HashMap<String, HashMap<String, String>>,
    environment: HashMap<String, HashMap<String, String>>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_org(&mut self, org: &str, name: &str, value: &str) {
        self.org
            .entry(org.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_repo(&mut self, repo: &str, name: &str, value: &str) {
        self.repo
            .entry(repo.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_environment(&mut self, environment: &str, name: &str, value: &str) {
        self.environment
            .entry(environment.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }
}

impl SecretProvider for StaticSecrets {
    fn secret(&self, query: &SecretQuery, name: &str) -> Option<String> {
        if let Some(env) = &query.environment {
            if let Some(value) = self.environment.get(env).and_then(|m| m.get(name)) {
                return Some(value.clone());
            }
        }
        if let Some(value) = self.repo.get(&query.repo).and_then(|m| m.get(name)) {
            return Some(value.clone());
        }
        if let Some(org) = query.org() {
            if let Some(value) = self.org.get(org).and_then(|m| m.get(name)) {
                return Some(value.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_shadowing() {
        let mut secrets = StaticSecrets::new();
        secrets.set_org("acme", "TOKEN", "org-value");
        secrets.set_repo("acme/widgets", "TOKEN", "repo-value");
        secrets.set_environment("production", "TOKEN", "env-value");

        let repo_query = SecretQuery::repo("acme/widgets");
        assert_eq!(
            secrets.secret(&repo_query, "TOKEN"),
            Some("repo-value".to_string())
        );

        let env_query = SecretQuery {
            repo: "acme/widgets".to_string(),
            environment: Some("production".to_string()),
        };
        assert_eq!(
            secrets.secret(&env_query, "TOKEN"),
            Some("env-value".to_string())
        );

        // Org fallback for a sibling repo.
        let sibling = SecretQuery::repo("acme/gears");
        assert_eq!(
            secrets.secret(&sibling, "TOKEN"),
            Some("org-value".to_string())
        );

        // Nothing for strangers.
        let stranger = SecretQuery::repo("rival/things");
        assert_eq!(secrets.secret(&stranger, "TOKEN"), None);
        assert_eq!(secrets.secret(&repo_query, "MISSING"), None);
    }
}
