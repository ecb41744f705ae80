/*
 * ConfigSnapshot: the immutable view of the GitMirror configuration used by
 * one reconciliation pass. It is rebuilt from scratch on every pass and never
 * mutated afterwards.
 */

use crate::notifier::CollaboratorKind;
use crate::secrets;
use crate::secrets::SecretError;
use crate::secrets::SecretStore;

use gitmirror_api as api;
use std::path::Path;
use std::path::PathBuf;

pub const CLEARTEXT_KEY_WARNING: &str = "WARNING: \"git_ssh_key\" exposes your private key; use git_ssh_key_secret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub rev: Option<String>,
    pub depth: Option<i64>,
    pub wait: u64,
    pub ssh_key: Option<String>,
    pub ssh_key_secret: Option<String>,
    pub prometheus_alert_rules_path: String,
    pub loki_alert_rules_path: String,
    pub grafana_dashboards_path: String,
}

/* empty strings are the same as unset */
fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

impl From<&api::GitMirrorSpec> for ConfigSnapshot {
    fn from(spec: &api::GitMirrorSpec) -> Self {
	Self{
	    repo: non_empty(&spec.git_repo),
	    branch: non_empty(&spec.git_branch),
	    rev: non_empty(&spec.git_rev),
	    depth: spec.git_depth,
	    wait: spec.git_wait,
	    ssh_key: non_empty(&spec.git_ssh_key),
	    ssh_key_secret: non_empty(&spec.git_ssh_key_secret),
	    prometheus_alert_rules_path: spec.prometheus_alert_rules_path.clone(),
	    loki_alert_rules_path: spec.loki_alert_rules_path.clone(),
	    grafana_dashboards_path: spec.grafana_dashboards_path.clone(),
	}
    }
}

impl ConfigSnapshot {

    pub fn repo(&self) -> Option<&str> {
	self.repo.as_deref()
    }

    /*
     * The unit is considered configured once git_repo is set.
     */
    pub fn is_configured(&self) -> bool {
	self.repo.is_some()
    }

    pub fn warnings(&self) -> Vec<String> {
	let mut warnings = Vec::new();
	if self.ssh_key.is_some() {
	    warnings.push(String::from(CLEARTEXT_KEY_WARNING));
	}
	warnings
    }

    /*
     * Returns the private key to hand to git-sync. A key read from the
     * secret reference takes precedence over the cleartext one; when the
     * reference is set but does not resolve, the cleartext key is NOT used
     * as a fallback.
     */
    pub async fn resolve_ssh_key(&self, store: &dyn SecretStore) -> Result<Option<String>, SecretError> {
	if let Some(reference) = &self.ssh_key_secret {
	    let key = secrets::resolve(store, reference).await?;
	    return Ok(Some(key));
	}
	Ok(self.ssh_key.clone())
    }

    /*
     * Directory (inside the mirrored repository) feeding a collaborator
     */
    pub fn content_dir(&self, kind: CollaboratorKind, repo_path: &Path) -> PathBuf {
	let subdir = match kind {
	    CollaboratorKind::PrometheusRules => &self.prometheus_alert_rules_path,
	    CollaboratorKind::LokiRules => &self.loki_alert_rules_path,
	    CollaboratorKind::GrafanaDashboards => &self.grafana_dashboards_path,
	};
	repo_path.join(subdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSecrets;

    fn spec() -> api::GitMirrorSpec {
	api::GitMirrorSpec::with_repo("https://example.com/repo.git")
    }

    #[test]
    fn empty_strings_are_unset() {
	let mut spec = spec();
	spec.git_repo = Some(String::new());
	spec.git_branch = Some(String::new());

	let config = ConfigSnapshot::from(&spec);
	assert!(!config.is_configured());
	assert_eq!(config.branch, None);
    }

    #[tokio::test]
    async fn secret_key_wins_over_cleartext() {
	let store = FakeSecrets::with("deploy-key", "private-ssh-key", "FROM-SECRET");
	let mut spec = spec();
	spec.git_ssh_key = Some(String::from("CLEARTEXT"));
	spec.git_ssh_key_secret = Some(String::from("secret://deploy-key/private-ssh-key"));

	let config = ConfigSnapshot::from(&spec);
	let key = config.resolve_ssh_key(&store).await.unwrap();
	assert_eq!(key.as_deref(), Some("FROM-SECRET"));
    }

    #[tokio::test]
    async fn broken_secret_does_not_fall_back_to_cleartext() {
	let store = FakeSecrets::default();
	let mut spec = spec();
	spec.git_ssh_key = Some(String::from("CLEARTEXT"));
	spec.git_ssh_key_secret = Some(String::from("secret://deploy-key/private-ssh-key"));

	let config = ConfigSnapshot::from(&spec);
	assert!(config.resolve_ssh_key(&store).await.is_err());
    }

    #[tokio::test]
    async fn cleartext_key_is_used_and_warned_about() {
	let store = FakeSecrets::default();
	let mut spec = spec();
	spec.git_ssh_key = Some(String::from("CLEARTEXT"));

	let config = ConfigSnapshot::from(&spec);
	assert_eq!(config.resolve_ssh_key(&store).await.unwrap().as_deref(), Some("CLEARTEXT"));
	assert_eq!(config.warnings(), vec![String::from(CLEARTEXT_KEY_WARNING)]);
    }

    #[test]
    fn content_dirs_live_under_the_repo() {
	let config = ConfigSnapshot::from(&spec());
	let repo = Path::new("/git/repo");
	assert_eq!(config.content_dir(CollaboratorKind::LokiRules, repo),
		   PathBuf::from("/git/repo/loki_alert_rules"));
	assert_eq!(config.content_dir(CollaboratorKind::GrafanaDashboards, repo),
		   PathBuf::from("/git/repo/grafana_dashboards"));
    }
}
