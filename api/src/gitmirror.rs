use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/*
 * Default subdirectories (relative to the repository root) where the
 * collaborators' content is expected to be found.
 */
pub const DEFAULT_PROMETHEUS_ALERT_RULES_PATH: &str = "prometheus_alert_rules";
pub const DEFAULT_LOKI_ALERT_RULES_PATH: &str = "loki_alert_rules";
pub const DEFAULT_GRAFANA_DASHBOARDS_PATH: &str = "grafana_dashboards";

/* seconds between two git-sync polls when running as a service */
pub const DEFAULT_GIT_WAIT: u64 = 60;

fn default_prometheus_alert_rules_path() -> String {
    String::from(DEFAULT_PROMETHEUS_ALERT_RULES_PATH)
}

fn default_loki_alert_rules_path() -> String {
    String::from(DEFAULT_LOKI_ALERT_RULES_PATH)
}

fn default_grafana_dashboards_path() -> String {
    String::from(DEFAULT_GRAFANA_DASHBOARDS_PATH)
}

fn default_git_wait() -> u64 {
    DEFAULT_GIT_WAIT
}

/*
 * GitMirror holds the user declared configuration of one application. Every
 * unit of the application reads the same object, but only the leader ever
 * writes application-scoped state derived from it.
 *
 *   kind: GitMirror
 *   metadata:
 *     name: cos-config
 *   spec:
 *     git_repo: https://github.com/example/observability.git
 *     git_branch: main
 *     git_ssh_key_secret: secret://deploy-key/private-ssh-key
 */
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "runfc.br", version = "v1alpha", kind = "GitMirror", namespaced)]
pub struct GitMirrorSpec {

    // the repository to mirror; nothing runs until this is set
    pub git_repo: Option<String>,

    pub git_branch: Option<String>,

    // a tag or a commit hash to pin the checkout to
    pub git_rev: Option<String>,

    // clone depth, only applied when strictly positive
    pub git_depth: Option<i64>,

    #[serde(default = "default_git_wait")]
    pub git_wait: u64,

    /*
     * Cleartext private key. Discouraged: it ends up in the object itself,
     * prefer git_ssh_key_secret.
     */
    pub git_ssh_key: Option<String>,

    // secret://<secret-name>/<key>
    pub git_ssh_key_secret: Option<String>,

    #[serde(default = "default_prometheus_alert_rules_path")]
    pub prometheus_alert_rules_path: String,

    #[serde(default = "default_loki_alert_rules_path")]
    pub loki_alert_rules_path: String,

    #[serde(default = "default_grafana_dashboards_path")]
    pub grafana_dashboards_path: String,
}

impl GitMirrorSpec {

    /*
     * A spec with nothing set but the defaults, used when the GitMirror object
     * does not exist (yet).
     */
    pub fn unset() -> Self {
	Self{
	    git_wait: DEFAULT_GIT_WAIT,
	    prometheus_alert_rules_path: default_prometheus_alert_rules_path(),
	    loki_alert_rules_path: default_loki_alert_rules_path(),
	    grafana_dashboards_path: default_grafana_dashboards_path(),
	    ..Default::default()
	}
    }

    pub fn with_repo(repo: &str) -> Self {
	Self{
	    git_repo: Some(repo.to_string()),
	    ..Self::unset()
	}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_fields_take_their_defaults() {
	let spec: GitMirrorSpec = serde_json::from_value(serde_json::json!({
	    "git_repo": "https://github.com/example/observability.git",
	    "git_branch": "main",
	})).unwrap();

	assert_eq!(spec.git_repo.as_deref(), Some("https://github.com/example/observability.git"));
	assert_eq!(spec.git_wait, DEFAULT_GIT_WAIT);
	assert_eq!(spec.loki_alert_rules_path, DEFAULT_LOKI_ALERT_RULES_PATH);
	assert_eq!(spec.git_ssh_key_secret, None);
    }

    #[test]
    fn unset_is_empty_with_defaults() {
	let spec = GitMirrorSpec::unset();
	assert_eq!(spec.git_repo, None);
	assert_eq!(spec.grafana_dashboards_path, DEFAULT_GRAFANA_DASHBOARDS_PATH);
	assert_eq!(GitMirrorSpec::with_repo("r").git_repo.as_deref(), Some("r"));
    }
}
