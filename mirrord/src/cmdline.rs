/*
 * Builds git-sync's command line out of a ConfigSnapshot.
 *
 * The output must be stable: the engine compares it with the command line
 * of the running service to decide whether a restart is needed, so equal
 * snapshots have to yield identical argument lists.
 *
 * See https://github.com/kubernetes/git-sync.
 */

use crate::config::ConfigSnapshot;

/*
 * Directory name under --root (passed to --dest) where the repository is
 * checked out. Keeping it apart from the mount point means the checkout can
 * be wiped without touching the mount itself.
 */
pub const REPO_SUBDIR: &str = "repo";

pub const GIT_SYNC_PORT: u16 = 9000;

pub const SSH_KEY_FILE: &str = "/run/gitmirror-ssh-key.priv";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /* long running, polling every `wait` seconds and serving HTTP */
    Service,

    /* sync once and exit */
    OneShot,
}

#[derive(Debug, Clone)]
pub struct CommandLineBuilder {
    binary: String,
    root: String,
}

impl CommandLineBuilder {

    /*
     * `root` is the mount point of the mirror volume as seen from the
     * sidecar.
     */
    pub fn new(binary: &str, root: &str) -> Self {
	Self{
	    binary: binary.to_string(),
	    root: root.to_string(),
	}
    }

    /*
     * Returns None when git_repo is unset: callers are expected to check
     * is_configured() first.
     */
    pub fn build(&self, config: &ConfigSnapshot, ssh_key: Option<&str>, mode: SyncMode) -> Option<Vec<String>> {
	let repo = config.repo()?;

	let mut cmd = vec![self.binary.clone()];
	cmd.extend([String::from("--repo"), repo.to_string()]);
	if let Some(branch) = &config.branch {
	    cmd.extend([String::from("--branch"), branch.clone()]);
	}
	if let Some(rev) = &config.rev {
	    cmd.extend([String::from("--rev"), rev.clone()]);
	}
	if let Some(depth) = config.depth.filter(|depth| *depth > 0) {
	    cmd.extend([String::from("--depth"), depth.to_string()]);
	}
	cmd.extend([
	    String::from("--root"), self.root.clone(),
	    String::from("--dest"), String::from(REPO_SUBDIR),
	]);

	if ssh_key.is_some_and(|key| !key.is_empty()) {
	    cmd.push(String::from("--ssh"));
	    cmd.extend([String::from("--ssh-key-file"), String::from(SSH_KEY_FILE)]);
	}

	match mode {
	    SyncMode::Service => {
		cmd.extend([String::from("--wait"), config.wait.to_string()]);
		cmd.extend([String::from("--http-bind"), format!(":{}", GIT_SYNC_PORT)]);
	    },
	    SyncMode::OneShot => cmd.push(String::from("--one-time")),
	}

	Some(cmd)
    }

    pub fn version(&self) -> Vec<String> {
	vec![self.binary.clone(), String::from("--version")]
    }
}
