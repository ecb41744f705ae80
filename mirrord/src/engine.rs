/*
 * ReconciliationEngine: the convergence function run on every event.
 *
 * Each pass derives its state from scratch out of the container, the peer
 * state and the configuration, and drives them toward the configuration:
 *
 *   1. container unreachable            -> WaitingForContainer
 *   2. no peer relation yet             -> WaitingForPeerRelation
 *   3. shared state unseeded, follower  -> WaitingForLeaderInit
 *   4. git_repo unset                   -> stop, wipe, republish, Blocked
 *   5. (re)start git-sync if its definition changed or it is not running
 *   6. republish + commit when the checkout fingerprint changed (leader)
 *   7. no content yet                   -> Blocked, otherwise Active
 *
 * Nothing is retried here; the next event runs the next pass.
 */

use crate::cmdline::CommandLineBuilder;
use crate::cmdline::REPO_SUBDIR;
use crate::cmdline::SSH_KEY_FILE;
use crate::cmdline::SyncMode;
use crate::config::ConfigSnapshot;
use crate::errors::Error;
use crate::errors::Result;
use crate::fingerprint::Fingerprint;
use crate::fingerprint::FingerprintTracker;
use crate::fingerprint::Observation;
use crate::notifier::CollaboratorKind;
use crate::notifier::DownstreamNotifier;
use crate::notifier::Publisher;
use crate::peers::PeerStore;
use crate::secrets::SecretStore;
use crate::sidecar::SidecarController;
use crate::workload::ExecOutput;
use crate::workload::Startup;
use crate::workload::Workload;
use crate::workload::WorkloadProcessSpec;

use gitmirror_api as api;
use log;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub const SERVICE_NAME: &str = "git-sync";

pub const KNOWN_HOSTS_FILE: &str = "/etc/git-secret/known_hosts";

pub const CONFIG_MISSING: &str = "Config options missing - set git_repo on the GitMirror resource";
pub const NO_CONTENT: &str = "No hash file yet - confirm config is valid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationResult {
    WaitingForContainer,
    WaitingForPeerRelation,
    WaitingForLeaderInit,
    Blocked(String),
    Active,
}

impl ReconciliationResult {

    pub fn state(&self) -> api::MirrorUnitState {
	match self {
	    ReconciliationResult::WaitingForContainer
		| ReconciliationResult::WaitingForPeerRelation
		| ReconciliationResult::WaitingForLeaderInit => api::MirrorUnitState::MAINTENANCE,
	    ReconciliationResult::Blocked(_) => api::MirrorUnitState::BLOCKED,
	    ReconciliationResult::Active => api::MirrorUnitState::ACTIVE,
	}
    }

    pub fn message(&self) -> String {
	match self {
	    ReconciliationResult::WaitingForContainer => String::from("Waiting for pod startup to complete"),
	    ReconciliationResult::WaitingForPeerRelation => String::from("Waiting for peer relation to be created"),
	    ReconciliationResult::WaitingForLeaderInit => String::from("Waiting for the leader to initialize shared state"),
	    ReconciliationResult::Blocked(reason) => reason.clone(),
	    ReconciliationResult::Active => String::new(),
	}
    }
}

/*
 * What one pass ended up with, plus configuration warnings to surface in
 * the unit status.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub result: ReconciliationResult,
    pub warnings: Vec<String>,
}

impl From<ReconciliationResult> for PassReport {
    fn from(result: ReconciliationResult) -> Self {
	PassReport{
	    result,
	    warnings: Vec::new(),
	}
    }
}

impl PassReport {
    pub fn message(&self) -> String {
	let mut parts = vec![self.result.message()];
	parts.extend(self.warnings.iter().cloned());
	parts.retain(|part| !part.is_empty());
	parts.join("; ")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Sync error: {message}")]
pub struct SyncError {
    pub message: String,
    pub details: Option<String>,
}

impl SyncError {
    fn new(message: &str, details: Option<String>) -> Self {
	Self{
	    message: message.to_string(),
	    details,
	}
    }
}

/*
 * Result of the on-demand sync action
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub succeeded: bool,
    pub message: Option<String>,
    pub log: Vec<String>,
    pub stdout: Option<String>,
}

impl ActionOutcome {

    fn failed(message: &str, log: Vec<String>) -> Self {
	Self{
	    succeeded: false,
	    message: Some(message.to_string()),
	    log,
	    stdout: None,
	}
    }

    pub fn record(self, request: &str) -> api::SyncRecord {
	api::SyncRecord{
	    request: request.to_string(),
	    succeeded: self.succeeded,
	    message: self.message,
	    log: self.log,
	    stdout: self.stdout,
	}
    }
}

/*
 * Static knobs of the engine, fixed for the life of the process.
 */
#[derive(Debug, Clone)]
pub struct EngineSettings {
    // git-sync, inside the workload
    pub binary: String,

    // mount point of the mirror volume as seen by git-sync
    pub sidecar_root: String,

    // same volume, as seen by this process
    pub local_root: PathBuf,

    // passed to every git-sync invocation
    pub environment: BTreeMap<String, String>,
}

impl EngineSettings {

    /*
     * https_proxy, http_proxy and no_proxy from our own environment, always
     * present (possibly empty) so the service definition stays stable.
     */
    pub fn proxy_environment() -> BTreeMap<String, String> {
	let mut environment = BTreeMap::new();
	for (ours, theirs) in [("HTTPS_PROXY", "https_proxy"), ("HTTP_PROXY", "http_proxy"), ("NO_PROXY", "no_proxy")] {
	    let value = std::env::var(ours)
		.or_else(|_| std::env::var(theirs))
		.unwrap_or_default();
	    environment.insert(theirs.to_string(), value);
	}
	environment
    }
}

/*
 * `git@host:org/repo`, `git+ssh://user@host/org/repo`
 */
fn ssh_remote(repo: &str) -> Option<String> {
    let remote = Regex::new(r"@(.+?)[:/]").ok()?;
    remote.captures(repo)
	.and_then(|caps| caps.get(1))
	.map(|host| host.as_str().to_string())
}

fn workload_version(output: &str) -> Option<String> {
    let version = Regex::new(r"v(\d*\.\d*\.\d*)").ok()?;
    version.captures(output)
	.and_then(|caps| caps.get(1))
	.map(|v| v.as_str().to_string())
}

pub struct ReconciliationEngine {
    sidecar: SidecarController,
    cmdline: CommandLineBuilder,
    environment: BTreeMap<String, String>,

    peers: Arc<dyn PeerStore>,
    secrets: Arc<dyn SecretStore>,
    notifier: DownstreamNotifier,
}

impl ReconciliationEngine {

    pub fn new(settings: EngineSettings,
	       workload: Arc<dyn Workload>,
	       peers: Arc<dyn PeerStore>,
	       secrets: Arc<dyn SecretStore>,
	       publisher: Arc<dyn Publisher>) -> Self {
	let repo_path = settings.local_root.join(REPO_SUBDIR);

	Self{
	    sidecar: SidecarController::new(workload, SERVICE_NAME, &repo_path),
	    cmdline: CommandLineBuilder::new(&settings.binary, &settings.sidecar_root),
	    environment: settings.environment,

	    peers,
	    secrets,
	    notifier: DownstreamNotifier::new(publisher),
	}
    }

    fn repo_path(&self) -> &Path {
	self.sidecar.repo_path()
    }

    fn content_dirs(&self, config: &ConfigSnapshot) -> Vec<(CollaboratorKind, PathBuf)> {
	CollaboratorKind::ALL.into_iter()
	    .map(|kind| (kind, config.content_dir(kind, self.repo_path())))
	    .collect()
    }

    fn desired_spec(&self, command: Vec<String>) -> WorkloadProcessSpec {
	WorkloadProcessSpec{
	    name: String::from(SERVICE_NAME),
	    command,
	    environment: self.environment.clone(),
	    startup: Startup::Disabled,
	}
    }

    /*
     * One reconciliation pass. Errors (kube, workload) abort the pass only;
     * the next event starts over from the durable state.
     */
    pub async fn reconcile(&self, config: &ConfigSnapshot) -> Result<PassReport> {
	if !self.sidecar.can_connect().await {
	    return Ok(ReconciliationResult::WaitingForContainer.into());
	}

	/* the peer relation hosts the hash, wait for it to come up */
	if !self.peers.relation_exists().await? {
	    return Ok(ReconciliationResult::WaitingForPeerRelation.into());
	}

	let tracker = FingerprintTracker::new(self.peers.as_ref());
	if tracker.stored().await? == Fingerprint::Uninitialized && !self.peers.is_leader().await? {
	    return Ok(ReconciliationResult::WaitingForLeaderInit.into());
	}

	let report = |result: ReconciliationResult| PassReport{
	    result,
	    warnings: config.warnings(),
	};

	if !config.is_configured() {
	    self.unconfigure(&tracker, config).await?;
	    return Ok(report(ReconciliationResult::Blocked(String::from(CONFIG_MISSING))));
	}

	let ssh_key = match config.resolve_ssh_key(self.secrets.as_ref()).await {
	    Ok(key) => key,
	    Err(err) => {
		log::warn!("unable to resolve git_ssh_key_secret: {:?}", err);
		self.save_ssh_key(None).await?;
		return Ok(report(ReconciliationResult::Blocked(err.to_string())));
	    }
	};
	self.save_ssh_key(ssh_key.as_deref()).await?;

	let command = self.cmdline.build(config, ssh_key.as_deref(), SyncMode::Service)
	    .ok_or_else(|| Error::Other(String::from("git_repo is not set")))?;
	let desired = self.desired_spec(command);

	if self.sidecar.needs_restart(&desired).await? {
	    /*
	     * A sync failure here could be a temporary network error: keep
	     * the checkout and the published content as they are.
	     */
	    if ssh_key.is_some() {
		if let Err(err) = self.trust_ssh_remote(config).await {
		    log::error!("unable to trust the ssh remote: {}", err);
		    return Ok(report(ReconciliationResult::Blocked(format!("Sync failed: {}", err.message))));
		}
	    }

	    log::info!("(re)starting {}: {:?}", SERVICE_NAME, desired.command);
	    if let Err(err) = self.sidecar.restart(&desired).await {
		log::error!("{}", err);
		return Ok(report(ReconciliationResult::Blocked(err.to_string())));
	    }
	}

	self.update_fingerprint(&tracker, config).await?;

	if tracker.stored().await?.has_content() {
	    Ok(report(ReconciliationResult::Active))
	} else {
	    Ok(report(ReconciliationResult::Blocked(String::from(NO_CONTENT))))
	}
    }

    /*
     * A collaborator just related to us: give it the current content, then
     * converge as usual.
     */
    pub async fn relation_joined(&self, kind: CollaboratorKind, config: &ConfigSnapshot) -> Result<PassReport> {
	if self.sidecar.can_connect().await && self.peers.is_leader().await? {
	    self.notifier.publish(kind, &config.content_dir(kind, self.repo_path())).await;
	}
	self.reconcile(config).await
    }

    /*
     * The on-demand action: run git-sync once, outside of the service, then
     * always go through a full pass so status and fingerprint stay
     * consistent whatever the outcome of the sync.
     */
    pub async fn sync_now(&self, config: &ConfigSnapshot) -> Result<(ActionOutcome, PassReport)> {
	let (outcome, failure) = self.one_shot(config).await;
	let mut report = self.reconcile(config).await?;

	if let Some(err) = failure {
	    if report.result == ReconciliationResult::Active {
		report.result = ReconciliationResult::Blocked(format!("Sync failed: {}", err.message));
	    }
	}
	Ok((outcome, report))
    }

    /*
     * git-sync's version, when the container can be reached.
     */
    pub async fn workload_version(&self) -> Option<String> {
	if !self.sidecar.can_connect().await {
	    return None;
	}
	match self.sidecar.exec(&self.cmdline.version(), &BTreeMap::new()).await {
	    Ok(output) => workload_version(&output.stdout).or_else(|| workload_version(&output.stderr)),
	    Err(err) => {
		log::debug!("Cannot get git-sync version: {}", err);
		None
	    }
	}
    }

    async fn unconfigure(&self, tracker: &FingerprintTracker<'_>, config: &ConfigSnapshot) -> Result<()> {
	self.sidecar.stop().await;
	self.sidecar.wipe_working_directory().await;
	self.update_fingerprint(tracker, config).await
    }

    /*
     * Notify first, commit second: a crash in between means one more
     * (idempotent) republish on the next pass, never a missed one.
     */
    async fn update_fingerprint(&self, tracker: &FingerprintTracker<'_>, config: &ConfigSnapshot) -> Result<()> {
	let current = self.sidecar.read_marker().await;

	if let Observation::Changed{ previous, current } = tracker.observe(&current).await? {
	    if !self.peers.is_leader().await? {
		return Ok(());
	    }

	    log::info!("Updating stored hash: git-sync hash changed from {:?} to {:?}", previous, current);
	    self.notifier.publish_all(&self.content_dirs(config)).await;
	    tracker.commit(&current).await?;
	}
	Ok(())
    }

    /*
     * The key file is rewritten on every pass; an empty file wipes a
     * previous key.
     */
    async fn save_ssh_key(&self, key: Option<&str>) -> Result<()> {
	self.sidecar.push(Path::new(SSH_KEY_FILE), key.unwrap_or_default(), 0o600).await?;
	Ok(())
    }

    async fn trust_ssh_remote(&self, config: &ConfigSnapshot) -> std::result::Result<(), SyncError> {
	let remote = match config.repo().and_then(ssh_remote) {
	    Some(remote) => remote,
	    None => return Ok(()),
	};
	log::debug!("remote extracted from the repo: {}", remote);

	let command = vec![String::from("ssh-keyscan"), remote.clone()];
	let output = self.exec_checked(&command).await?;
	if let Err(err) = self.sidecar.push(Path::new(KNOWN_HOSTS_FILE), &output.stdout, 0o644).await {
	    return Err(SyncError::new(&err.to_string(), None));
	}
	log::info!("{} public keys added to known_hosts", remote);
	Ok(())
    }

    async fn exec_checked(&self, command: &[String]) -> std::result::Result<ExecOutput, SyncError> {
	let output = match self.sidecar.exec(command, &self.environment).await {
	    Ok(output) => output,
	    Err(err) => return Err(SyncError::new(&err.to_string(), None)),
	};

	if output.exit_code != 0 {
	    let message = format!("Exited with code {}.", output.exit_code);
	    return Err(SyncError::new(&message, Some(output.stderr)));
	}
	Ok(output)
    }

    async fn one_shot(&self, config: &ConfigSnapshot) -> (ActionOutcome, Option<SyncError>) {
	if !self.sidecar.can_connect().await {
	    return (ActionOutcome::failed("Container not ready", Vec::new()), None);
	}
	if !config.is_configured() {
	    return (ActionOutcome::failed("Config options missing", Vec::new()), None);
	}

	let mut lines = vec![String::from("Calling git-sync with --one-time...")];

	let ssh_key = match config.resolve_ssh_key(self.secrets.as_ref()).await {
	    Ok(key) => key,
	    Err(err) => return (ActionOutcome::failed(&err.to_string(), lines), None),
	};
	if let Err(err) = self.save_ssh_key(ssh_key.as_deref()).await {
	    return (ActionOutcome::failed(&err.to_string(), lines), None);
	}
	let command = match self.cmdline.build(config, ssh_key.as_deref(), SyncMode::OneShot) {
	    Some(command) => command,
	    None => return (ActionOutcome::failed("Config options missing", lines), None),
	};

	match self.exec_checked(&command).await {
	    Ok(output) => {
		for line in output.stderr.lines() {
		    log::info!("git-sync: {}", line.trim());
		    lines.push(format!("Warning: {}", line.trim()));
		}
		let outcome = ActionOutcome{
		    succeeded: true,
		    message: None,
		    log: lines,
		    stdout: Some(output.stdout),
		};
		(outcome, None)
	    },
	    Err(err) => {
		if let Some(details) = &err.details {
		    lines.extend(details.lines().map(|line| line.trim().to_string()));
		}
		(ActionOutcome::failed(&err.to_string(), lines), Some(err))
	    }
	}
    }
}
