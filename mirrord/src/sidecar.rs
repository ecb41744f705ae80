/*
 * SidecarController translates the engine's intents (ensure running with
 * this command line, stop, wipe the checkout) into operations against the
 * workload container.
 */

use crate::fingerprint::Fingerprint;
use crate::workload::ExecOutput;
use crate::workload::ServiceInfo;
use crate::workload::Workload;
use crate::workload::WorkloadError;
use crate::workload::WorkloadProcessSpec;

use log;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/* file written by git-sync inside the checkout, see fingerprint.rs */
pub const MARKER_FILE: &str = ".git";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceRestartError {

    #[error("Cannot (re)start service: container is not ready.")]
    ContainerNotReady,

    #[error("Cannot (re)start service: service \"{0}\" does not exist.")]
    NotDefined(String),

    #[error("Cannot (re)start service: service \"{0}\" is not running: {1}")]
    NotRunning(String, String),
}

pub struct SidecarController {
    workload: Arc<dyn Workload>,
    service: String,

    // the checkout, as seen from this process
    repo_path: PathBuf,
}

impl SidecarController {

    pub fn new(workload: Arc<dyn Workload>, service: &str, repo_path: &Path) -> Self {
	Self{
	    workload,
	    service: service.to_string(),
	    repo_path: repo_path.to_path_buf(),
	}
    }

    pub fn repo_path(&self) -> &Path {
	&self.repo_path
    }

    pub async fn can_connect(&self) -> bool {
	self.workload.can_connect().await
    }

    pub async fn current_spec(&self) -> Result<Option<ServiceInfo>, WorkloadError> {
	self.workload.service(&self.service).await
    }

    /*
     * A restart is needed when the service is missing, not running, or
     * running with a different definition.
     */
    pub async fn needs_restart(&self, desired: &WorkloadProcessSpec) -> Result<bool, WorkloadError> {
	let needed = match self.current_spec().await? {
	    Some(current) => !current.running || &current.spec != desired,
	    None => true,
	};
	Ok(needed)
    }

    pub async fn apply(&self, spec: &WorkloadProcessSpec) -> Result<(), WorkloadError> {
	self.workload.replace_service(spec).await
    }

    /*
     * Stopping a service that is not running (or not even defined) is not
     * a failure.
     */
    pub async fn stop(&self) {
	if let Err(err) = self.workload.stop(&self.service).await {
	    log::debug!("stop {}: {}", self.service, err);
	}
    }

    pub async fn start(&self) -> Result<(), ServiceRestartError> {
	if !self.can_connect().await {
	    return Err(ServiceRestartError::ContainerNotReady);
	}

	match self.current_spec().await {
	    Ok(Some(_)) => {},
	    Ok(None) => return Err(ServiceRestartError::NotDefined(self.service.clone())),
	    Err(err) => return Err(ServiceRestartError::NotRunning(self.service.clone(), err.to_string())),
	}

	if let Err(err) = self.workload.start(&self.service).await {
	    return Err(ServiceRestartError::NotRunning(self.service.clone(), err.to_string()));
	}

	match self.current_spec().await {
	    Ok(Some(info)) if info.running => Ok(()),
	    Ok(_) => Err(ServiceRestartError::NotRunning(self.service.clone(), String::from("exited after start"))),
	    Err(err) => Err(ServiceRestartError::NotRunning(self.service.clone(), err.to_string())),
	}
    }

    /*
     * stop -> wipe -> install -> start. The wipe makes sure a branch or
     * revision change cannot leave files from the previous checkout behind.
     */
    pub async fn restart(&self, spec: &WorkloadProcessSpec) -> Result<(), ServiceRestartError> {
	self.stop().await;
	self.wipe_working_directory().await;
	if let Err(err) = self.apply(spec).await {
	    return Err(ServiceRestartError::NotRunning(self.service.clone(), err.to_string()));
	}
	self.start().await
    }

    /*
     * Best effort: a missing directory is fine, anything else is logged.
     */
    pub async fn wipe_working_directory(&self) {
	match tokio::fs::remove_dir_all(&self.repo_path).await {
	    Ok(()) => log::debug!("removed {}", self.repo_path.display()),
	    Err(err) if err.kind() == ErrorKind::NotFound => {},
	    Err(err) => log::warn!("unable to remove {}: {}", self.repo_path.display(), err),
	}
    }

    /*
     * The fingerprint of the current checkout; Placeholder whenever the
     * marker cannot be read.
     */
    pub async fn read_marker(&self) -> Fingerprint {
	if !self.can_connect().await {
	    log::warn!("cannot read hash file: git-sync container is not ready");
	    return Fingerprint::Placeholder;
	}

	let path = self.repo_path.join(MARKER_FILE);
	match tokio::fs::read_to_string(&path).await {
	    Ok(contents) => Fingerprint::from_marker(&contents),
	    Err(err) => {
		log::debug!("Error reading hash file {}: {}", path.display(), err);
		Fingerprint::Placeholder
	    }
	}
    }

    pub async fn exec(&self, command: &[String], environment: &BTreeMap<String, String>) -> Result<ExecOutput, WorkloadError> {
	self.workload.exec(command, environment).await
    }

    pub async fn push(&self, path: &Path, content: &str, mode: u32) -> Result<(), WorkloadError> {
	self.workload.push(path, content, mode).await
    }
}
