/*
 * The workload container, as seen by the engine: a place where services can
 * be defined, started and stopped, where one-off commands can be executed
 * and where files can be pushed.
 *
 * LocalWorkload is the implementation used in production: the daemon runs in
 * the same pod as git-sync's image content and shares the mirror volume with
 * it, so it supervises git-sync as a child process.
 */

use async_trait::async_trait;
use log;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Startup {
    /* started as soon as it is defined */
    Enabled,

    /* only started explicitly */
    Disabled,
}

/*
 * Desired running-service descriptor; compared by value against the running
 * one to decide whether a restart is needed.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadProcessSpec {
    pub name: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub startup: Startup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub spec: WorkloadProcessSpec,
    pub running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /* -1 when the process was killed by a signal */
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Error, Debug)]
pub enum WorkloadError {

    #[error("service '{0}' is not defined")]
    UnknownService(String),

    #[error("empty command line")]
    EmptyCommand,

    #[error("service '{0}' exited right after start: {1}")]
    Exited(String, String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Workload: Send + Sync {

    async fn can_connect(&self) -> bool;

    async fn service(&self, name: &str) -> Result<Option<ServiceInfo>, WorkloadError>;

    /*
     * Installs (or replaces) a service definition. A running process is
     * left alone until the next stop/start.
     */
    async fn replace_service(&self, spec: &WorkloadProcessSpec) -> Result<(), WorkloadError>;

    async fn start(&self, name: &str) -> Result<(), WorkloadError>;

    async fn stop(&self, name: &str) -> Result<(), WorkloadError>;

    /*
     * Runs `command` to completion. A non-zero exit is not an error here,
     * callers inspect ExecOutput::exit_code.
     */
    async fn exec(&self, command: &[String], environment: &BTreeMap<String, String>) -> Result<ExecOutput, WorkloadError>;

    async fn push(&self, path: &Path, content: &str, mode: u32) -> Result<(), WorkloadError>;
}

struct Managed {
    spec: WorkloadProcessSpec,
    child: Option<Child>,
}

impl Managed {
    fn is_running(&mut self) -> bool {
	match self.child.as_mut() {
	    Some(child) => matches!(child.try_wait(), Ok(None)),
	    None => false,
	}
    }
}

pub struct LocalWorkload {
    binary: PathBuf,
    startup_grace: Duration,
    services: Mutex<BTreeMap<String, Managed>>,
}

fn command_for(command: &[String], environment: &BTreeMap<String, String>) -> Result<Command, WorkloadError> {
    let (program, args) = command.split_first().ok_or(WorkloadError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args).envs(environment);
    Ok(cmd)
}

impl LocalWorkload {

    /*
     * `binary` is git-sync itself: the workload counts as reachable once
     * it is in place. A started service must survive `startup_grace` to
     * count as running.
     */
    pub fn new(binary: &Path, startup_grace: Duration) -> Self {
	Self{
	    binary: binary.to_path_buf(),
	    startup_grace,
	    services: Mutex::new(BTreeMap::new()),
	}
    }
}

#[async_trait]
impl Workload for LocalWorkload {
    async fn can_connect(&self) -> bool {
	tokio::fs::metadata(&self.binary).await.is_ok()
    }

    async fn service(&self, name: &str) -> Result<Option<ServiceInfo>, WorkloadError> {
	let mut services = self.services.lock().await;
	let info = services.get_mut(name).map(|managed| ServiceInfo{
	    running: managed.is_running(),
	    spec: managed.spec.clone(),
	});
	Ok(info)
    }

    async fn replace_service(&self, spec: &WorkloadProcessSpec) -> Result<(), WorkloadError> {
	{
	    let mut services = self.services.lock().await;
	    match services.get_mut(&spec.name) {
		Some(managed) => managed.spec = spec.clone(),
		None => {
		    services.insert(spec.name.clone(), Managed{
			spec: spec.clone(),
			child: None,
		    });
		}
	    };
	}

	if spec.startup == Startup::Enabled {
	    self.start(&spec.name).await?;
	}
	Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), WorkloadError> {
	let mut services = self.services.lock().await;
	let managed = services.get_mut(name).ok_or_else(|| WorkloadError::UnknownService(name.to_string()))?;
	if managed.is_running() {
	    return Ok(());
	}

	let mut cmd = command_for(&managed.spec.command, &managed.spec.environment)?;
	let mut child = cmd.stdin(Stdio::null()).kill_on_drop(true).spawn()?;
	log::debug!("started {} with pid {:?}", name, child.id());

	tokio::time::sleep(self.startup_grace).await;
	if let Some(status) = child.try_wait()? {
	    return Err(WorkloadError::Exited(name.to_string(), status.to_string()));
	}
	managed.child = Some(child);
	Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), WorkloadError> {
	let mut services = self.services.lock().await;
	let managed = services.get_mut(name).ok_or_else(|| WorkloadError::UnknownService(name.to_string()))?;
	if let Some(mut child) = managed.child.take() {
	    child.kill().await?;
	}
	Ok(())
    }

    async fn exec(&self, command: &[String], environment: &BTreeMap<String, String>) -> Result<ExecOutput, WorkloadError> {
	let output = command_for(command, environment)?
	    .stdin(Stdio::null())
	    .output()
	    .await?;

	Ok(ExecOutput{
	    exit_code: output.status.code().unwrap_or(-1),
	    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
	    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
	})
    }

    async fn push(&self, path: &Path, content: &str, mode: u32) -> Result<(), WorkloadError> {
	if let Some(parent) = path.parent() {
	    tokio::fs::create_dir_all(parent).await?;
	}
	tokio::fs::write(path, content).await?;
	tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
	Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(args: &[&str]) -> Vec<String> {
	args.iter().map(|arg| arg.to_string()).collect()
    }

    fn workload() -> LocalWorkload {
	LocalWorkload::new(Path::new("/bin/sh"), Duration::from_millis(300))
    }

    fn service(command: &[&str]) -> WorkloadProcessSpec {
	WorkloadProcessSpec{
	    name: String::from("git-sync"),
	    command: strings(command),
	    environment: BTreeMap::new(),
	    startup: Startup::Disabled,
	}
    }

    #[tokio::test]
    async fn reachable_only_when_binary_exists() {
	assert!(workload().can_connect().await);
	let missing = LocalWorkload::new(Path::new("/nonexistent/git-sync"), Duration::ZERO);
	assert!(!missing.can_connect().await);
    }

    #[tokio::test]
    async fn services_are_not_started_on_definition() {
	let workload = workload();
	assert_eq!(workload.service("git-sync").await.unwrap(), None);

	workload.replace_service(&service(&["sleep", "30"])).await.unwrap();
	let info = workload.service("git-sync").await.unwrap().unwrap();
	assert!(!info.running);
	assert_eq!(info.spec.command, strings(&["sleep", "30"]));
    }

    #[tokio::test]
    async fn enabled_services_start_on_definition() {
	let workload = workload();
	let mut spec = service(&["sleep", "30"]);
	spec.startup = Startup::Enabled;

	workload.replace_service(&spec).await.unwrap();
	assert!(workload.service("git-sync").await.unwrap().unwrap().running);
	workload.stop("git-sync").await.unwrap();
    }

    #[tokio::test]
    async fn start_and_stop() {
	let workload = workload();
	workload.replace_service(&service(&["sleep", "30"])).await.unwrap();

	workload.start("git-sync").await.unwrap();
	assert!(workload.service("git-sync").await.unwrap().unwrap().running);

	workload.stop("git-sync").await.unwrap();
	assert!(!workload.service("git-sync").await.unwrap().unwrap().running);
    }

    #[tokio::test]
    async fn start_fails_when_process_dies() {
	let workload = workload();
	workload.replace_service(&service(&["sh", "-c", "exit 2"])).await.unwrap();
	assert!(matches!(workload.start("git-sync").await, Err(WorkloadError::Exited(_, _))));
	assert!(matches!(workload.start("other").await, Err(WorkloadError::UnknownService(_))));
    }

    #[tokio::test]
    async fn exec_reports_exit_code_and_output() {
	let workload = workload();
	let output = workload.exec(&strings(&["sh", "-c", "echo out; echo err >&2; exit 3"]), &BTreeMap::new()).await.unwrap();
	assert_eq!(output.exit_code, 3);
	assert_eq!(output.stdout, "out\n");
	assert_eq!(output.stderr, "err\n");

	assert!(matches!(workload.exec(&[], &BTreeMap::new()).await, Err(WorkloadError::EmptyCommand)));
    }

    #[tokio::test]
    async fn exec_passes_environment() {
	let workload = workload();
	let mut env = BTreeMap::new();
	env.insert(String::from("https_proxy"), String::from("http://proxy:3128"));
	let output = workload.exec(&strings(&["sh", "-c", "printf %s \"$https_proxy\""]), &env).await.unwrap();
	assert_eq!(output.stdout, "http://proxy:3128");
    }

    #[tokio::test]
    async fn push_creates_parents_and_sets_mode() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("run").join("key.priv");

	workload().push(&path, "secret", 0o600).await.unwrap();
	assert_eq!(std::fs::read_to_string(&path).unwrap(), "secret");
	let mode = std::fs::metadata(&path).unwrap().permissions().mode();
	assert_eq!(mode & 0o777, 0o600);
    }
}
