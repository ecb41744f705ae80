/*
 * In-memory stand-ins for the workload container, the peer state, the
 * secret store and the collaborators.
 */

use crate::errors::Error;
use crate::errors::Result;
use crate::notifier::CollaboratorKind;
use crate::notifier::Publisher;
use crate::peers::PeerStore;
use crate::secrets::SecretError;
use crate::secrets::SecretStore;
use crate::workload::ExecOutput;
use crate::workload::ServiceInfo;
use crate::workload::Workload;
use crate::workload::WorkloadError;
use crate::workload::WorkloadProcessSpec;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Default)]
struct WorkloadState {
    reachable: bool,
    refuse_start: bool,
    services: BTreeMap<String, ServiceInfo>,
    ops: Vec<String>,
    execs: Vec<Vec<String>>,
    responses: BTreeMap<String, std::result::Result<ExecOutput, String>>,
    files: BTreeMap<PathBuf, (String, u32)>,
}

#[derive(Default)]
pub struct FakeWorkload {
    state: Mutex<WorkloadState>,
}

impl FakeWorkload {

    pub fn reachable() -> Self {
	let workload = Self::default();
	workload.set_reachable(true);
	workload
    }

    pub fn unreachable() -> Self {
	Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
	self.state.lock().unwrap().reachable = reachable;
    }

    /* the service comes up and dies right away */
    pub fn refuse_to_start(&self) {
	self.state.lock().unwrap().refuse_start = true;
    }

    pub fn crash(&self, name: &str) {
	if let Some(info) = self.state.lock().unwrap().services.get_mut(name) {
	    info.running = false;
	}
    }

    /* canned result for commands whose program is `program` */
    pub fn respond(&self, program: &str, response: std::result::Result<ExecOutput, String>) {
	self.state.lock().unwrap().responses.insert(program.to_string(), response);
    }

    pub fn ops(&self) -> Vec<String> {
	self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
	self.state.lock().unwrap().ops.clear();
    }

    pub fn execs(&self) -> Vec<Vec<String>> {
	self.state.lock().unwrap().execs.clone()
    }

    pub fn file(&self, path: &str) -> Option<(String, u32)> {
	self.state.lock().unwrap().files.get(Path::new(path)).cloned()
    }

    pub fn service_info(&self, name: &str) -> Option<ServiceInfo> {
	self.state.lock().unwrap().services.get(name).cloned()
    }
}

#[async_trait]
impl Workload for FakeWorkload {
    async fn can_connect(&self) -> bool {
	self.state.lock().unwrap().reachable
    }

    async fn service(&self, name: &str) -> std::result::Result<Option<ServiceInfo>, WorkloadError> {
	Ok(self.service_info(name))
    }

    async fn replace_service(&self, spec: &WorkloadProcessSpec) -> std::result::Result<(), WorkloadError> {
	let mut state = self.state.lock().unwrap();
	state.ops.push(format!("replace {}", spec.name));
	let running = state.services.get(&spec.name).is_some_and(|info| info.running);
	state.services.insert(spec.name.clone(), ServiceInfo{ spec: spec.clone(), running });
	Ok(())
    }

    async fn start(&self, name: &str) -> std::result::Result<(), WorkloadError> {
	let mut state = self.state.lock().unwrap();
	state.ops.push(format!("start {}", name));
	let refuse = state.refuse_start;
	match state.services.get_mut(name) {
	    Some(info) => {
		info.running = !refuse;
		Ok(())
	    },
	    None => Err(WorkloadError::UnknownService(name.to_string())),
	}
    }

    async fn stop(&self, name: &str) -> std::result::Result<(), WorkloadError> {
	let mut state = self.state.lock().unwrap();
	state.ops.push(format!("stop {}", name));
	match state.services.get_mut(name) {
	    Some(info) => {
		info.running = false;
		Ok(())
	    },
	    None => Err(WorkloadError::UnknownService(name.to_string())),
	}
    }

    async fn exec(&self, command: &[String], _environment: &BTreeMap<String, String>) -> std::result::Result<ExecOutput, WorkloadError> {
	let mut state = self.state.lock().unwrap();
	state.execs.push(command.to_vec());
	let program = command.first().cloned().unwrap_or_default();
	match state.responses.get(&program) {
	    Some(Ok(output)) => Ok(output.clone()),
	    Some(Err(err)) => Err(WorkloadError::Io(std::io::Error::other(err.clone()))),
	    None => Ok(ExecOutput::default()),
	}
    }

    async fn push(&self, path: &Path, content: &str, mode: u32) -> std::result::Result<(), WorkloadError> {
	let mut state = self.state.lock().unwrap();
	state.files.insert(path.to_path_buf(), (content.to_string(), mode));
	Ok(())
    }
}

#[derive(Default)]
struct PeersState {
    leader: bool,
    relation: bool,
    data: BTreeMap<String, String>,
    writes: usize,
}

#[derive(Default)]
pub struct FakePeers {
    state: Mutex<PeersState>,
}

impl FakePeers {

    fn with(leader: bool, relation: bool) -> Self {
	let peers = Self::default();
	{
	    let mut state = peers.state.lock().unwrap();
	    state.leader = leader;
	    state.relation = relation;
	}
	peers
    }

    pub fn leader() -> Self {
	Self::with(true, true)
    }

    pub fn follower() -> Self {
	Self::with(false, true)
    }

    pub fn without_relation() -> Self {
	Self::with(true, false)
    }

    pub fn set_leader(&self, leader: bool) {
	self.state.lock().unwrap().leader = leader;
    }

    /* as if another unit (the leader) had written it */
    pub fn seed(&self, key: &str, value: &str) {
	self.state.lock().unwrap().data.insert(key.to_string(), value.to_string());
    }

    pub fn value(&self, key: &str) -> Option<String> {
	self.state.lock().unwrap().data.get(key).cloned()
    }

    pub fn writes(&self) -> usize {
	self.state.lock().unwrap().writes
    }
}

#[async_trait]
impl PeerStore for FakePeers {
    async fn relation_exists(&self) -> Result<bool> {
	Ok(self.state.lock().unwrap().relation)
    }

    async fn is_leader(&self) -> Result<bool> {
	Ok(self.state.lock().unwrap().leader)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
	Ok(self.value(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
	let mut state = self.state.lock().unwrap();
	state.writes += 1;
	state.data.insert(key.to_string(), value.to_string());
	Ok(())
    }
}

#[derive(Default)]
pub struct FakeSecrets {
    secrets: BTreeMap<String, BTreeMap<String, String>>,
    denied: BTreeSet<String>,
}

impl FakeSecrets {

    pub fn with(id: &str, key: &str, value: &str) -> Self {
	let mut store = Self::default();
	let mut content = BTreeMap::new();
	content.insert(key.to_string(), value.to_string());
	store.secrets.insert(id.to_string(), content);
	store
    }

    pub fn deny(&mut self, id: &str) {
	self.denied.insert(id.to_string());
    }
}

#[async_trait]
impl SecretStore for FakeSecrets {
    async fn content(&self, id: &str) -> std::result::Result<BTreeMap<String, String>, SecretError> {
	if self.denied.contains(id) {
	    return Err(SecretError::PermissionDenied(format!("secrets \"{}\" is forbidden", id)));
	}
	self.secrets.get(id)
	    .cloned()
	    .ok_or_else(|| SecretError::NotFound(id.to_string()))
    }
}

/*
 * Records every republish: the kind, the directory and whether it held any
 * file at the time.
 */
#[derive(Default)]
pub struct RecordingPublisher {
    calls: Mutex<Vec<(CollaboratorKind, PathBuf, bool)>>,
    failing: bool,
}

impl RecordingPublisher {

    pub fn failing() -> Self {
	Self{
	    failing: true,
	    ..Default::default()
	}
    }

    pub fn count(&self, kind: CollaboratorKind) -> usize {
	self.calls.lock().unwrap().iter().filter(|(k, _, _)| *k == kind).count()
    }

    pub fn total(&self) -> usize {
	self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<(CollaboratorKind, PathBuf, bool)> {
	self.calls.lock().unwrap().clone()
    }

    pub fn reset(&self) {
	self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn republish(&self, kind: CollaboratorKind, dir: &Path) -> Result<()> {
	let has_content = std::fs::read_dir(dir).map(|mut entries| entries.next().is_some()).unwrap_or(false);
	self.calls.lock().unwrap().push((kind, dir.to_path_buf(), has_content));
	if self.failing {
	    return Err(Error::Other(String::from("collaborator unavailable")));
	}
	Ok(())
    }
}
