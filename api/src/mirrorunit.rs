use kube::api::ObjectMeta;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/*
 * Annotation set on a MirrorUnit to request an on-demand sync. Its value is
 * an opaque request id; a request is served once per distinct id.
 */
pub const SYNC_NOW_ANNOTATION: &str = "gitmirror.runfc.br/sync-now";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MirrorUnitState {
    /*
     * The environment is not ready yet (container, peer relation or the
     * leader did not seed the shared state). Nothing to do but wait.
     */
    MAINTENANCE,

    /*
     * The unit needs a human: missing config, bad secret, a sync or a
     * restart that failed, or no content mirrored yet.
     */
    BLOCKED,

    /*
     * Content is mirrored and published
     */
    ACTIVE,

    /*
     * when we are leaving
     */
    LEAVING,
}

impl fmt::Display for MirrorUnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	let state = match self {
	    MirrorUnitState::MAINTENANCE => "maintenance",
	    MirrorUnitState::BLOCKED => "blocked",
	    MirrorUnitState::ACTIVE => "active",
	    MirrorUnitState::LEAVING => "leaving",
	};
	f.write_str(state)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(group = "runfc.br", version = "v1alpha", kind = "MirrorUnit", namespaced)]
#[serde(rename_all = "camelCase")]
#[kube(status = "MirrorUnitStatus")]
pub struct MirrorUnitSpec {

    // name of the GitMirror (application) this unit belongs to
    pub app: String,
}

impl MirrorUnit {

    /*
     * Returns the sync request id currently asked for, if any.
     */
    pub fn sync_request(&self) -> Option<String> {
	self.metadata.annotations.as_ref()
	    .and_then(|annotations| annotations.get(SYNC_NOW_ANNOTATION))
	    .filter(|request| !request.is_empty())
	    .cloned()
    }

    /*
     * Returns the id of the last sync request this unit has served.
     */
    pub fn served_request(&self) -> Option<String> {
	self.status.as_ref()
	    .and_then(|status| status.last_sync.as_ref())
	    .map(|sync| sync.request.clone())
    }

    pub fn has_pending_sync(&self) -> bool {
	match self.sync_request() {
	    Some(request) => self.served_request().as_deref() != Some(request.as_str()),
	    None => false,
	}
    }
}

pub fn new(name: &str, app: &str, labels: BTreeMap<String, String>) -> MirrorUnit {
    let mut metadata = ObjectMeta::default();
    metadata.name = Some(name.to_string());
    if !labels.is_empty() {
	metadata.labels = Some(labels);
    }

    MirrorUnit{
	metadata,
	spec: MirrorUnitSpec{
	    app: app.to_string(),
	},
	status: Some(MirrorUnitStatus::default()),
    }
}

/*
 * Outcome of the last on-demand sync served by a unit.
 */
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {

    // the annotation value this record answers
    pub request: String,

    pub succeeded: bool,

    // failure message when !succeeded
    pub message: Option<String>,

    // progress lines and git-sync's stderr
    pub log: Vec<String>,

    // git-sync's stdout, only on success
    pub stdout: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MirrorUnitStatus {

    // maintenance, blocked, active, leaving
    pub state: Option<String>,

    // human readable reason for the state
    pub message: Option<String>,

    // version of git-sync running in the workload
    pub workload_version: Option<String>,

    pub last_sync: Option<SyncRecord>,

    // When the object was last updated
    pub last_updated: Option<u64>,
}

impl Default for MirrorUnitStatus {

    /*
     * Return MirrorUnitStatus (k8s subresource) with default and safe initial values.
     */
    fn default() -> MirrorUnitStatus {
	MirrorUnitStatus{
	    state: Some(MirrorUnitState::MAINTENANCE.to_string()),
	    message: Some(String::from("starting")),
	    workload_version: None,
	    last_sync: None,
	    last_updated: None,
	}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_with(request: Option<&str>, served: Option<&str>) -> MirrorUnit {
	let mut unit = new("gitmirror-0", "gitmirror", BTreeMap::new());
	if let Some(request) = request {
	    let mut annotations = BTreeMap::new();
	    annotations.insert(SYNC_NOW_ANNOTATION.to_string(), request.to_string());
	    unit.metadata.annotations = Some(annotations);
	}
	if let Some(served) = served {
	    let mut status = MirrorUnitStatus::default();
	    status.last_sync = Some(SyncRecord{
		request: served.to_string(),
		..Default::default()
	    });
	    unit.status = Some(status);
	}
	unit
    }

    #[test]
    fn pending_sync_only_for_unserved_requests() {
	assert!(!unit_with(None, None).has_pending_sync());
	assert!(!unit_with(Some(""), None).has_pending_sync());
	assert!(unit_with(Some("1"), None).has_pending_sync());
	assert!(unit_with(Some("2"), Some("1")).has_pending_sync());
	assert!(!unit_with(Some("2"), Some("2")).has_pending_sync());
    }

    #[test]
    fn status_fields_are_camel_case() {
	let mut status = MirrorUnitStatus::default();
	status.workload_version = Some(String::from("3.6.9"));
	status.last_sync = Some(SyncRecord::default());

	let value = serde_json::to_value(&status).unwrap();
	assert_eq!(value["state"], "maintenance");
	assert_eq!(value["workloadVersion"], "3.6.9");
	assert_eq!(value["lastSync"]["succeeded"], false);
    }

    #[test]
    fn state_names() {
	assert_eq!(MirrorUnitState::ACTIVE.to_string(), "active");
	assert_eq!(MirrorUnitState::BLOCKED.to_string(), "blocked");
	assert_eq!(MirrorUnitState::MAINTENANCE.to_string(), "maintenance");
    }
}
