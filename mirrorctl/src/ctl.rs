use crate::errors::Error;
use crate::errors::Result;
use gitmirror_api as api;

use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::ResourceExt;
use kube::api::ListParams as KubeListParams;
use kube::api::Patch as KubePatch;
use kube::api::PatchParams as KubePatchParams;
use log;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use std::time::SystemTime;

const APP_LABEL: &str = "mirrorunits.runfc.br/app";

/*
 * MirrorCtl talks to the MirrorUnits of a namespace on behalf of a human.
 */
pub struct MirrorCtl {
    unit_api: KubeApi<api::MirrorUnit>,
    poll_interval: Duration,
}

/*
 * A fresh request id: units serve a request once per distinct value.
 */
pub fn request_id() -> String {
    let millis = SystemTime::now()
	.duration_since(SystemTime::UNIX_EPOCH)
	.map(|elapsed| elapsed.as_millis())
	.unwrap_or_default();
    format!("mirrorctl-{}", millis)
}

/*
 * One line per unit: name, state, git-sync version and message.
 */
pub fn describe(unit: &api::MirrorUnit) -> String {
    let status = unit.status.clone().unwrap_or_default();
    let state = status.state.unwrap_or_else(|| String::from("unknown"));
    let version = status.workload_version.unwrap_or_else(|| String::from("-"));
    let message = status.message.unwrap_or_default();

    let mut line = format!("{:<24} {:<12} {:<10} {}", unit.name_any(), state, version, message);
    if unit.has_pending_sync() {
	line.push_str(" (sync pending)");
    }
    line.trim_end().to_string()
}

/*
 * What to print for a served sync request, and whether it succeeded.
 */
pub fn render_sync(record: &api::SyncRecord) -> (String, bool) {
    let mut lines: Vec<String> = record.log.clone();
    if record.succeeded {
	if let Some(stdout) = &record.stdout {
	    lines.extend(stdout.lines().map(|line| line.to_string()));
	}
	lines.push(String::from("Sync succeeded."));
    } else {
	let message = record.message.clone().unwrap_or_else(|| String::from("Sync failed."));
	lines.push(message);
    }
    (lines.join("\n"), record.succeeded)
}

impl MirrorCtl {

    pub fn new(kube_client: KubeClient, namespace: &str, poll_interval: Duration) -> Self {
	Self{
	    unit_api: KubeApi::namespaced(kube_client, namespace),
	    poll_interval,
	}
    }

    pub async fn unit(&self, name: &str) -> Result<api::MirrorUnit> {
	self.unit_api.get_opt(name).await?
	    .ok_or_else(|| Error::UnitNotFound(name.to_string()))
    }

    pub async fn units(&self, app: Option<&str>) -> Result<Vec<api::MirrorUnit>> {
	let mut params = KubeListParams::default();
	if let Some(app) = app {
	    params = params.labels(&format!("{}={}", APP_LABEL, app));
	}
	Ok(self.unit_api.list(&params).await?.items)
    }

    /*
     * Annotates the unit with a new sync request and returns its id.
     */
    pub async fn request_sync(&self, name: &str) -> Result<String> {
	self.unit(name).await?;

	let request = request_id();
	let mut annotations = BTreeMap::new();
	annotations.insert(api::SYNC_NOW_ANNOTATION, request.as_str());

	let patch = json!({"metadata": {"annotations": annotations}});
	self.unit_api.patch(name, &KubePatchParams::default(), &KubePatch::Merge(&patch)).await?;
	log::debug!("requested sync {} from {}", request, name);
	Ok(request)
    }

    /*
     * Polls the unit status until it reports the outcome of `request`.
     */
    pub async fn wait_for_sync(&self, name: &str, request: &str, timeout: Duration) -> Result<api::SyncRecord> {
	match tokio::time::timeout(timeout, self.poll_sync(name, request)).await {
	    Ok(served) => served,
	    Err(_) => Err(Error::Timeout{
		unit: name.to_string(),
		request: request.to_string(),
		seconds: timeout.as_secs(),
	    }),
	}
    }

    async fn poll_sync(&self, name: &str, request: &str) -> Result<api::SyncRecord> {
	loop {
	    let unit = self.unit(name).await?;
	    if let Some(record) = unit.status.and_then(|status| status.last_sync) {
		if record.request == request {
		    return Ok(record);
		}
	    }
	    tokio::time::sleep(self.poll_interval).await;
	}
    }
}
