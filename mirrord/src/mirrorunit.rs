use crate::config::ConfigSnapshot;
use crate::engine::EngineSettings;
use crate::engine::PassReport;
use crate::engine::ReconciliationEngine;
use crate::errors::Error;
use crate::errors::Result;
use crate::notifier::CollaboratorKind;
use crate::notifier::KubePublisher;
use crate::notifier::RELATION_LABEL;
use crate::notifier::relation_object;
use crate::peers::KubePeerStore;
use crate::secrets::KubeSecretStore;
use crate::workload::Workload;
use gitmirror_api as api;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap as KubeConfigMap;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::ResourceExt;
use kube::api::DeleteParams as KubeDeleteParams;
use kube::api::Patch as KubePatch;
use kube::api::PatchParams as KubePatchParams;
use kube::api::PostParams as KubePostParams;
use kube::runtime::WatchStreamExt;
use kube::runtime::controller::Action as KubeAction;
use kube::runtime::controller::Controller as KubeController;
use kube::runtime::reflector as kube_reflector;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher as kube_watcher;
use log;
use serde_json::json;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use tokio::sync::Mutex;

const UNIT_NAME_LABEL: &str = "mirrorunits.runfc.br/name";

/*
 * UnitMgr encapsulates kube watcher and controller for managing this unit's
 * MirrorUnit (Custom Resource) object in k8s, and feeds every event to the
 * reconciliation engine.
 *
 */
#[derive(Clone)]
pub struct UnitMgr {
    name: String,
    app: String,
    namespace: String,
    reconciliation_interval: u64,

    unit_api: KubeApi<api::MirrorUnit>,
    mirror_api: KubeApi<api::GitMirror>,
    configmap_api: KubeApi<KubeConfigMap>,
    peers: KubePeerStore,

    // one pass at a time, whatever the event that triggered it
    engine: Arc<Mutex<ReconciliationEngine>>,

    // uids of the collaborator relations already handed the content
    joined: Arc<Mutex<BTreeSet<String>>>,
}

#[derive(Clone)]
struct UnitManagerCtx {
    unit_mgr: UnitMgr,
}

fn now() -> u64 {
    SystemTime::now()
	.duration_since(SystemTime::UNIX_EPOCH)
	.map(|elapsed| elapsed.as_secs())
	.unwrap_or_default()
}

async fn unit_reconcile(unit: Arc<api::MirrorUnit>, ctx: Arc<UnitManagerCtx>) -> Result<KubeAction> {
    let mgr = &ctx.unit_mgr;
    if unit.name_any() != mgr.name {
	return Ok(mgr.requeue());
    }

    // a vacant lease (the leader left) is taken over here
    mgr.peers.claim_leadership().await?;
    mgr.peers.ensure_relation().await?;

    let config = mgr.config().await?;
    let engine = mgr.engine.lock().await;

    let mut last_sync = None;
    let report = match unit.sync_request() {
	Some(request) if unit.has_pending_sync() => {
	    log::info!("Serving sync request {}", request);
	    let (outcome, report) = engine.sync_now(&config).await?;
	    if !outcome.succeeded {
		log::warn!("sync request {} failed: {:?}", request, outcome.message);
	    }
	    last_sync = Some(outcome.record(&request));
	    report
	},
	_ => engine.reconcile(&config).await?,
    };
    let version = engine.workload_version().await;
    drop(engine);

    log::debug!("pass result: {:?}", report);
    mgr.patch_status(&report, version, last_sync).await?;

    Ok(mgr.requeue())
}

fn unit_error_policy(_unit: Arc<api::MirrorUnit>, error: &Error, ctx: Arc<UnitManagerCtx>) -> KubeAction {
    log::error!("Reconciliation pass aborted: {}", error);
    ctx.unit_mgr.requeue()
}

impl UnitMgr {

    /*
     * watcher returns a Future object that watches the collaborator
     * relations of our application, and hands the current content to each
     * one the first time it shows up.
     */
    pub fn watcher(&self) -> impl Future<Output = ()> {
	let (_reader, writer) = kube_reflector::store();
	let reflector = kube_reflector::reflector(
	    writer,
	    kube_watcher(self.configmap_api.clone(), kube_watcher::Config::default().labels(RELATION_LABEL)),
	);

	let mgr = self.clone();

	// return the reflector future, to be used by tokio::select!
	reflector.applied_objects()
	    .for_each(move |relation| {
		let mgr = mgr.clone();
		async move {
		    match relation {
			Ok(relation) => {
			    if let Err(err) = mgr.relation_seen(relation).await {
				log::error!("Unable to handle relation: {}", err);
			    }
			},
			Err(err) => log::error!("Relation watcher failed: {}", err),
		    }
		}
	    })
    }

    /*
     * controller reconciles our MirrorUnit: on its own changes (sync
     * requests), on changes of the GitMirror configuration, and on every
     * requeue.
     */
    pub fn controller(&self) -> impl Future<Output = ()> {
	let ctx = Arc::new(UnitManagerCtx{
	    unit_mgr: self.clone(),
	});

	let selector = format!("{}={}", UNIT_NAME_LABEL, self.name);
	let unit = ObjectRef::<api::MirrorUnit>::new(&self.name).within(&self.namespace);
	let app = self.app.clone();

	KubeController::new(self.unit_api.clone(), kube_watcher::Config::default().labels(&selector))
	    .watches(self.mirror_api.clone(), kube_watcher::Config::default(), move |mirror: api::GitMirror| {
		(mirror.name_any() == app).then(|| unit.clone())
	    })
	    .run(unit_reconcile, unit_error_policy, ctx)
	    .for_each(|reconcile| async move {
		if let Err(err) = reconcile {
		    log::error!("Failed to reconcile with error: {:?}", err);
		}
	    })
    }

    /*
     * The configuration of our application; a missing GitMirror reads as
     * one with nothing set.
     */
    async fn config(&self) -> Result<ConfigSnapshot> {
	let spec = match self.mirror_api.get_opt(&self.app).await? {
	    Some(mirror) => mirror.spec,
	    None => {
		log::warn!("GitMirror {} not found", self.app);
		api::GitMirrorSpec::unset()
	    }
	};
	Ok(ConfigSnapshot::from(&spec))
    }

    async fn relation_seen(&self, relation: KubeConfigMap) -> Result<()> {
	let kind = match relation.labels().get(RELATION_LABEL).and_then(|name| CollaboratorKind::from_relation_name(name)) {
	    Some(kind) => kind,
	    None => {
		log::debug!("ignoring {}: unknown relation", relation.name_any());
		return Ok(());
	    }
	};

	/* relations of other applications share the namespace */
	if relation.name_any() != relation_object(&self.app, kind) {
	    return Ok(());
	}

	let uid = relation.uid().unwrap_or_else(|| relation.name_any());
	if !self.joined.lock().await.insert(uid.clone()) {
	    return Ok(());
	}

	log::info!("{} relation joined", kind.relation_name());
	if let Err(err) = self.relation_joined(kind).await {
	    // try again on the next update of that relation
	    self.joined.lock().await.remove(&uid);
	    return Err(err);
	}
	Ok(())
    }

    async fn relation_joined(&self, kind: CollaboratorKind) -> Result<()> {
	let config = self.config().await?;
	let report = self.engine.lock().await.relation_joined(kind, &config).await?;
	self.patch_status(&report, None, None).await
    }

    /*
     * Merge-patches the status subresource; fields we have nothing new for
     * are left as they are.
     */
    pub async fn patch_status(&self, report: &PassReport, version: Option<String>, last_sync: Option<api::SyncRecord>) -> Result<()> {
	let mut status = json!({
	    "state": report.result.state().to_string(),
	    "message": report.message(),
	    "lastUpdated": now(),
	});
	if let Some(version) = version {
	    status["workloadVersion"] = json!(version);
	}
	if let Some(record) = last_sync {
	    status["lastSync"] = json!(record);
	}

	let patch = json!({"status": status});
	self.unit_api.patch_status(&self.name, &KubePatchParams::default(), &KubePatch::Merge(&patch)).await?;
	Ok(())
    }

    async fn patch_state(&self, state: api::MirrorUnitState, message: &str) -> Result<()> {
	let patch = json!({
	    "status": {
		"state": state.to_string(),
		"message": message,
		"lastUpdated": now(),
	    }
	});
	self.unit_api.patch_status(&self.name, &KubePatchParams::default(), &KubePatch::Merge(&patch)).await?;
	Ok(())
    }

    pub fn default_labels(&self) -> BTreeMap<String, String> {
	let mut labels = BTreeMap::new();

	labels.insert(String::from(UNIT_NAME_LABEL), self.name.clone());
	labels.insert(String::from("mirrorunits.runfc.br/app"), self.app.clone());
	labels.insert(String::from("mirrorunits.runfc.br/managed"), String::from("true"));
	labels
    }

    pub async fn register(&self) -> Result<()> {
	let name = self.name.as_str();

	match self.unit_api.get_opt(name).await? {
	    Some(unit) => {
		log::warn!("Interesting! I was already here before, so I'm retaking my position on the control plane: {:?}", unit.metadata.name);
	    },
	    None => {
		let new = api::mirrorunit::new(name, &self.app, self.default_labels());
		self.unit_api.create(&KubePostParams::default(), &new).await?;
	    }
	};

	if let Err(err) = self.patch_state(api::MirrorUnitState::MAINTENANCE, "starting").await {
	    log::warn!("Unable to update instance status: {:?}", err);
	}

	if self.peers.claim_leadership().await? {
	    log::info!("{} leads {}", name, self.app);
	}
	self.peers.ensure_relation().await
    }

    pub async fn unregister(&self) -> Result<()> {
	let name = self.name.as_str();

	if let Err(err) = self.peers.release_leadership().await {
	    log::warn!("Unable to release leadership: {}", err);
	}

	if self.unit_api.get_opt(name).await?.is_some() {
	    if let Err(err) = self.patch_state(api::MirrorUnitState::LEAVING, "unit is going away").await {
		log::warn!("Unable to update instance status: {:?}", err);
	    }

	    let opts = KubeDeleteParams{
		grace_period_seconds: Some(0),
		..Default::default()
	    };
	    self.unit_api.delete(name, &opts).await?;
	}
	Ok(())
    }

    pub fn requeue(&self) -> KubeAction {
	KubeAction::requeue(Duration::from_secs(self.reconciliation_interval))
    }

    pub fn new(kube_client: KubeClient,
	       identity: UnitIdentity,
	       interval: u64,
	       settings: EngineSettings,
	       workload: Arc<dyn Workload>) -> Self {
	let namespace = identity.namespace.as_str();
	let peers = KubePeerStore::new(kube_client.clone(), namespace, &identity.app, &identity.name);

	let engine = ReconciliationEngine::new(
	    settings,
	    workload,
	    Arc::new(peers.clone()),
	    Arc::new(KubeSecretStore::new(kube_client.clone(), namespace)),
	    Arc::new(KubePublisher::new(kube_client.clone(), namespace, &identity.app)),
	);

	Self{
	    name: identity.name.clone(),
	    app: identity.app.clone(),
	    namespace: identity.namespace.clone(),
	    reconciliation_interval: interval,

	    /* k8s internal references */
	    unit_api: KubeApi::namespaced(kube_client.clone(), namespace),
	    mirror_api: KubeApi::namespaced(kube_client.clone(), namespace),
	    configmap_api: KubeApi::namespaced(kube_client.clone(), namespace),
	    peers,

	    engine: Arc::new(Mutex::new(engine)),
	    joined: Arc::new(Mutex::new(BTreeSet::new())),
	}
    }
}

/*
 * Who we are: the unit, the application (GitMirror) it belongs to and the
 * namespace both live in.
 */
#[derive(Debug, Clone)]
pub struct UnitIdentity {
    pub name: String,
    pub app: String,
    pub namespace: String,
}

