/*
 * Replicated peer state and leadership.
 *
 * The peer "relation" is a ConfigMap named `<app>-replicas` whose data is
 * visible to every unit of the application. Leadership comes from a Lease
 * named `<app>-leader`: a unit leads when it is the lease holder. Only the
 * leader writes the ConfigMap.
 */

use crate::errors::Result;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease as KubeLease;
use k8s_openapi::api::coordination::v1::LeaseSpec as KubeLeaseSpec;
use k8s_openapi::api::core::v1::ConfigMap as KubeConfigMap;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::Error as KubeError;
use kube::api::ObjectMeta;
use kube::api::Patch as KubePatch;
use kube::api::PatchParams as KubePatchParams;
use kube::api::PostParams as KubePostParams;
use log;
use serde_json::json;

#[async_trait]
pub trait PeerStore: Send + Sync {

    /* whether the peer relation hosting the shared state exists */
    async fn relation_exists(&self) -> Result<bool>;

    async fn is_leader(&self) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /*
     * Writes `key`. Callers go through FingerprintTracker, which only does
     * so while holding leadership.
     */
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

pub fn relation_name(app: &str) -> String {
    format!("{}-replicas", app)
}

pub fn lease_name(app: &str) -> String {
    format!("{}-leader", app)
}

#[derive(Clone)]
pub struct KubePeerStore {
    unit: String,
    relation: String,
    lease: String,

    configmap_api: KubeApi<KubeConfigMap>,
    lease_api: KubeApi<KubeLease>,
}

impl KubePeerStore {

    pub fn new(kube_client: KubeClient, namespace: &str, app: &str, unit: &str) -> Self {
	Self{
	    unit: unit.to_string(),
	    relation: relation_name(app),
	    lease: lease_name(app),

	    configmap_api: KubeApi::namespaced(kube_client.clone(), namespace),
	    lease_api: KubeApi::namespaced(kube_client.clone(), namespace),
	}
    }

    async fn holder(&self) -> Result<Option<String>> {
	let lease = self.lease_api.get_opt(&self.lease).await?;
	Ok(lease.and_then(|lease| lease.spec).and_then(|spec| spec.holder_identity))
    }

    /*
     * Takes the lease when nobody holds it. Returns whether this unit
     * holds the lease afterwards.
     */
    pub async fn claim_leadership(&self) -> Result<bool> {
	match self.lease_api.get_opt(&self.lease).await? {
	    None => {
		let mut metadata = ObjectMeta::default();
		metadata.name = Some(self.lease.clone());
		let lease = KubeLease{
		    metadata,
		    spec: Some(KubeLeaseSpec{
			holder_identity: Some(self.unit.clone()),
			..Default::default()
		    }),
		};

		match self.lease_api.create(&KubePostParams::default(), &lease).await {
		    Ok(_) => log::info!("{} is now the leader", self.unit),
		    // somebody else was faster
		    Err(KubeError::Api(resp)) if resp.code == 409 => {},
		    Err(err) => return Err(err.into()),
		}
	    },
	    Some(lease) => {
		let holder = lease.spec.and_then(|spec| spec.holder_identity);
		if holder.is_none() {
		    let patch = json!({"spec": {"holderIdentity": self.unit}});
		    self.lease_api.patch(&self.lease, &KubePatchParams::default(), &KubePatch::Merge(&patch)).await?;
		    log::info!("{} took over the vacant leadership", self.unit);
		}
	    }
	};

	self.is_leader().await
    }

    pub async fn release_leadership(&self) -> Result<()> {
	if self.is_leader().await? {
	    let patch = json!({"spec": {"holderIdentity": null}});
	    self.lease_api.patch(&self.lease, &KubePatchParams::default(), &KubePatch::Merge(&patch)).await?;
	}
	Ok(())
    }

    /*
     * Creates the peer relation if it is missing; leader only.
     */
    pub async fn ensure_relation(&self) -> Result<()> {
	if !self.is_leader().await? || self.relation_exists().await? {
	    return Ok(());
	}

	let mut metadata = ObjectMeta::default();
	metadata.name = Some(self.relation.clone());
	let relation = KubeConfigMap{
	    metadata,
	    ..Default::default()
	};
	match self.configmap_api.create(&KubePostParams::default(), &relation).await {
	    Ok(_) => log::info!("created peer relation {}", self.relation),
	    Err(KubeError::Api(resp)) if resp.code == 409 => {},
	    Err(err) => return Err(err.into()),
	}
	Ok(())
    }
}

#[async_trait]
impl PeerStore for KubePeerStore {
    async fn relation_exists(&self) -> Result<bool> {
	Ok(self.configmap_api.get_opt(&self.relation).await?.is_some())
    }

    async fn is_leader(&self) -> Result<bool> {
	Ok(self.holder().await?.as_deref() == Some(self.unit.as_str()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
	let relation = self.configmap_api.get_opt(&self.relation).await?;
	Ok(relation.and_then(|cm| cm.data).and_then(|data| data.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
	let patch = json!({"data": {key: value}});
	self.configmap_api.patch(&self.relation, &KubePatchParams::default(), &KubePatch::Merge(&patch)).await?;
	Ok(())
    }
}
