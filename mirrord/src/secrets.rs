/*
 * Resolution of `secret://<id>/<key>` references into the clear value of
 * one key of a Kubernetes Secret. Nothing is cached: every call hits the
 * store so a rotated secret is picked up on the next pass.
 */

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret as KubeSecret;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::Error as KubeError;
use log;
use std::collections::BTreeMap;
use thiserror::Error;

pub const SECRET_SCHEME: &str = "secret://";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {

    /* anything but secret://<id>/<key> */
    #[error("git SSH key secret not found.")]
    InvalidReference(String),

    #[error("git SSH key secret not found.")]
    NotFound(String),

    #[error("missing permissions for the git SSH key secret, see logs.")]
    PermissionDenied(String),

    #[error("git SSH key secret not found: key '{key}' is absent from '{id}'.")]
    KeyMissing { id: String, key: String },

    #[error("Unexpected error fetching secret, see logs.")]
    Unexpected(String),
}

/*
 * A parsed secret reference
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub id: String,
    pub key: String,
}

impl SecretRef {

    /*
     * Accepts exactly `secret://<id>/<key>`. A model prefix before the id
     * (`secret://<model>/<id>/<key>`), a missing key, a wrong scheme or a
     * bare id are all rejected.
     */
    pub fn parse(reference: &str) -> Result<SecretRef, SecretError> {
	let invalid = || SecretError::InvalidReference(reference.to_string());

	let rest = reference.strip_prefix(SECRET_SCHEME).ok_or_else(invalid)?;
	let (id, key) = rest.split_once('/').ok_or_else(invalid)?;
	if id.is_empty() || key.is_empty() || key.contains('/') {
	    return Err(invalid());
	}

	Ok(SecretRef{
	    id: id.to_string(),
	    key: key.to_string(),
	})
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {

    /*
     * Returns the whole content map of the secret named `id`.
     */
    async fn content(&self, id: &str) -> Result<BTreeMap<String, String>, SecretError>;
}

/*
 * Resolves `reference` against `store`; the returned value is never empty.
 */
pub async fn resolve(store: &dyn SecretStore, reference: &str) -> Result<String, SecretError> {
    let secret = SecretRef::parse(reference)?;
    let content = store.content(&secret.id).await?;

    match content.get(&secret.key) {
	Some(value) if !value.is_empty() => Ok(value.clone()),
	_ => Err(SecretError::KeyMissing{
	    id: secret.id,
	    key: secret.key,
	}),
    }
}

/*
 * Kubernetes Secrets living in the unit's namespace
 */
pub struct KubeSecretStore {
    secrets: KubeApi<KubeSecret>,
}

impl KubeSecretStore {
    pub fn new(kube_client: KubeClient, namespace: &str) -> Self {
	Self{
	    secrets: KubeApi::namespaced(kube_client, namespace),
	}
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn content(&self, id: &str) -> Result<BTreeMap<String, String>, SecretError> {
	let secret = match self.secrets.get(id).await {
	    Ok(secret) => secret,
	    Err(KubeError::Api(resp)) if resp.code == 404 => {
		return Err(SecretError::NotFound(id.to_string()));
	    },
	    Err(KubeError::Api(resp)) if resp.code == 403 => {
		log::error!("missing permissions for the git SSH key secret '{}'; grant get on secrets to resolve: {}", id, resp.message);
		return Err(SecretError::PermissionDenied(resp.message));
	    },
	    Err(err) => {
		log::error!("unexpected error fetching secret '{}': {}", id, err);
		return Err(SecretError::Unexpected(err.to_string()));
	    }
	};

	let mut content = BTreeMap::new();
	if let Some(data) = secret.data {
	    for (key, value) in data {
		content.insert(key, String::from_utf8_lossy(&value.0).to_string());
	    }
	}
	if let Some(string_data) = secret.string_data {
	    content.extend(string_data);
	}
	Ok(content)
    }
}
