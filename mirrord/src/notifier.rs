/*
 * DownstreamNotifier: republishes the mirrored content to the three
 * collaborators (Prometheus rules, Loki rules, Grafana dashboards).
 *
 * A collaborator relation is a ConfigMap named `<app>-<relation>`, created by
 * whoever consumes it. Republishing replaces its data with the files found in
 * the matching subdirectory of the checkout; when the relation does not exist
 * there is nobody to publish to and nothing happens.
 */

use crate::errors::Result;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap as KubeConfigMap;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::api::PostParams as KubePostParams;
use log;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use walkdir::WalkDir;

/* label put on the collaborator ConfigMaps, its value is the relation name */
pub const RELATION_LABEL: &str = "gitmirror.runfc.br/relation";

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CollaboratorKind {
    PrometheusRules,
    LokiRules,
    GrafanaDashboards,
}

impl CollaboratorKind {

    pub const ALL: [CollaboratorKind; 3] = [
	CollaboratorKind::PrometheusRules,
	CollaboratorKind::LokiRules,
	CollaboratorKind::GrafanaDashboards,
    ];

    pub fn relation_name(&self) -> &'static str {
	match self {
	    CollaboratorKind::PrometheusRules => "prometheus-config",
	    CollaboratorKind::LokiRules => "loki-config",
	    CollaboratorKind::GrafanaDashboards => "grafana-dashboards",
	}
    }

    pub fn from_relation_name(name: &str) -> Option<CollaboratorKind> {
	CollaboratorKind::ALL.into_iter().find(|kind| kind.relation_name() == name)
    }

    /* rules may be organized in subdirectories, dashboards may not */
    fn recursive(&self) -> bool {
	!matches!(self, CollaboratorKind::GrafanaDashboards)
    }

    fn extensions(&self) -> &'static [&'static str] {
	match self {
	    CollaboratorKind::PrometheusRules | CollaboratorKind::LokiRules => &[".rule", ".rules", ".yml", ".yaml"],
	    CollaboratorKind::GrafanaDashboards => &[".json", ".json.tmpl"],
	}
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn republish(&self, kind: CollaboratorKind, dir: &Path) -> Result<()>;
}

/*
 * ConfigMap keys only allow [-._a-zA-Z0-9]
 */
fn content_key(relative: &Path) -> String {
    relative.to_string_lossy()
	.chars()
	.map(|c| if c.is_ascii_alphanumeric() || "-._".contains(c) { c } else { '_' })
	.collect()
}

/*
 * Reads the files of `kind` found under `dir`. A missing directory is empty
 * content, which is what gets published after the checkout is wiped.
 */
pub fn collect_content(kind: CollaboratorKind, dir: &Path) -> BTreeMap<String, String> {
    let max_depth = if kind.recursive() { usize::MAX } else { 1 };
    let mut content = BTreeMap::new();

    let files = WalkDir::new(dir)
	.max_depth(max_depth)
	.sort_by_file_name()
	.into_iter()
	.filter_map(|entry| entry.ok())
	.filter(|entry| entry.file_type().is_file());

    for entry in files {
	let name = entry.file_name().to_string_lossy();
	if !kind.extensions().iter().any(|ext| name.ends_with(ext)) {
	    continue;
	}
	let relative = match entry.path().strip_prefix(dir) {
	    Ok(relative) => relative,
	    Err(_) => continue,
	};

	match std::fs::read_to_string(entry.path()) {
	    Ok(data) => {
		content.insert(content_key(relative), data);
	    },
	    Err(err) => log::warn!("skipping {}: {}", entry.path().display(), err),
	}
    }
    content
}

pub struct DownstreamNotifier {
    publisher: Arc<dyn Publisher>,
}

impl DownstreamNotifier {

    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
	Self{ publisher }
    }

    /*
     * Fire and forget: the collaborator owns its errors, they are only
     * logged here.
     */
    pub async fn publish(&self, kind: CollaboratorKind, dir: &Path) {
	log::debug!("republishing {:?} from {}", kind, dir.display());
	if let Err(err) = self.publisher.republish(kind, dir).await {
	    log::error!("Unable to republish {:?}: {}", kind, err);
	}
    }

    /*
     * Republishes every collaborator, whether related or not.
     */
    pub async fn publish_all(&self, dirs: &[(CollaboratorKind, PathBuf)]) {
	for (kind, dir) in dirs {
	    self.publish(*kind, dir).await;
	}
    }
}

/* name of the ConfigMap backing the `kind` relation of `app` */
pub fn relation_object(app: &str, kind: CollaboratorKind) -> String {
    format!("{}-{}", app, kind.relation_name())
}

pub struct KubePublisher {
    app: String,
    configmap_api: KubeApi<KubeConfigMap>,
}

impl KubePublisher {

    pub fn new(kube_client: KubeClient, namespace: &str, app: &str) -> Self {
	Self{
	    app: app.to_string(),
	    configmap_api: KubeApi::namespaced(kube_client, namespace),
	}
    }
}

#[async_trait]
impl Publisher for KubePublisher {
    async fn republish(&self, kind: CollaboratorKind, dir: &Path) -> Result<()> {
	let name = relation_object(&self.app, kind);
	let mut relation = match self.configmap_api.get_opt(&name).await? {
	    Some(relation) => relation,
	    None => {
		log::debug!("no {} relation ({} not found), nothing to publish", kind.relation_name(), name);
		return Ok(());
	    }
	};

	let content = collect_content(kind, dir);
	log::info!("publishing {} file(s) to {}", content.len(), name);

	relation.data = Some(content);
	self.configmap_api.replace(&name, &KubePostParams::default(), &relation).await?;
	Ok(())
    }
}
