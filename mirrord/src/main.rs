mod cmdline;
mod config;
mod engine;
mod errors;
mod fingerprint;
mod mirrorunit;
mod notifier;
mod peers;
mod secrets;
mod sidecar;
mod workload;

#[cfg(test)]
mod testing;

use engine::EngineSettings;
use errors::Result;
use mirrorunit::UnitIdentity;
use mirrorunit::UnitMgr;
use workload::LocalWorkload;

use clap::Parser;
use gethostname::gethostname;
use kube::Client as KubeClient;
use log;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about = "Mirrors a git repository with git-sync and publishes its content")]
struct Args {
    /// Name of this unit [default: the hostname]
    #[arg(long, env = "GITMIRROR_UNIT")]
    name: Option<String>,

    /// GitMirror resource this unit belongs to
    #[arg(long, env = "GITMIRROR_APP", default_value = "gitmirror")]
    app: String,

    #[arg(long, env = "GITMIRROR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Seconds between two reconciliation passes
    #[arg(long, env = "GITMIRROR_INTERVAL", default_value_t = 60)]
    interval: u64,

    /// git-sync binary
    #[arg(long, env = "GITSYNC_BINARY", default_value = "/git-sync")]
    git_sync: PathBuf,

    /// Root of the mirror volume, as given to git-sync
    #[arg(long, env = "GITSYNC_ROOT", default_value = "/git")]
    sidecar_root: String,

    /// Root of the mirror volume, as seen by this process
    #[arg(long, env = "GITMIRROR_LOCAL_ROOT", default_value = "/git")]
    local_root: PathBuf,

    /// Seconds git-sync must survive after a start to count as running
    #[arg(long, default_value_t = 2)]
    startup_grace: u64,
}

async fn register(me: &UnitMgr) -> Result<()> {
    log::info!("Registering myself ...");

    if let Err(err) = me.register().await {
	log::error!("Unable to register myself in the k8s control plane: {}", err);
	return Err(err);
    }
    Ok(())
}

async fn unregister(me: &UnitMgr) {
    log::info!("Unregistering myself ...");

    if let Err(err) = me.unregister().await {
	log::error!("Unable to unregister myself: {}", err);
    }
}

fn get_unit_name(name: Option<String>) -> String {
    match name {
	Some(name) => name,
	// the pod name, in a StatefulSet
	None => gethostname().to_string_lossy().into_owned(),
    }
}

/*
 * Program design:
 *
 *  1. When it starts it registers its MirrorUnit and claims leadership
 *  2. Watches its MirrorUnit, the GitMirror config and the collaborator relations
 *  3. Runs a reconciliation pass on every event (and periodically)
 *  4. Reports the outcome in the MirrorUnit status.
 */
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let identity = UnitIdentity{
	name: get_unit_name(args.name),
	app: args.app,
	namespace: args.namespace,
    };
    let kube_client = KubeClient::try_default().await?;

    log::info!("starting mirrord for {} ({}/{})", identity.name, identity.namespace, identity.app);
    let settings = EngineSettings{
	binary: args.git_sync.to_string_lossy().into_owned(),
	sidecar_root: args.sidecar_root,
	local_root: args.local_root,
	environment: EngineSettings::proxy_environment(),
    };
    let workload = Arc::new(LocalWorkload::new(&args.git_sync, Duration::from_secs(args.startup_grace)));
    let me = UnitMgr::new(kube_client, identity, args.interval, settings, workload);

    register(&me).await?;
    tokio::select! {
	_ = me.watcher() => {},
	_ = me.controller() => {},

	// handle CTRL^C as gracefully as we can.
	_ = tokio::signal::ctrl_c() => {},
    }
    unregister(&me).await;

    Ok(())
}
