mod ctl;
mod errors;
use ctl::MirrorCtl;
use errors::Result;

use clap::Parser;
use clap::Subcommand;
use kube::Client as KubeClient;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about = "Drives the units of a GitMirror")]
struct Args {
    #[arg(long, short, env = "GITMIRROR_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask a unit to run git-sync once, right now, and wait for the outcome
    SyncNow {
	/// MirrorUnit to sync
	unit: String,

	/// Seconds to wait for the unit to serve the request
	#[arg(long, default_value_t = 300)]
	timeout: u64,
    },

    /// Show the state of the units
    Status {
	/// Only the units of this GitMirror
	#[arg(long)]
	app: Option<String>,
    },
}

async fn sync_now(ctl: &MirrorCtl, unit: &str, timeout: u64) -> Result<bool> {
    let request = ctl.request_sync(unit).await?;
    println!("Requested sync {} from {}, waiting ...", request, unit);

    let record = ctl.wait_for_sync(unit, &request, Duration::from_secs(timeout)).await?;
    let (text, succeeded) = ctl::render_sync(&record);
    println!("{}", text);
    Ok(succeeded)
}

async fn status(ctl: &MirrorCtl, app: Option<&str>) -> Result<bool> {
    for unit in ctl.units(app).await? {
	println!("{}", ctl::describe(&unit));
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let kube_client = match KubeClient::try_default().await {
	Ok(client) => client,
	Err(err) => {
	    eprintln!("Unable to reach the k8s control plane: {}", err);
	    return ExitCode::FAILURE;
	}
    };
    let ctl = MirrorCtl::new(kube_client, &args.namespace, Duration::from_secs(2));

    let outcome = match &args.command {
	Command::SyncNow{ unit, timeout } => sync_now(&ctl, unit, *timeout).await,
	Command::Status{ app } => status(&ctl, app.as_deref()).await,
    };

    match outcome {
	Ok(true) => ExitCode::SUCCESS,
	Ok(false) => ExitCode::FAILURE,
	Err(err) => {
	    eprintln!("{}", err);
	    ExitCode::FAILURE
	}
    }
}
