use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("MirrorUnit {0} not found")]
    UnitNotFound(String),

    #[error("no answer from {unit} to sync request {request} after {seconds}s")]
    Timeout {
	unit: String,
	request: String,
	seconds: u64,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
