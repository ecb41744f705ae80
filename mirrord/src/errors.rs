use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workload error: {0}")]
    Workload(#[from] crate::workload::WorkloadError),

    #[error("`{0}`")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
