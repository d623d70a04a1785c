use devgrid_state::StateError;

/// Errors surfaced to callers of device services.
///
/// Carried inside `Message::Failure` between endpoints, hence `Clone` and
/// string payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("rpc failed: {0}")]
    Rpc(String),

    #[error("action failed: {0}")]
    Action(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("data tree operation failed: {0}")]
    DataTree(String),

    #[error("schema source unavailable: {0}")]
    SchemaSource(String),

    #[error("{0}: master is down, please try again")]
    MasterDown(String),

    #[error("{0} is not the owner of the device")]
    NotOwner(String),

    #[error("unsupported across proxy: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors from the device lifecycle machinery.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("election registration failed for {device}: {source}")]
    Registration {
        device: String,
        #[source]
        source: ElectionError,
    },

    #[error("failed to shut down owner facade for {device}: {reason}")]
    Shutdown { device: String, reason: String },

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("device context {0} is closed")]
    Closed(String),
}

pub type TopologyResult<T> = Result<T, TopologyError>;

/// Rejection from the election collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElectionError {
    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("group {0} already has a registration from this node")]
    AlreadyRegistered(String),
}
