//! The error taxonomy shared by every catalog operation.

use data_types::{PartitionError, SchemaError};
use snafu::Snafu;

/// Convenience alias for catalog results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Catalog operation errors. Every handler returns exactly one of these,
/// carrying a human-readable message; [`Error::code`] maps the kinds that are
/// visible in response envelopes to their wire code.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("not found: {}", msg))]
    NotFound { msg: String },

    #[snafu(display("namespace not found: {}", msg))]
    NamespaceNotFound { msg: String },

    #[snafu(display("type not found: {}", msg))]
    TypeNotFound { msg: String },

    #[snafu(display("already present: {}", msg))]
    AlreadyPresent { msg: String },

    #[snafu(display("type already present: {}", msg))]
    TypeAlreadyPresent { msg: String },

    #[snafu(display("invalid argument: {}", msg))]
    InvalidArgument { msg: String },

    #[snafu(display("invalid schema: {}", msg))]
    InvalidSchema { msg: String },

    #[snafu(display("invalid cluster config: {}", msg))]
    InvalidClusterConfig { msg: String },

    #[snafu(display("illegal state: {}", msg))]
    IllegalState { msg: String },

    #[snafu(display("service unavailable: {}", msg))]
    ServiceUnavailable { msg: String },

    #[snafu(display("leader not yet ready to serve requests: {}", msg))]
    LeaderNotReadyToServe { msg: String },

    #[snafu(display("timed out: {}", msg))]
    TimedOut { msg: String },

    #[snafu(display("corruption: {}", msg))]
    Corruption { msg: String },

    #[snafu(display("remote error: {}", msg))]
    RemoteError { msg: String },

    #[snafu(display("try again: {}", msg))]
    TryAgain { msg: String },

    #[snafu(display("config version mismatch: {}", msg))]
    ConfigVersionMismatch { msg: String },

    #[snafu(display("namespace is not empty: {}", msg))]
    NamespaceIsNotEmpty { msg: String },

    #[snafu(display("cannot delete default namespace: {}", msg))]
    CannotDeleteDefaultNamespace { msg: String },

    #[snafu(display("too many tablets: {}", msg))]
    TooManyTablets { msg: String },

    #[snafu(display("replication factor too high: {}", msg))]
    ReplicationFactorTooHigh { msg: String },

    #[snafu(display("catalog manager is not initialized: {}", msg))]
    CatalogManagerNotInitialized { msg: String },
}

impl From<SchemaError> for Error {
    fn from(e: SchemaError) -> Self {
        Self::InvalidSchema { msg: e.to_string() }
    }
}

impl From<PartitionError> for Error {
    fn from(e: PartitionError) -> Self {
        Self::InvalidArgument { msg: e.to_string() }
    }
}

/// Error codes carried in response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MasterErrorCode {
    NotFound,
    AlreadyPresent,
    InvalidSchema,
    InvalidArgument,
    TooManyTablets,
    ReplicationFactorTooHigh,
    NamespaceNotFound,
    NamespaceIsNotEmpty,
    CannotDeleteDefaultNamespace,
    TypeNotFound,
    TypeAlreadyPresent,
    ConfigVersionMismatch,
    InvalidClusterConfig,
    CanRetryLoadBalanceCheck,
    CatalogManagerNotInitialized,
}

impl Error {
    /// The wire code for this error, if it is one of the kinds surfaced in
    /// response envelopes. Transport-level refusals (not the leader, shutting
    /// down, timeouts) are carried as a bare status instead.
    pub fn code(&self) -> Option<MasterErrorCode> {
        match self {
            Self::NotFound { .. } => Some(MasterErrorCode::NotFound),
            Self::NamespaceNotFound { .. } => Some(MasterErrorCode::NamespaceNotFound),
            Self::TypeNotFound { .. } => Some(MasterErrorCode::TypeNotFound),
            Self::AlreadyPresent { .. } => Some(MasterErrorCode::AlreadyPresent),
            Self::TypeAlreadyPresent { .. } => Some(MasterErrorCode::TypeAlreadyPresent),
            Self::InvalidArgument { .. } => Some(MasterErrorCode::InvalidArgument),
            Self::InvalidSchema { .. } => Some(MasterErrorCode::InvalidSchema),
            Self::InvalidClusterConfig { .. } => Some(MasterErrorCode::InvalidClusterConfig),
            Self::TryAgain { .. } => Some(MasterErrorCode::CanRetryLoadBalanceCheck),
            Self::ConfigVersionMismatch { .. } => Some(MasterErrorCode::ConfigVersionMismatch),
            Self::NamespaceIsNotEmpty { .. } => Some(MasterErrorCode::NamespaceIsNotEmpty),
            Self::CannotDeleteDefaultNamespace { .. } => {
                Some(MasterErrorCode::CannotDeleteDefaultNamespace)
            }
            Self::TooManyTablets { .. } => Some(MasterErrorCode::TooManyTablets),
            Self::ReplicationFactorTooHigh { .. } => {
                Some(MasterErrorCode::ReplicationFactorTooHigh)
            }
            Self::CatalogManagerNotInitialized { .. } => {
                Some(MasterErrorCode::CatalogManagerNotInitialized)
            }
            Self::IllegalState { .. }
            | Self::ServiceUnavailable { .. }
            | Self::LeaderNotReadyToServe { .. }
            | Self::TimedOut { .. }
            | Self::Corruption { .. }
            | Self::RemoteError { .. } => None,
        }
    }

    /// Whether the caller should retry on another master.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        let err = Error::ReplicationFactorTooHigh {
            msg: "rf=5, live=3".into(),
        };
        assert_eq!(err.code(), Some(MasterErrorCode::ReplicationFactorTooHigh));

        let err = Error::ServiceUnavailable {
            msg: "not the leader".into(),
        };
        assert_eq!(err.code(), None);
        assert!(err.is_service_unavailable());
    }

    #[test]
    fn schema_errors_convert_to_invalid_schema() {
        let err: Error = SchemaError::CannotRemoveKeyColumn.into();
        assert_eq!(err.code(), Some(MasterErrorCode::InvalidSchema));
    }
}
