//! Error taxonomy shared by the central, the daemons and the client.
//!
//! Every recoverable failure travels the wire as `{code, msg}` on the
//! request's ticket. [`CorralError::code`] gives the numeric code;
//! [`CorralError::from_wire`] reconstructs a best-effort variant on the
//! receiving side (unknown codes collapse into [`CorralError::Daemon`]).

use thiserror::Error;

/// All protocol-visible error conditions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CorralError {
    /// The dispatcher has no handler for the command.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    /// The presented token is past its expiry (beyond leeway).
    #[error("token expired")]
    TokenExpired,

    /// The token signature does not verify against the shared key.
    #[error("invalid token")]
    InvalidToken,

    /// The token decoded but carries no `user` claim.
    #[error("user not found in token, problem with token issuer")]
    MissingUser,

    /// The token decoded but carries no `kind` claim.
    #[error("kind not found in token, problem with token issuer")]
    MissingKind,

    /// The token's `kind` is neither `user` nor `daemon`.
    #[error("unexpected kind for auth: {0}")]
    BadKind(String),

    /// The connection is not authenticated for this command.
    #[error("no permission for command")]
    NoPermission,

    /// A request field is missing or has the wrong type.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Stop was requested for a container that is already finalized.
    #[error("container `{0}` already stopped")]
    AlreadyStopped(String),

    /// A daemon replied with a non-zero code during aggregation.
    #[error("error from daemon: {code} {msg}")]
    Daemon { code: i64, msg: String },

    /// The requested GPU width is not an allowed value.
    #[error("n_gpus should be one of [0, 1, 2, 4, 8, 16], got {0}")]
    BadGpuCount(usize),

    /// No contiguous run of free GPUs can satisfy the request.
    #[error("unschedulable: {remaining} remaining jobs of {n_gpus} GPUs")]
    Unschedulable { remaining: usize, n_gpus: usize },

    /// Remove was requested for a container that has not finalized.
    #[error("container `{0}` is not finalized")]
    NotFinalized(String),

    /// A container with the requested name already exists on a node.
    #[error("container of same name already exists: {0}")]
    ContainerExists(String),

    /// A container reference matched more than one container.
    #[error("ambiguous container reference `{0}`")]
    Ambiguous(String),

    /// jstop/jdelete matched no `name-<int>` containers.
    #[error("no such job to act on")]
    NoMatchingJob,

    /// Tunnel target container not found on any node.
    #[error("container `{0}` not found")]
    ContainerNotFound(String),

    /// Tunnel route missing, or it did not appear in time.
    #[error("tcp connection `{0}` not found or connection timeout")]
    TunnelNotFound(String),

    /// `run` filtered every node out via include/exclude lists.
    #[error("all nodes excluded")]
    AllNodesExcluded,

    /// Unhandled failure, stringified.
    #[error("{0}")]
    Internal(String),
}

impl CorralError {
    /// The numeric wire code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::UnknownCommand(_) => 1,
            Self::TokenExpired => 2,
            Self::InvalidToken => 3,
            Self::MissingUser => 4,
            Self::MissingKind => 5,
            Self::BadKind(_) => 6,
            Self::NoPermission => 7,
            Self::BadRequest(_) => 8,
            Self::AlreadyStopped(_) => 9,
            Self::Daemon { .. } => 10,
            Self::BadGpuCount(_) => 11,
            Self::Unschedulable { .. } => 12,
            Self::NotFinalized(_) => 13,
            Self::ContainerExists(_) => 14,
            Self::Ambiguous(_) => 15,
            Self::NoMatchingJob => 16,
            Self::ContainerNotFound(_) => 17,
            Self::TunnelNotFound(_) => 18,
            Self::AllNodesExcluded => 19,
            Self::Internal(_) => -1,
        }
    }

    /// Rebuild an error from a `{code, msg}` pair received off the wire.
    ///
    /// Structured variants cannot be reconstructed from the message
    /// string alone, so anything that is not a pass-through code becomes
    /// [`CorralError::Daemon`] carrying the original pair.
    pub fn from_wire(code: i64, msg: String) -> Self {
        match code {
            2 => Self::TokenExpired,
            3 => Self::InvalidToken,
            7 => Self::NoPermission,
            16 => Self::NoMatchingJob,
            19 => Self::AllNodesExcluded,
            -1 => Self::Internal(msg),
            _ => Self::Daemon { code, msg },
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CorralError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(CorralError::UnknownCommand("x".into()).code(), 1);
        assert_eq!(CorralError::TokenExpired.code(), 2);
        assert_eq!(CorralError::InvalidToken.code(), 3);
        assert_eq!(CorralError::NoPermission.code(), 7);
        assert_eq!(CorralError::BadRequest("f".into()).code(), 8);
        assert_eq!(
            CorralError::Daemon {
                code: 9,
                msg: "already stopped".into()
            }
            .code(),
            10
        );
        assert_eq!(CorralError::BadGpuCount(3).code(), 11);
        assert_eq!(
            CorralError::Unschedulable {
                remaining: 2,
                n_gpus: 4
            }
            .code(),
            12
        );
        assert_eq!(CorralError::NotFinalized("c".into()).code(), 13);
        assert_eq!(CorralError::ContainerExists("c".into()).code(), 14);
        assert_eq!(CorralError::Ambiguous("c".into()).code(), 15);
        assert_eq!(CorralError::NoMatchingJob.code(), 16);
        assert_eq!(CorralError::ContainerNotFound("c".into()).code(), 17);
        assert_eq!(CorralError::TunnelNotFound("t".into()).code(), 18);
        assert_eq!(CorralError::AllNodesExcluded.code(), 19);
        assert_eq!(CorralError::Internal("boom".into()).code(), -1);
    }

    #[test]
    fn wire_round_trip_for_passthrough_codes() {
        let err = CorralError::from_wire(2, "token expired".into());
        assert_eq!(err, CorralError::TokenExpired);

        let err = CorralError::from_wire(42, "weird".into());
        assert_eq!(
            err,
            CorralError::Daemon {
                code: 42,
                msg: "weird".into()
            }
        );
    }

    #[test]
    fn display_carries_context() {
        let err = CorralError::UnknownCommand("frobnicate".into());
        assert_eq!(err.to_string(), "unknown command `frobnicate`");

        let err = CorralError::Unschedulable {
            remaining: 3,
            n_gpus: 8,
        };
        assert!(err.to_string().contains("3 remaining"));
    }
}
