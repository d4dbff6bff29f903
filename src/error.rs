// SPDX-License-Identifier: Apache-2.0

//! Error codes carried on the wire and the crate-internal error taxonomy.

use num_derive::FromPrimitive;
use thiserror::Error;

/// The standard error codes exchanged in reply packets. Codes outside this
/// enum are application-defined and pass through untouched.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum ErrorCode {
    /// The request succeeded.
    Success = 0,
    /// The request was malformed or referenced an unknown message/stage type.
    BadRequest = 400,
    /// No stage with the requested id exists on the target node.
    StageNotFound = 404,
    /// A handler raised an unexpected error.
    InternalError = 500,
    /// The session or link closed while the request was in flight.
    Disconnected = 60201,
    /// The pending reply passed its deadline.
    Timeout = 60202,
    /// The session has not completed the authentication exchange.
    Unauthenticated = 60203,
    /// Another session authenticated with the same account into the stage.
    DuplicateLogin = 60204,
    /// The target node has no live link.
    NodeUnreachable = 60205,
    /// The live stage's type differs from the requested one.
    WrongStageType = 60206,
    /// The target stage's queue is at capacity.
    Overloaded = 60207,
}

impl ErrorCode {
    /// The `u16` wire representation.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Resolve a wire code back to a known variant, if it is one.
    pub fn from_code(code: u16) -> Option<Self> {
        num_traits::FromPrimitive::from_u16(code)
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

/// Frame decoding failures. Any of these terminates the offending session.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The declared frame length exceeds the configured maximum.
    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    Oversize {
        /// Declared length.
        length: usize,
        /// Configured `max_packet_size`.
        max: usize,
    },
    /// A length field points past the end of the frame.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The message id is empty or longer than 255 bytes.
    #[error("invalid msg id length: {0}")]
    BadMsgId(usize),
    /// The message id is not valid UTF-8.
    #[error("msg id is not utf8")]
    BadUtf8,
    /// The payload failed to decompress to the advertised size.
    #[error("failed to decompress payload: {0}")]
    BadCompression(anyhow::Error),
}

/// Failure to enqueue an item onto a stage's queue.
#[derive(Debug, Error)]
pub enum PostError {
    /// The queue is at capacity.
    #[error("stage {0} queue is at capacity")]
    Overloaded(i64),
    /// The stage was destroyed.
    #[error("stage {0} is closed")]
    Closed(i64),
}

impl PostError {
    /// The wire error code this failure maps to.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            PostError::Overloaded(_) => ErrorCode::Overloaded,
            PostError::Closed(_) => ErrorCode::StageNotFound,
        }
    }
}

/// Routing failures surfaced to callers as reply error codes.
#[derive(Debug, Error)]
pub enum RouteError {
    /// No stage with the target id exists on this node.
    #[error("stage {0} not found")]
    StageNotFound(i64),
    /// The target node id is not in the endpoint table.
    #[error("unknown node {0}")]
    UnknownNode(String),
    /// The target node has no live link.
    #[error("node {0} unreachable")]
    NodeUnreachable(String),
    /// No node currently serves the service id.
    #[error("no live node for service {0}")]
    ServiceUnavailable(u16),
    /// The stage exists but refused the post.
    #[error(transparent)]
    Post(#[from] PostError),
}

impl RouteError {
    /// The wire error code this failure maps to.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RouteError::StageNotFound(_) => ErrorCode::StageNotFound,
            RouteError::UnknownNode(_) | RouteError::NodeUnreachable(_) => ErrorCode::NodeUnreachable,
            RouteError::ServiceUnavailable(_) => ErrorCode::NodeUnreachable,
            RouteError::Post(e) => e.error_code(),
        }
    }
}
