//! Error type shared by every engine module.
//!
//! Coordinate math only fails on inputs rejected at the place/time boundary or
//! on degenerate directions. Quiz and lobby errors report an illegal transition
//! without touching state. Service errors separate transient failures (retried
//! on the poll interval) from the fatal ones.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FirmamentError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FirmamentError {
    /// Latitude outside [-PI/2, PI/2] or not finite.
    #[error("invalid latitude: {0} rad")]
    InvalidLatitude(f64),

    /// Longitude that is not a finite number.
    #[error("invalid longitude: {0} rad")]
    InvalidLongitude(f64),

    /// Zero-length or non-finite direction vector.
    #[error("invalid direction")]
    InvalidDirection,

    #[error("question already answered")]
    AlreadyAnswered,

    #[error("quiz already finished")]
    AlreadyFinished,

    #[error("no active quiz")]
    NoActiveQuiz,

    #[error("no active lobby")]
    NoActiveLobby,

    /// Answer submitted before the grace delay elapsed or after the window closed.
    #[error("answer window is not open")]
    AnswerWindowClosed,

    #[error("only the lobby host can do that")]
    NotHost,

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("unknown family: {0}")]
    UnknownFamily(String),

    #[error("unknown group {index} in family {family}")]
    UnknownGroup { family: String, index: usize },

    /// The request did not reach the service or got no usable answer.
    #[error("transient network failure: {0}")]
    TransientNetworkFailure(String),

    #[error("lobby not found: {0}")]
    LobbyNotFound(String),

    /// The service understood the request and refused it.
    #[error("rejected by service: {0}")]
    Rejected(String),

    #[error("finishing lobby failed after {attempts} attempts")]
    FinishFailed { attempts: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid catalog data: {0}")]
    InvalidCatalog(String),

    /// The session loop has shut down and can no longer take commands.
    #[error("session stopped")]
    SessionStopped,
}

impl FirmamentError {
    /// Whether the failure should be retried on the next poll instead of surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, FirmamentError::TransientNetworkFailure(_))
    }
}
