use crate::WaypointId;
use std::fmt;

/// Errors produced while loading a level or querying the simulation.
///
/// Load-time variants ([Error::Configuration], [Error::GraphIntegrity]) abort the level load.
/// The remaining variants are recoverable and are handled by whoever made the query.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A setup parameter is out of range, e.g. a non-positive cell size.
    Configuration(String),
    /// Authoring data references a waypoint or intersection that does not exist,
    /// or its links are not mirrored.
    GraphIntegrity {
        waypoint: WaypointId,
        reason: String,
    },
    /// A waypoint index is the invalid sentinel or out of range.
    InvalidIndex(WaypointId),
    /// An agent ID is stale or was never issued.
    UnknownAgent,
    /// No waypoint or successor satisfies the query.
    NoRouteFound { from: Option<WaypointId> },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(msg) => write!(f, "Invalid configuration: {msg}"),
            Error::GraphIntegrity { waypoint, reason } => {
                write!(f, "Waypoint graph integrity error at {waypoint}: {reason}")
            }
            Error::InvalidIndex(id) => write!(f, "Invalid waypoint index {id}"),
            Error::UnknownAgent => write!(f, "Unknown or removed agent"),
            Error::NoRouteFound { from: Some(id) } => write!(f, "No route found from {id}"),
            Error::NoRouteFound { from: None } => write!(f, "No route found"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
