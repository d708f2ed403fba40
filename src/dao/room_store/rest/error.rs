//! Error types raised by the REST backend.

use reqwest::StatusCode;
use thiserror::Error;

use crate::dao::storage::StorageError;

/// Convenient result alias returning [`RestDaoError`] failures.
pub type RestResult<T> = Result<T, RestDaoError>;

/// Failures that can occur while talking to the REST backend.
#[derive(Debug, Error)]
pub enum RestDaoError {
    /// Required environment variable is missing.
    #[error("missing REST backend environment variable `{var}`")]
    MissingEnvVar {
        /// Name of the variable.
        var: &'static str,
    },
    /// Environment variable is present but unusable.
    #[error("invalid REST backend environment variable `{var}`")]
    InvalidEnvVar {
        /// Name of the variable.
        var: &'static str,
    },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build REST client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// A request could not be sent.
    #[error("failed to send REST request to `{path}`")]
    RequestSend {
        /// Path below the REST prefix.
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// The backend answered with an unexpected status code.
    #[error("unexpected REST response status {status} for `{path}`")]
    RequestStatus {
        /// Path below the REST prefix.
        path: String,
        /// Status returned by the backend.
        status: StatusCode,
    },
    /// Response payload could not be decoded.
    #[error("failed to decode REST response for `{path}`")]
    DecodeResponse {
        /// Path below the REST prefix.
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// A write returned no representation.
    #[error("REST write to `{path}` returned no row")]
    EmptyRepresentation {
        /// Path below the REST prefix.
        path: String,
    },
}

impl From<RestDaoError> for StorageError {
    fn from(err: RestDaoError) -> Self {
        match err {
            RestDaoError::RequestStatus { path, status } if status == StatusCode::NOT_FOUND => {
                StorageError::not_found(path)
            }
            RestDaoError::RequestStatus { path, status } if status == StatusCode::CONFLICT => {
                StorageError::Conflict {
                    message: format!("conflict writing `{path}`"),
                }
            }
            other => {
                let message = other.to_string();
                StorageError::unavailable(message, other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: StatusCode) -> StorageError {
        RestDaoError::RequestStatus {
            path: "rooms?id=eq.1".into(),
            status,
        }
        .into()
    }

    #[test]
    fn statuses_map_onto_storage_errors() {
        assert!(matches!(
            status(StatusCode::NOT_FOUND),
            StorageError::NotFound { what } if what == "rooms?id=eq.1"
        ));
        assert!(matches!(status(StatusCode::CONFLICT), StorageError::Conflict { .. }));
        assert!(matches!(
            status(StatusCode::SERVICE_UNAVAILABLE),
            StorageError::Unavailable { .. }
        ));
        assert!(matches!(
            status(StatusCode::UNAUTHORIZED),
            StorageError::Unavailable { .. }
        ));
    }

    #[test]
    fn missing_representation_is_unavailable() {
        let err = StorageError::from(RestDaoError::EmptyRepresentation {
            path: "rooms".into(),
        });
        assert!(matches!(err, StorageError::Unavailable { message, .. } if message.contains("rooms")));
    }
}
