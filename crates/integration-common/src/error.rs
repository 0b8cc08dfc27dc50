//! Error types for the integration operator
//!
//! Errors carry the resource they concern where one is known so that the
//! message written to a status condition is useful on its own.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for integration operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Optimistic concurrency conflict (HTTP 409)
    #[error("conflict updating {resource}: {message}")]
    Conflict {
        /// The resource whose write was rejected
        resource: String,
        /// Message returned by the API server
        message: String,
    },

    /// A referenced object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Namespaced name of the missing object
        name: String,
    },

    /// Validation error for resolved configuration or specs
    #[error("{message}")]
    Validation {
        /// Name of the resource whose configuration is invalid
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The offending property, if any
        property: Option<String>,
    },

    /// Apparatus endpoint call failed
    #[error("apparatus error [{endpoint}]: {message}")]
    Apparatus {
        /// URL that was called
        endpoint: String,
        /// Description of what failed
        message: String,
        /// HTTP status code if a response was received
        status: Option<u16>,
    },

    /// Template rendering failed
    #[error("template error: {message}")]
    Template {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "coupler", "bus", "applier")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            property: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            property: None,
        }
    }

    /// Create the error raised when a required interface property is missing
    pub fn required_property(resource: impl Into<String>, property: impl Into<String>) -> Self {
        let property = property.into();
        Self::Validation {
            resource: resource.into(),
            message: format!("property '{}' is required", property),
            property: Some(property),
        }
    }

    /// Create a not found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an apparatus error without a response status
    pub fn apparatus(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Apparatus {
            endpoint: endpoint.into(),
            message: msg.into(),
            status: None,
        }
    }

    /// Create an apparatus error for a non-success response
    pub fn apparatus_status(endpoint: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::Apparatus {
            endpoint: endpoint.into(),
            message: body.into(),
            status: Some(status),
        }
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube error, lifting 409 and 404 responses into structured variants
    pub fn from_kube(resource: impl Into<String>, kind: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                resource: resource.into(),
                message: ae.message,
            },
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                name: resource.into(),
            },
            other => Self::Kube { source: other },
        }
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Check if this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error is a missing required property
    pub fn is_missing_required(&self) -> bool {
        matches!(self, Error::Validation { property: Some(_), .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation, template and serialization errors need a spec change.
    /// Kubernetes errors are retryable unless they are 4xx (other than 409).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Conflict { .. } => true,
            Error::NotFound { .. } => true,
            Error::Validation { .. } => false,
            Error::Apparatus { status, .. } => !matches!(status, Some(400..=499)),
            Error::Template { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<minijinja::Error> for Error {
    fn from(err: minijinja::Error) -> Self {
        Self::template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Errors surfaced while coupling plugs and sockets
    // ==========================================================================

    /// Story: a missing required property produces the user-facing message
    ///
    /// The message lands verbatim in the plug's Joined condition, so its
    /// wording is part of the contract.
    #[test]
    fn story_required_property_message_is_user_facing() {
        let err = Error::required_property("default/app", "host");
        assert_eq!(err.to_string(), "property 'host' is required");
        assert!(err.is_missing_required());
        assert!(!err.is_retryable());

        match err {
            Error::Validation { property, resource, .. } => {
                assert_eq!(property.as_deref(), Some("host"));
                assert_eq!(resource, "default/app");
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: a stale write is classified as a conflict, not a failure
    #[test]
    fn story_conflicts_are_structured() {
        let err = Error::from_kube("default/db", "Socket", api_error(409, "object was modified"));
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("default/db"));

        // Raw kube errors carrying 409 are recognised too
        let raw = Error::from(api_error(409, "object was modified"));
        assert!(raw.is_conflict());
    }

    /// Story: a missing socket is reported as not found
    #[test]
    fn story_not_found_is_structured() {
        let err = Error::from_kube("default/missing", "Socket", api_error(404, "not found"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Socket 'default/missing' not found");

        let other = Error::from_kube("default/db", "Socket", api_error(403, "forbidden"));
        assert!(!other.is_not_found());
        assert!(!other.is_retryable());
    }

    /// Story: apparatus errors keep the endpoint and status for debugging
    #[test]
    fn story_apparatus_errors_carry_endpoint() {
        let err = Error::apparatus_status("http://db-apparatus/config", 500, "boom");
        assert!(err.to_string().contains("http://db-apparatus/config"));
        assert!(err.is_retryable());

        let err = Error::apparatus_status("http://db-apparatus/config", 400, "bad request");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal_context() {
        let err = Error::internal_with_context("bus", "queue closed");
        assert_eq!(err.context(), Some("bus"));
        assert!(Error::validation("x").context().is_none());
    }
}
