//! Error types for the controllers.
//!
//! Defines the error taxonomy with classification for retry behavior.
//! API errors are mapped into `NotFound`, `AlreadyExists` and `Conflict` so
//! reconcilers can branch on them independently of the client in use.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// The requested object does not exist
    #[error("{resource} \"{name}\" not found")]
    NotFound { resource: String, name: String },

    /// An object with the same name already exists
    #[error("{resource} \"{name}\" already exists")]
    AlreadyExists { resource: String, name: String },

    /// Optimistic concurrency failure on write
    #[error("Operation cannot be fulfilled on {resource} \"{name}\": {message}")]
    Conflict {
        resource: String,
        name: String,
        message: String,
    },

    /// Any other Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource spec or referenced object is unusable as-is
    #[error("{0}")]
    Validation(String),

    /// Remote cluster kubeconfig could not be turned into a client
    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error wrapped with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Several independent failures from one reconcile
    #[error("{0}")]
    Aggregate(Aggregate),
}

/// A flattened list of errors rendered as `[a, b, ...]`.
#[derive(Debug)]
pub struct Aggregate(Vec<Error>);

impl Aggregate {
    /// The individual errors.
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{err}")?;
        }
        write!(f, "]")
    }
}

impl Error {
    /// NotFound for resource type `K`.
    pub fn not_found<K>(name: &str) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Error::NotFound {
            resource: qualified_resource::<K>(),
            name: name.to_string(),
        }
    }

    /// Wrap an error with the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Combine errors. Returns `None` for an empty list and the error itself
    /// when there is only one. Nested aggregates are flattened.
    pub fn aggregate(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Error::Aggregate(Aggregate(inner)) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Aggregate(Aggregate(flat))),
        }
    }

    /// Combine two errors into an aggregate, flattening nested aggregates.
    pub fn combine(self, other: Error) -> Error {
        let mut flat = Vec::new();
        for err in [self, other] {
            match err {
                Error::Aggregate(Aggregate(inner)) => flat.extend(inner),
                single => flat.push(single),
            }
        }
        Error::Aggregate(Aggregate(flat))
    }

    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Check if this error indicates the object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Conflict { .. } | Error::NotFound { .. } => true,
            Error::Context { source, .. } => source.is_retryable(),
            Error::Aggregate(agg) => agg.errors().iter().any(Error::is_retryable),
            Error::AlreadyExists { .. }
            | Error::Validation(_)
            | Error::Kubeconfig(_)
            | Error::Serialization(_) => false,
        }
    }
}

/// Fully qualified resource name as the API server reports it
/// (`nodeupgrades.anywhere.eks.amazonaws.com`, or `pods` for the core group).
pub fn qualified_resource<K>() -> String
where
    K: kube::Resource<DynamicType = ()>,
{
    let plural = K::plural(&());
    let group = K::group(&());
    if group.is_empty() {
        plural.to_string()
    } else {
        format!("{plural}.{group}")
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Extension for attaching context to fallible operations.
pub trait ResultExt<T> {
    /// Wrap the error, if any, with a lazily built context message.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// Delay before the first retry of a failing key.
pub const BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Upper bound for retry delays.
pub const BACKOFF_MAX: Duration = Duration::from_secs(1000);

/// Exponential backoff for the given number of consecutive failures.
pub fn backoff_for(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}
