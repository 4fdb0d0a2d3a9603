use std::sync::Arc;

/// Result type used throughout the SDK, with [`Error`] as the error variant.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the AppFlags SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid edge_url configuration.
    #[error("invalid edge_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// Network error.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Error decoding a wire message (configuration document or bucketing
    /// result).
    #[error("error decoding wire message")]
    Decode(#[source] Arc<prost::DecodeError>),

    /// Error decoding a base64-encoded document from a server response.
    #[error("error decoding base64 document")]
    Base64(#[from] base64::DecodeError),

    /// Error decoding a JSON payload from the update stream.
    #[error("error decoding stream payload")]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Json(#[source] Arc<serde_json::Error>),

    /// The configuration document is missing the `published` timestamp.
    ///
    /// Documents are ordered by `published`, so a document without it can
    /// never be accepted.
    #[error("configuration is missing the published timestamp")]
    MissingPublished,

    /// The bucketing module trapped or failed to instantiate.
    #[error("bucketing module error")]
    // wasmtime::Error is not clonable, so we're wrapping it in an Arc.
    Sandbox(#[source] Arc<wasmtime::Error>),

    /// The bucketing module allocator or `bucket` export returned a null
    /// pointer.
    #[error("bucketing module returned a null pointer")]
    NullPointer,

    /// A pointer handed over by the bucketing module points outside its
    /// linear memory.
    #[error("pointer {ptr} with length {len} is out of bounds of the bucketing module memory")]
    OutOfBounds {
        /// The offending pointer.
        ptr: i32,
        /// Length of the attempted access in bytes.
        len: i32,
    },

    /// Indicates that a background thread panicked. This should normally
    /// never happen.
    #[error("background thread panicked")]
    BackgroundThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Self::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Self::Decode(Arc::new(value))
    }
}

impl From<wasmtime::Error> for Error {
    fn from(value: wasmtime::Error) -> Self {
        Self::Sandbox(Arc::new(value))
    }
}
