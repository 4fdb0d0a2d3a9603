use std::time::Duration;

use crate::{poller, AppFlagsClient, Result};

/// Configuration for [`AppFlagsClient`].
pub struct ClientConfig {
    pub(crate) sdk_key: String,
    pub(crate) edge_url: String,
    pub(crate) poll_interval: Duration,
    pub(crate) bucketing_module: Vec<u8>,
}

impl ClientConfig {
    /// Default edge URL for API calls.
    pub const DEFAULT_EDGE_URL: &'static str = "https://edge.appflags.net";

    /// Create a default AppFlags configuration using the specified SDK key
    /// and the bucketing module's WASM bytes.
    ///
    /// The bucketing module is distributed separately from this crate.
    ///
    /// ```no_run
    /// # use appflags::ClientConfig;
    /// # let module_bytes: Vec<u8> = vec![];
    /// ClientConfig::from_sdk_key("sdk-key", module_bytes);
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>, bucketing_module: impl Into<Vec<u8>>) -> Self {
        ClientConfig {
            sdk_key: sdk_key.into(),
            edge_url: ClientConfig::DEFAULT_EDGE_URL.to_owned(),
            poll_interval: poller::DEFAULT_POLL_INTERVAL,
            bucketing_module: bucketing_module.into(),
        }
    }

    /// Override the edge URL for API calls. Clients should use the default
    /// setting in most cases.
    pub fn edge_url(mut self, edge_url: impl Into<String>) -> Self {
        self.edge_url = edge_url.into();
        self
    }

    /// Override the interval between configuration polls.
    ///
    /// Values below one minute are clamped up to one minute.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Create a new [`AppFlagsClient`] using the specified configuration.
    ///
    /// This performs the initial configuration fetch synchronously and
    /// fails if the configuration cannot be fetched or the bucketing module
    /// cannot be instantiated.
    pub fn to_client(self) -> Result<AppFlagsClient> {
        AppFlagsClient::new(self)
    }
}
