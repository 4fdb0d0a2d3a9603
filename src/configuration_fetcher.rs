//! An HTTP client that fetches configuration documents from the AppFlags
//! edge.
use std::sync::atomic::{AtomicBool, Ordering};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use prost::Message;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    configuration::Configuration,
    protocol::{ConfigurationLoadMetadata, ConfigurationLoadType, PlatformData},
    Error, Result,
};

const CONFIGURATION_ENDPOINT: &str = "/configuration/v1/config";

/// JSON envelope for the configuration request. The metadata document itself
/// is binary and travels base64-encoded.
#[derive(Serialize)]
struct GetConfigurationRequest {
    metadata: String,
}

#[derive(Deserialize)]
struct GetConfigurationResponse {
    /// Base64-encoded configuration document.
    configuration: String,
}

/// A client that fetches AppFlags configuration from the edge.
///
/// Shared by the poller thread and the realtime reload worker.
pub(crate) struct ConfigurationFetcher {
    // Client holds a connection pool internally, so we're reusing the client
    // between requests.
    client: reqwest::blocking::Client,
    edge_url: String,
    sdk_key: String,
    /// If we receive a 401 Unauthorized error during a request, it means the
    /// SDK key is not valid. We latch this error so we don't issue additional
    /// requests to the server.
    unauthorized: AtomicBool,
}

impl ConfigurationFetcher {
    pub fn new(edge_url: String, sdk_key: String) -> ConfigurationFetcher {
        ConfigurationFetcher {
            client: reqwest::blocking::Client::new(),
            edge_url,
            sdk_key,
            unauthorized: AtomicBool::new(false),
        }
    }

    /// Fetch the current configuration document.
    ///
    /// `get_update_at` asks the edge for a document no older than the given
    /// publish timestamp. It is set for realtime reloads, where the update
    /// event already told us the timestamp to expect.
    pub fn fetch_configuration(
        &self,
        load_type: ConfigurationLoadType,
        get_update_at: Option<f64>,
    ) -> Result<Configuration> {
        if self.unauthorized.load(Ordering::Acquire) {
            return Err(Error::Unauthorized);
        }

        let mut url = Url::parse(&format!("{}{}", self.edge_url, CONFIGURATION_ENDPOINT))
            .map_err(Error::InvalidBaseUrl)?;
        if let Some(published) = get_update_at {
            url.query_pairs_mut()
                .append_pair("getUpdateAt", &published.to_string());
        }

        log::debug!(target: "appflags", load_type = load_type as i32; "fetching configuration");
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer: {}", self.sdk_key))
            .json(&GetConfigurationRequest {
                metadata: load_metadata(load_type),
            })
            .send()?;

        let response = response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "appflags", "client is not authorized. Check your SDK key");
                self.unauthorized.store(true, Ordering::Release);
                Error::Unauthorized
            } else {
                log::warn!(target: "appflags", "received non-200 response while fetching configuration: {:?}", err);
                Error::from(err)
            }
        })?;

        let body: GetConfigurationResponse = response.json()?;
        let configuration = Configuration::from_wire(BASE64_STANDARD.decode(body.configuration)?)?;

        log::debug!(target: "appflags",
            published = configuration.published.seconds,
            flag_count = configuration.flag_count;
            "successfully fetched configuration");

        Ok(configuration)
    }
}

/// Base64-encoded load-metadata document carried in the request body.
fn load_metadata(load_type: ConfigurationLoadType) -> String {
    let metadata = ConfigurationLoadMetadata {
        load_type: load_type as i32,
        platform_data: Some(PlatformData::current()),
    };
    BASE64_STANDARD.encode(metadata.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use prost::Message;

    use crate::protocol::{ConfigurationLoadMetadata, ConfigurationLoadType};

    use super::load_metadata;

    #[test]
    fn load_metadata_encodes_load_type_and_platform() {
        let encoded = load_metadata(ConfigurationLoadType::RealtimeReload);

        let decoded =
            ConfigurationLoadMetadata::decode(&BASE64_STANDARD.decode(encoded).unwrap()[..])
                .unwrap();

        assert_eq!(
            decoded.load_type,
            ConfigurationLoadType::RealtimeReload as i32
        );
        let platform = decoded.platform_data.unwrap();
        assert_eq!(platform.sdk, "Rust");
        assert_eq!(platform.sdk_type, "server");
        assert_eq!(platform.sdk_version, env!("CARGO_PKG_VERSION"));
    }
}
