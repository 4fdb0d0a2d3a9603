//! An immutable snapshot of the currently active configuration document.
use std::cmp::Ordering;

use prost::Message;
use prost_types::Timestamp;

use crate::{protocol, Error, Result};

/// A configuration document as distributed by the server.
///
/// Holds the raw wire bytes (fed verbatim to the bucketing module) alongside
/// the few fields the host reads itself. `Configuration` is immutable: a newer
/// document replaces it wholesale, it is never mutated in place.
pub(crate) struct Configuration {
    /// Raw wire encoding of the document.
    pub bytes: Vec<u8>,
    /// Logical publish timestamp; orders documents.
    pub published: Timestamp,
    /// Addresses the realtime update channel, when the environment has one.
    pub environment_id: Option<String>,
    /// Number of flags in the document. Only used for logging.
    pub flag_count: usize,
}

impl Configuration {
    /// Decode a configuration document from its wire bytes, keeping the bytes
    /// around for the bucketing module.
    pub fn from_wire(bytes: Vec<u8>) -> Result<Configuration> {
        let message = protocol::Configuration::decode(&bytes[..])?;
        let published = message.published.ok_or(Error::MissingPublished)?;
        Ok(Configuration {
            bytes,
            published,
            environment_id: message.environment_id,
            flag_count: message.flags.len(),
        })
    }

    /// Whether this document is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &Configuration) -> bool {
        timestamp_cmp(&self.published, &other.published) == Ordering::Greater
    }
}

/// Order two publish timestamps. `prost_types::Timestamp` doesn't implement
/// `Ord`, so compare (seconds, nanos) lexicographically.
pub(crate) fn timestamp_cmp(a: &Timestamp, b: &Timestamp) -> Ordering {
    (a.seconds, a.nanos).cmp(&(b.seconds, b.nanos))
}

/// Wire bytes for a minimal configuration document. Shared by tests across
/// the crate.
#[cfg(test)]
pub(crate) fn wire_configuration(seconds: i64, environment_id: Option<&str>) -> Vec<u8> {
    protocol::Configuration {
        published: Some(Timestamp { seconds, nanos: 0 }),
        environment_id: environment_id.map(str::to_owned),
        flags: vec![protocol::FlagDefinition {
            key: "example-flag".to_owned(),
        }],
    }
    .encode_to_vec()
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use crate::{protocol, Error};

    use super::{wire_configuration, Configuration};

    #[test]
    fn decodes_published_and_environment() {
        let config =
            Configuration::from_wire(wire_configuration(100, Some("env-1"))).unwrap();

        assert_eq!(config.published.seconds, 100);
        assert_eq!(config.environment_id.as_deref(), Some("env-1"));
        assert_eq!(config.flag_count, 1);
    }

    #[test]
    fn rejects_document_without_published() {
        let bytes = protocol::Configuration {
            published: None,
            environment_id: None,
            flags: vec![],
        }
        .encode_to_vec();

        assert!(matches!(
            Configuration::from_wire(bytes),
            Err(Error::MissingPublished)
        ));
    }

    #[test]
    fn newer_is_ordered_by_published() {
        let older = Configuration::from_wire(wire_configuration(100, None)).unwrap();
        let newer = Configuration::from_wire(wire_configuration(150, None)).unwrap();

        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
        assert!(!older.is_newer_than(&older));
    }
}
