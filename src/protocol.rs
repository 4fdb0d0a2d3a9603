//! Wire types shared with the AppFlags edge and the bucketing module.
//!
//! These messages are the fixed serialization contract: the configuration
//! document and user descriptor are encoded with them before crossing into the
//! bucketing module, and the bucketing result is decoded from the bytes the
//! module hands back. The message/tag layout must not change without a
//! coordinated edge and module release.

/// Server-distributed configuration document.
///
/// The SDK treats the flag payload as opaque (it is interpreted inside the
/// bucketing module); only `published` and `environment_id` are read on the
/// host side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Configuration {
    /// Logical publish timestamp; orders configuration documents.
    #[prost(message, optional, tag = "1")]
    pub published: Option<::prost_types::Timestamp>,
    /// Addresses the realtime update channel. Absent when the environment
    /// has realtime updates disabled.
    #[prost(string, optional, tag = "2")]
    pub environment_id: Option<String>,
    #[prost(message, repeated, tag = "3")]
    pub flags: Vec<FlagDefinition>,
}

/// A single flag definition inside [`Configuration`].
///
/// Evaluated by the bucketing module; the host only counts these for logging.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlagDefinition {
    #[prost(string, tag = "1")]
    pub key: String,
}

/// User descriptor handed to the bucketing module.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub key: String,
}

/// Result of bucketing a user against the current configuration.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BucketingResult {
    #[prost(message, repeated, tag = "1")]
    pub flags: Vec<ComputedFlag>,
}

/// A single computed flag value inside [`BucketingResult`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ComputedFlag {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(enumeration = "FlagValueType", tag = "2")]
    pub value_type: i32,
    #[prost(message, optional, tag = "3")]
    pub value: Option<FlagValue>,
}

/// Type tag for [`FlagValue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FlagValueType {
    Boolean = 0,
    Double = 1,
    String = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlagValue {
    #[prost(oneof = "flag_value::Value", tags = "1, 2, 3")]
    pub value: Option<flag_value::Value>,
}

pub mod flag_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(bool, tag = "1")]
        BooleanValue(bool),
        #[prost(double, tag = "2")]
        DoubleValue(f64),
        #[prost(string, tag = "3")]
        StringValue(String),
    }
}

/// Metadata sent alongside every configuration fetch, telling the edge why
/// the fetch happened and what platform is asking.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigurationLoadMetadata {
    #[prost(enumeration = "ConfigurationLoadType", tag = "1")]
    pub load_type: i32,
    #[prost(message, optional, tag = "2")]
    pub platform_data: Option<PlatformData>,
}

/// Why a configuration fetch was issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConfigurationLoadType {
    InitialLoad = 0,
    PeriodicReload = 1,
    RealtimeReload = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlatformData {
    #[prost(string, tag = "1")]
    pub sdk: String,
    #[prost(string, tag = "2")]
    pub sdk_type: String,
    #[prost(string, tag = "3")]
    pub sdk_version: String,
    #[prost(string, tag = "4")]
    pub platform: String,
    #[prost(string, tag = "5")]
    pub platform_version: String,
}

impl PlatformData {
    /// Platform descriptor for this SDK build.
    pub fn current() -> PlatformData {
        PlatformData {
            sdk: "Rust".to_owned(),
            sdk_type: "server".to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
            platform: "Rust".to_owned(),
            platform_version: option_env!("CARGO_PKG_RUST_VERSION")
                .unwrap_or_default()
                .to_owned(),
        }
    }
}
