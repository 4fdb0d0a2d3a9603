use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use derive_more::From;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::{
    bucketing::BucketingEngine,
    configuration_fetcher::ConfigurationFetcher,
    configuration_store::ConfigurationStore,
    poller::PollerThread,
    protocol::{self, ConfigurationLoadType},
    realtime::RealtimeListener,
    ClientConfig, Result,
};

/// The subject of a flag evaluation.
///
/// # Examples
/// ```
/// # use appflags::AppFlagsUser;
/// let user = AppFlagsUser::new("user-123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppFlagsUser {
    pub(crate) key: String,
}

impl AppFlagsUser {
    /// The anonymous system user, for evaluations not tied to a subject.
    pub const SYSTEM: AppFlagsUser = AppFlagsUser { key: String::new() };

    /// Create a user with the given key.
    pub fn new(key: impl Into<String>) -> AppFlagsUser {
        AppFlagsUser { key: key.into() }
    }
}

impl From<&str> for AppFlagsUser {
    fn from(key: &str) -> Self {
        AppFlagsUser::new(key)
    }
}

/// A computed flag value.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum FlagValue {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl FlagValue {
    pub fn is_boolean(&self) -> bool {
        self.as_boolean().is_some()
    }
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FlagValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        self.as_number().is_some()
    }
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FlagValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        self.as_str().is_some()
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::String(value) => Some(value),
            _ => None,
        }
    }

    fn into_boolean(self) -> Option<bool> {
        self.as_boolean()
    }
    fn into_number(self) -> Option<f64> {
        self.as_number()
    }
    fn into_string(self) -> Option<String> {
        match self {
            FlagValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::String(value.to_owned())
    }
}

/// Outcome of a typed flag lookup.
///
/// A flag existing under an incompatible type is distinct from a flag that
/// doesn't exist, and neither is an error: callers handle all three outcomes
/// explicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagLookup<T> {
    /// The flag exists and has the requested type.
    Found(T),
    /// The flag exists, but under a different type.
    WrongType,
    /// No flag with the requested key.
    Absent,
}

/// A client for AppFlags.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// The client keeps a local copy of the configuration fresh in the background
/// (periodic polling plus a realtime update stream) and evaluates flags by
/// delegating to the sandboxed bucketing module.
pub struct AppFlagsClient {
    engine: Arc<BucketingEngine>,
    observers: Arc<ObserverRegistry>,
    poller: PollerThread,
    realtime: Option<RealtimeListener>,
}

impl AppFlagsClient {
    /// Create a new `AppFlagsClient` using the specified configuration.
    ///
    /// Performs the initial configuration fetch synchronously; its failure
    /// aborts construction.
    pub(crate) fn new(config: ClientConfig) -> Result<AppFlagsClient> {
        let fetcher = ConfigurationFetcher::new(config.edge_url.clone(), config.sdk_key);
        let store = Arc::new(ConfigurationStore::new());
        let engine = Arc::new(BucketingEngine::new(&config.bucketing_module)?);
        let observers = Arc::new(ObserverRegistry::new());

        let initial = fetcher.fetch_configuration(ConfigurationLoadType::InitialLoad, None)?;
        let environment_id = initial.environment_id.clone();
        engine.set_configuration(&initial.bytes)?;
        store.set_configuration(initial);

        let updater = Arc::new(ConfigurationUpdater {
            fetcher,
            store,
            engine: Arc::clone(&engine),
            observers: Arc::clone(&observers),
        });

        let poller = PollerThread::start(Arc::clone(&updater), config.poll_interval)?;

        // Realtime updates are only available when the document declares an
        // environment id, and losing them is not fatal: polling still keeps
        // the configuration fresh.
        let realtime = environment_id.and_then(|environment_id| {
            RealtimeListener::start(config.edge_url, environment_id, updater)
                .inspect_err(|err| {
                    log::error!(target: "appflags",
                        "error listening for realtime updates, no realtime updates will occur: {:?}", err);
                })
                .ok()
        });

        Ok(AppFlagsClient {
            engine,
            observers,
            poller,
            realtime,
        })
    }

    /// Evaluate every flag for the given user.
    pub fn get_all_flags(&self, user: &AppFlagsUser) -> Result<HashMap<String, FlagValue>> {
        let user_bytes = protocol::User {
            key: user.key.clone(),
        }
        .encode_to_vec();

        let result_bytes = self.engine.bucket(&user_bytes)?;
        decode_bucketing_result(&result_bytes)
    }

    /// Look up a boolean flag for the given user.
    pub fn get_boolean_flag(
        &self,
        flag_key: &str,
        user: &AppFlagsUser,
    ) -> Result<FlagLookup<bool>> {
        self.get_flag(flag_key, user, FlagValue::into_boolean)
    }

    /// Look up a numeric flag for the given user.
    pub fn get_number_flag(&self, flag_key: &str, user: &AppFlagsUser) -> Result<FlagLookup<f64>> {
        self.get_flag(flag_key, user, FlagValue::into_number)
    }

    /// Look up a string flag for the given user.
    pub fn get_string_flag(
        &self,
        flag_key: &str,
        user: &AppFlagsUser,
    ) -> Result<FlagLookup<String>> {
        self.get_flag(flag_key, user, FlagValue::into_string)
    }

    /// Boolean flag value for the given user, or `default` when the flag is
    /// absent, has another type, or evaluation fails.
    pub fn get_boolean_variation(
        &self,
        flag_key: &str,
        user: &AppFlagsUser,
        default: bool,
    ) -> bool {
        variation_or_default(self.get_boolean_flag(flag_key, user), flag_key, default)
    }

    /// Numeric flag value for the given user, or `default` (see
    /// [`AppFlagsClient::get_boolean_variation`]).
    pub fn get_number_variation(&self, flag_key: &str, user: &AppFlagsUser, default: f64) -> f64 {
        variation_or_default(self.get_number_flag(flag_key, user), flag_key, default)
    }

    /// String flag value for the given user, or `default` (see
    /// [`AppFlagsClient::get_boolean_variation`]).
    pub fn get_string_variation(
        &self,
        flag_key: &str,
        user: &AppFlagsUser,
        default: impl Into<String>,
    ) -> String {
        variation_or_default(self.get_string_flag(flag_key, user), flag_key, default.into())
    }

    /// Register a handler to run after every accepted configuration update.
    ///
    /// Handlers run on their own worker threads, unordered with respect to
    /// each other and to concurrent evaluations; a slow handler never blocks
    /// configuration updates.
    pub fn on_configuration_change(&self, handler: impl Fn() + Send + 'static) -> Result<()> {
        self.observers.add(handler)?;
        Ok(())
    }

    /// Shut the client down: stop polling, close the update stream, and
    /// release the observer workers. In-flight bucketing calls are allowed
    /// to finish.
    pub fn close(self) -> Result<()> {
        if let Some(realtime) = &self.realtime {
            realtime.stop();
        }
        self.observers.shutdown();
        self.poller.shutdown()
    }

    fn get_flag<T>(
        &self,
        flag_key: &str,
        user: &AppFlagsUser,
        narrow: fn(FlagValue) -> Option<T>,
    ) -> Result<FlagLookup<T>> {
        let mut flags = self.get_all_flags(user)?;
        Ok(narrow_flag(flags.remove(flag_key), narrow))
    }
}

/// Runs one fetch-and-offer cycle on behalf of the poller and the realtime
/// reload worker: fetch the document, offer it to the store with the
/// bucketing module reload as the acceptance action, and fan out change
/// notifications when accepted.
pub(crate) struct ConfigurationUpdater {
    fetcher: ConfigurationFetcher,
    store: Arc<ConfigurationStore>,
    engine: Arc<BucketingEngine>,
    observers: Arc<ObserverRegistry>,
}

impl ConfigurationUpdater {
    pub fn reload(
        &self,
        load_type: ConfigurationLoadType,
        get_update_at: Option<f64>,
    ) -> Result<()> {
        let config = self.fetcher.fetch_configuration(load_type, get_update_at)?;
        let published = config.published.seconds;

        let accepted = self
            .store
            .offer_if_newer(config, |config| self.engine.set_configuration(&config.bytes))?;

        if accepted {
            log::info!(target: "appflags", published; "updated configuration");
            self.observers.notify_all();
        }
        Ok(())
    }
}

/// Configuration change handlers, each with its own worker thread fed by a
/// bounded queue. Notification is non-blocking for the notifier: a full
/// queue means a notification is already pending, and since notifications
/// carry no payload they coalesce.
pub(crate) struct ObserverRegistry {
    observers: Mutex<Vec<std::sync::mpsc::SyncSender<()>>>,
}

const OBSERVER_QUEUE_DEPTH: usize = 16;

impl ObserverRegistry {
    pub fn new() -> ObserverRegistry {
        ObserverRegistry {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, handler: impl Fn() + Send + 'static) -> std::io::Result<()> {
        let (sender, receiver) = std::sync::mpsc::sync_channel::<()>(OBSERVER_QUEUE_DEPTH);

        std::thread::Builder::new()
            .name("appflags-observer".to_owned())
            .spawn(move || {
                // Exits when the sender is dropped on shutdown.
                while receiver.recv().is_ok() {
                    handler();
                }
            })?;

        self.observers
            .lock()
            .expect("thread holding observers lock should not panic")
            .push(sender);
        Ok(())
    }

    pub fn notify_all(&self) {
        let observers = self
            .observers
            .lock()
            .expect("thread holding observers lock should not panic");
        for observer in observers.iter() {
            let _ = observer.try_send(());
        }
    }

    /// Drop all senders, letting the worker threads drain and exit.
    pub fn shutdown(&self) {
        self.observers
            .lock()
            .expect("thread holding observers lock should not panic")
            .clear();
    }
}

fn decode_bucketing_result(bytes: &[u8]) -> Result<HashMap<String, FlagValue>> {
    let result = protocol::BucketingResult::decode(bytes)?;

    let mut flags = HashMap::with_capacity(result.flags.len());
    for flag in result.flags {
        let key = flag.key;
        let Some(value) = flag.value.and_then(|value| value.value) else {
            log::warn!(target: "appflags", flag_key = key.as_str(); "computed flag carries no value, skipping");
            continue;
        };
        let value = match value {
            protocol::flag_value::Value::BooleanValue(value) => FlagValue::Boolean(value),
            protocol::flag_value::Value::DoubleValue(value) => FlagValue::Number(value),
            protocol::flag_value::Value::StringValue(value) => FlagValue::String(value),
        };
        flags.insert(key, value);
    }
    Ok(flags)
}

fn narrow_flag<T>(value: Option<FlagValue>, narrow: fn(FlagValue) -> Option<T>) -> FlagLookup<T> {
    match value {
        None => FlagLookup::Absent,
        Some(value) => match narrow(value) {
            Some(value) => FlagLookup::Found(value),
            None => FlagLookup::WrongType,
        },
    }
}

fn variation_or_default<T>(lookup: Result<FlagLookup<T>>, flag_key: &str, default: T) -> T {
    match lookup {
        Ok(FlagLookup::Found(value)) => value,
        Ok(FlagLookup::Absent) => default,
        Ok(FlagLookup::WrongType) => {
            log::warn!(target: "appflags", flag_key; "flag has a different type, returning default");
            default
        }
        Err(err) => {
            log::warn!(target: "appflags", flag_key; "error evaluating flag, returning default: {:?}", err);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use crate::protocol;

    use super::{
        decode_bucketing_result, narrow_flag, variation_or_default, AppFlagsUser, FlagLookup,
        FlagValue,
    };

    fn computed_flag(key: &str, value: protocol::flag_value::Value) -> protocol::ComputedFlag {
        let value_type = match &value {
            protocol::flag_value::Value::BooleanValue(_) => protocol::FlagValueType::Boolean,
            protocol::flag_value::Value::DoubleValue(_) => protocol::FlagValueType::Double,
            protocol::flag_value::Value::StringValue(_) => protocol::FlagValueType::String,
        };
        protocol::ComputedFlag {
            key: key.to_owned(),
            value_type: value_type as i32,
            value: Some(protocol::FlagValue { value: Some(value) }),
        }
    }

    #[test]
    fn system_user_has_an_empty_key() {
        assert_eq!(AppFlagsUser::SYSTEM, AppFlagsUser::new(""));
    }

    #[test]
    fn bucketing_result_decodes_to_flag_map() {
        use protocol::flag_value::Value;

        let bytes = protocol::BucketingResult {
            flags: vec![
                computed_flag("bool-flag", Value::BooleanValue(true)),
                computed_flag("number-flag", Value::DoubleValue(2.5)),
                computed_flag("string-flag", Value::StringValue("green".to_owned())),
            ],
        }
        .encode_to_vec();

        let flags = decode_bucketing_result(&bytes).unwrap();

        assert_eq!(flags.len(), 3);
        assert_eq!(flags["bool-flag"], FlagValue::Boolean(true));
        assert_eq!(flags["number-flag"], FlagValue::Number(2.5));
        assert_eq!(flags["string-flag"], FlagValue::String("green".to_owned()));
    }

    #[test]
    fn flag_without_value_is_skipped() {
        let bytes = protocol::BucketingResult {
            flags: vec![protocol::ComputedFlag {
                key: "empty".to_owned(),
                value_type: protocol::FlagValueType::Boolean as i32,
                value: None,
            }],
        }
        .encode_to_vec();

        let flags = decode_bucketing_result(&bytes).unwrap();

        assert!(flags.is_empty());
    }

    #[test]
    fn lookup_distinguishes_found_wrong_type_and_absent() {
        assert_eq!(
            narrow_flag(Some(FlagValue::Boolean(true)), FlagValue::into_boolean),
            FlagLookup::Found(true)
        );
        assert_eq!(
            narrow_flag(Some(FlagValue::String("on".to_owned())), FlagValue::into_boolean),
            FlagLookup::WrongType
        );
        assert_eq!(
            narrow_flag(None, FlagValue::into_boolean),
            FlagLookup::Absent
        );
    }

    #[test]
    fn variation_falls_back_to_default() {
        assert!(variation_or_default(Ok(FlagLookup::Found(true)), "flag", false));
        assert!(!variation_or_default(Ok(FlagLookup::Absent), "flag", false));
        assert!(!variation_or_default(Ok(FlagLookup::WrongType), "flag", false));
        assert!(variation_or_default::<bool>(
            Err(crate::Error::NullPointer),
            "flag",
            true
        ));
    }

    #[test]
    fn malformed_result_bytes_are_a_fault() {
        // A truncated length-delimited field.
        let bytes = [0x0a, 0xff];

        assert!(decode_bucketing_result(&bytes).is_err());
    }
}
