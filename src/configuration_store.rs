//! A thread-safe in-memory storage for the currently active configuration
//! document, with "accept if newer" semantics reconciling the two update
//! sources (periodic polling and realtime update events).
use std::sync::{Arc, RwLock};

use crate::{configuration::Configuration, Result};

/// `ConfigurationStore` provides a thread-safe (`Sync`) storage for the
/// current configuration document that allows concurrent access for readers
/// and writers.
///
/// `Configuration` itself is always immutable and can only be replaced
/// completely.
#[derive(Default)]
pub(crate) struct ConfigurationStore {
    configuration: RwLock<Option<Arc<Configuration>>>,
}

impl ConfigurationStore {
    /// Create a new empty configuration store.
    pub fn new() -> Self {
        ConfigurationStore::default()
    }

    /// Get the currently-active configuration. Returns `None` if no
    /// configuration has been stored yet.
    pub fn get_configuration(&self) -> Option<Arc<Configuration>> {
        let configuration = self
            .configuration
            .read()
            .expect("thread holding configuration lock should not panic");

        configuration.clone()
    }

    /// Store `config` unconditionally. Used for the initial synchronous load.
    pub fn set_configuration(&self, config: Configuration) {
        let new_value = Some(Arc::new(config));

        let mut configuration_slot = self
            .configuration
            .write()
            .expect("thread holding configuration lock should not panic");

        *configuration_slot = new_value;
    }

    /// Replace the current configuration with `config` if it is strictly
    /// newer, running `on_accept` (e.g., the bucketing module reload) before
    /// the swap. Returns `Ok(true)` when the document was accepted.
    ///
    /// The comparison, `on_accept`, and the swap all happen under the write
    /// lock, so two concurrent offers can never both accept out of order, and
    /// readers never observe a configuration the bucketing module hasn't
    /// loaded yet. If `on_accept` fails, the store is left unchanged.
    ///
    /// A missing current document compares as older than anything.
    pub fn offer_if_newer<F>(&self, config: Configuration, on_accept: F) -> Result<bool>
    where
        F: FnOnce(&Configuration) -> Result<()>,
    {
        let mut configuration_slot = self
            .configuration
            .write()
            .expect("thread holding configuration lock should not panic");

        if let Some(current) = &*configuration_slot {
            if !config.is_newer_than(current) {
                log::debug!(target: "appflags",
                    "discarding offered configuration because it is not newer than the current configuration");
                return Ok(false);
            }
        }

        on_accept(&config)?;
        *configuration_slot = Some(Arc::new(config));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use crate::configuration::{wire_configuration, Configuration};
    use crate::{Error, Result};

    use super::ConfigurationStore;

    fn config(seconds: i64) -> Configuration {
        Configuration::from_wire(wire_configuration(seconds, None)).unwrap()
    }

    #[test]
    fn can_set_configuration_from_another_thread() {
        let store = Arc::new(ConfigurationStore::new());

        assert!(store.get_configuration().is_none());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_configuration(config(100));
            })
            .join();
        }

        assert!(store.get_configuration().is_some());
    }

    #[test]
    fn first_offer_is_always_accepted() {
        let store = ConfigurationStore::new();

        assert!(store.offer_if_newer(config(100), |_| Ok(())).unwrap());
        assert_eq!(store.get_configuration().unwrap().published.seconds, 100);
    }

    #[test]
    fn offers_converge_to_greatest_published_in_either_order() {
        for (first, second) in [(150, 200), (200, 150)] {
            let store = ConfigurationStore::new();
            store.set_configuration(config(100));

            let _ = store.offer_if_newer(config(first), |_| Ok(())).unwrap();
            let _ = store.offer_if_newer(config(second), |_| Ok(())).unwrap();

            assert_eq!(store.get_configuration().unwrap().published.seconds, 200);
        }
    }

    #[test]
    fn stale_offer_is_discarded_without_running_accept() {
        let store = ConfigurationStore::new();
        store.set_configuration(config(100));

        let accepted = store
            .offer_if_newer(config(100), |_| panic!("on_accept must not run for stale offers"))
            .unwrap();

        assert!(!accepted);
        assert_eq!(store.get_configuration().unwrap().published.seconds, 100);
    }

    #[test]
    fn failed_accept_leaves_store_unchanged() {
        let store = ConfigurationStore::new();
        store.set_configuration(config(100));

        let result: Result<bool> =
            store.offer_if_newer(config(150), |_| Err(Error::NullPointer));

        assert!(result.is_err());
        assert_eq!(store.get_configuration().unwrap().published.seconds, 100);
    }

    #[test]
    fn concurrent_offers_accept_exactly_once_per_version() {
        let store = Arc::new(ConfigurationStore::new());
        store.set_configuration(config(100));
        let accepts = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = [200, 150, 200, 150]
            .into_iter()
            .map(|seconds| {
                let store = store.clone();
                let accepts = accepts.clone();
                std::thread::spawn(move || {
                    store
                        .offer_if_newer(config(seconds), |_| {
                            accepts.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.join().unwrap();
        }

        assert_eq!(store.get_configuration().unwrap().published.seconds, 200);
        // 150 may win an interleaving before 200 arrives, but 200 is accepted
        // exactly once and 150 at most once.
        assert!(accepts.load(Ordering::SeqCst) <= 2);
    }
}
