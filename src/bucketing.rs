//! A thin typed façade over [`SandboxBridge`] that serializes every call into
//! the bucketing module.
use std::sync::Mutex;

use crate::{bridge::SandboxBridge, Result};

/// Evaluates flag assignments by delegating to the sandboxed bucketing
/// module.
///
/// The module's runtime is not reentrant, so a single exclusive lock guards
/// every bridge operation end-to-end, including the pin/write/invoke/read
/// sequence. A slow `bucket` call therefore delays a concurrent
/// `set_configuration` and vice versa.
pub(crate) struct BucketingEngine {
    bridge: Mutex<SandboxBridge>,
}

impl BucketingEngine {
    /// Instantiate the bucketing module from its WASM bytes.
    pub fn new(module_bytes: &[u8]) -> Result<BucketingEngine> {
        Ok(BucketingEngine {
            bridge: Mutex::new(SandboxBridge::new(module_bytes)?),
        })
    }

    /// Load a serialized configuration document into the module.
    ///
    /// Last-writer-wins when called concurrently; callers order loads via
    /// [`crate::configuration_store::ConfigurationStore::offer_if_newer`].
    pub fn set_configuration(&self, config: &[u8]) -> Result<()> {
        let mut bridge = self
            .bridge
            .lock()
            .expect("thread holding bucketing lock should not panic");
        bridge.set_configuration(config)
    }

    /// Compute the serialized bucketing result for a serialized user
    /// descriptor.
    pub fn bucket(&self, user: &[u8]) -> Result<Vec<u8>> {
        let mut bridge = self
            .bridge
            .lock()
            .expect("thread holding bucketing lock should not panic");
        bridge.bucket(user)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::bridge::tests::ECHO_GUEST;

    use super::BucketingEngine;

    #[test]
    fn calls_are_serialized_across_threads() {
        let engine = Arc::new(BucketingEngine::new(ECHO_GUEST.as_bytes()).unwrap());
        engine.set_configuration(b"config").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    let user = format!("user-{i}");
                    for _ in 0..25 {
                        let result = engine.bucket(user.as_bytes()).unwrap();
                        // Never a torn result, even with concurrent loads.
                        assert_eq!(result, user.as_bytes());
                    }
                })
            })
            .collect();

        for _ in 0..10 {
            engine.set_configuration(b"reloaded-config").unwrap();
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
