//! Marshalling layer between the host and the sandboxed bucketing module.
//!
//! The bucketing module is an AssemblyScript-compiled WASM binary with a
//! garbage-collected runtime. The host writes byte buffers directly into the
//! module's linear memory through the runtime's exported allocator and must
//! pin every allocation it creates: no guest-visible root references these
//! objects, so an unpinned buffer may be collected mid-call. Pins are tracked
//! in an arena ([`SandboxBridge::pinned`]) that is drained wholesale at the
//! start of the *next* logical operation, after any result bytes from the
//! previous one have been copied out.
use wasmtime::{Caller, Engine, Extern, Instance, Linker, Memory, Module, Store, TypedFunc};

use crate::{Error, Result};

/// AssemblyScript class id of `ArrayBuffer`.
const ARRAY_BUFFER_CLASS_ID: i32 = 1;
/// AssemblyScript class id of `Uint8Array`.
const UINT8_ARRAY_CLASS_ID: i32 = 8;
/// Byte size of the `Uint8Array` wrapper: two copies of the backing-buffer
/// pointer followed by the element count, all little-endian i32.
const UINT8_ARRAY_SIZE: i32 = 12;

/// Owns the bucketing module instance and its linear memory.
///
/// `SandboxBridge` knows nothing about configuration or user semantics; it
/// moves byte buffers across the host/guest boundary and invokes the two
/// guest entry points. The guest runtime is not reentrant, so the bridge
/// takes `&mut self` everywhere and callers serialize access (see
/// [`crate::bucketing::BucketingEngine`]).
pub(crate) struct SandboxBridge {
    store: Store<()>,
    instance: Instance,
    memory: Memory,
    /// Guest pointers currently pinned against the guest's garbage
    /// collector. Every entry belongs to the most recent call.
    pinned: Vec<i32>,
}

impl SandboxBridge {
    /// Instantiate the bucketing module from its WASM bytes.
    ///
    /// Host imports are registered before instantiation since the module's
    /// start code may already call them.
    pub fn new(module_bytes: &[u8]) -> Result<SandboxBridge> {
        let engine = Engine::default();
        let module = Module::new(&engine, module_bytes)?;
        let mut store = Store::new(&engine, ());

        let mut linker = Linker::new(&engine);
        linker.func_wrap(
            "env",
            "abort",
            |mut caller: Caller<'_, ()>, message: i32, filename: i32, line: i32, column: i32| {
                let message = read_guest_string(&mut caller, message);
                let filename = read_guest_string(&mut caller, filename);
                log::error!(target: "appflags",
                    "bucketing module error in {filename}:{line}:{column} {message}");
            },
        )?;
        linker.func_wrap(
            "env",
            "console.log",
            |mut caller: Caller<'_, ()>, message: i32| {
                let message = read_guest_string(&mut caller, message);
                log::debug!(target: "appflags", "bucketing module log: {message}");
            },
        )?;

        let instance = linker.instantiate(&mut store, &module)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::Sandbox(wasmtime::Error::msg("module does not export memory").into()))?;

        Ok(SandboxBridge {
            store,
            instance,
            memory,
            pinned: Vec::new(),
        })
    }

    /// Load a serialized configuration document into the guest.
    pub fn set_configuration(&mut self, config: &[u8]) -> Result<()> {
        self.release_all()?;
        let config_ptr = self.write_buffer(config)?;

        let set_configuration =
            self.export_func::<i32, ()>("setConfiguration")?;
        set_configuration.call(&mut self.store, config_ptr)?;
        Ok(())
    }

    /// Bucket a serialized user descriptor against the loaded configuration,
    /// returning the serialized result.
    pub fn bucket(&mut self, user: &[u8]) -> Result<Vec<u8>> {
        self.release_all()?;
        let user_ptr = self.write_buffer(user)?;

        let bucket = self.export_func::<i32, i32>("bucket")?;
        let result_ptr = bucket.call(&mut self.store, user_ptr)?;
        if result_ptr == 0 {
            return Err(Error::NullPointer);
        }
        // The result must be copied out before the next release_all(): once
        // our pins are dropped the guest collector is free to reclaim it.
        self.read_buffer(result_ptr)
    }

    /// Allocate a guest `Uint8Array`, copy `bytes` into its backing buffer,
    /// and return the wrapper pointer. Both allocations are pinned.
    fn write_buffer(&mut self, bytes: &[u8]) -> Result<i32> {
        let new = self.export_func::<(i32, i32), i32>("__new")?;

        let buffer_ptr = new.call(&mut self.store, (bytes.len() as i32, ARRAY_BUFFER_CLASS_ID))?;
        if buffer_ptr == 0 {
            return Err(Error::NullPointer);
        }
        self.pin(buffer_ptr)?;

        let array_ptr = new.call(&mut self.store, (UINT8_ARRAY_SIZE, UINT8_ARRAY_CLASS_ID))?;
        if array_ptr == 0 {
            return Err(Error::NullPointer);
        }
        self.pin(array_ptr)?;

        // The wrapper holds the backing-buffer pointer twice (the guest's
        // array representation expects both fields), then the element count.
        self.write_i32(array_ptr, buffer_ptr)?;
        self.write_i32(array_ptr + 4, buffer_ptr)?;
        self.write_i32(array_ptr + 8, bytes.len() as i32)?;
        self.write_bytes(buffer_ptr, bytes)?;

        Ok(array_ptr)
    }

    /// Copy the contents of a guest `Uint8Array` out of linear memory.
    fn read_buffer(&mut self, array_ptr: i32) -> Result<Vec<u8>> {
        let buffer_ptr = self.read_i32(array_ptr + 4)?;
        let len = self.read_i32(array_ptr + 8)?;
        self.read_bytes(buffer_ptr, len)
    }

    /// Unpin every tracked allocation, letting the guest collector reclaim
    /// the previous call's buffers.
    ///
    /// Must only run at the start of a logical operation, never while the
    /// current operation's result is still in guest memory.
    fn release_all(&mut self) -> Result<()> {
        let unpin = self.export_func::<i32, ()>("__unpin")?;
        // Pop one at a time so a trapping __unpin leaves the rest tracked.
        while let Some(ptr) = self.pinned.pop() {
            unpin.call(&mut self.store, ptr)?;
        }
        Ok(())
    }

    /// Pin `ptr` so the guest collector won't reclaim it, and track it for
    /// the next [`SandboxBridge::release_all`].
    fn pin(&mut self, ptr: i32) -> Result<()> {
        let pin = self.export_func::<i32, i32>("__pin")?;
        pin.call(&mut self.store, ptr)?;
        self.pinned.push(ptr);
        Ok(())
    }

    fn export_func<P, R>(&mut self, name: &str) -> Result<TypedFunc<P, R>>
    where
        P: wasmtime::WasmParams,
        R: wasmtime::WasmResults,
    {
        Ok(self.instance.get_typed_func::<P, R>(&mut self.store, name)?)
    }

    fn read_bytes(&self, ptr: i32, len: i32) -> Result<Vec<u8>> {
        if ptr < 0 || len < 0 {
            return Err(Error::OutOfBounds { ptr, len });
        }
        let mut bytes = vec![0; len as usize];
        self.memory
            .read(&self.store, ptr as usize, &mut bytes)
            .map_err(|_| Error::OutOfBounds { ptr, len })?;
        Ok(bytes)
    }

    fn write_bytes(&mut self, ptr: i32, bytes: &[u8]) -> Result<()> {
        if ptr < 0 {
            return Err(Error::OutOfBounds {
                ptr,
                len: bytes.len() as i32,
            });
        }
        self.memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(|_| Error::OutOfBounds {
                ptr,
                len: bytes.len() as i32,
            })
    }

    fn read_i32(&self, ptr: i32) -> Result<i32> {
        let bytes = self.read_bytes(ptr, 4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn write_i32(&mut self, ptr: i32, value: i32) -> Result<()> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }
}

/// Decode an AssemblyScript string from guest memory for the `abort` and
/// `console.log` imports. Strings are UTF-16LE with the byte length stored as
/// an i32 immediately before the character data.
///
/// Never fails: the imports must not trap on a bad pointer, so decoding
/// errors degrade to a placeholder.
fn read_guest_string(caller: &mut Caller<'_, ()>, ptr: i32) -> String {
    let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
        return "<no memory export>".to_owned();
    };
    let data = memory.data(&caller);

    let Some(len) = read_le_i32(data, ptr.wrapping_sub(4)) else {
        return format!("<invalid string pointer {ptr}>");
    };
    if len < 0 {
        return format!("<invalid string pointer {ptr}>");
    }
    let start = ptr as usize;
    let Some(bytes) = data.get(start..start + len as usize) else {
        return format!("<invalid string pointer {ptr}>");
    };

    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn read_le_i32(data: &[u8], ptr: i32) -> Option<i32> {
    if ptr < 0 {
        return None;
    }
    let start = ptr as usize;
    let bytes = data.get(start..start + 4)?;
    Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
