// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Per-instance ABI probing.
//!
//! The module ABI is a capability set discovered by name on a fresh
//! instance. Every getter (`*_ptr`, `*_cap`) may be exported either as a
//! no-arg `() -> i32` function or as an i32 global of the same name; a
//! wrong signature reads as missing. Which capacity export is present
//! selects the data encoding for that side of the stage, so an unknown
//! encoding is unrepresentable.

use wasmtime::{Instance, Memory, Store, TypedFunc, Val};

use crate::chain::content::DataEncoding;
use crate::errors::{Error, Result};

/// Resolved scalar-stage exports: `run(len) -> len` plus input/output
/// windows in linear memory.
pub struct ScalarAbi {
    pub memory: Memory,
    pub run: TypedFunc<i32, i32>,
    pub input_ptr: u32,
    pub input_cap: u32,
    pub input_encoding: DataEncoding,
    pub output_ptr: u32,
    pub output_cap: u32,
    pub output_encoding: DataEncoding,
}

impl std::fmt::Debug for ScalarAbi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalarAbi")
            .field("memory", &self.memory)
            .field("input_ptr", &self.input_ptr)
            .field("input_cap", &self.input_cap)
            .field("input_encoding", &self.input_encoding)
            .field("output_ptr", &self.output_ptr)
            .field("output_cap", &self.output_cap)
            .field("output_encoding", &self.output_encoding)
            .finish()
    }
}

/// Resolved tile-stage exports.
pub struct TileAbi {
    pub memory: Memory,
    pub tile: TypedFunc<(f32, f32), ()>,
    pub input_ptr: u32,
    pub input_cap: u32,
    pub uniform: Option<TypedFunc<(f32, f32), ()>>,
    pub halo: Option<TypedFunc<(), i32>>,
}

impl std::fmt::Debug for TileAbi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileAbi")
            .field("memory", &self.memory)
            .field("input_ptr", &self.input_ptr)
            .field("input_cap", &self.input_cap)
            .field("uniform", &self.uniform.is_some())
            .field("halo", &self.halo.is_some())
            .finish()
    }
}

/// Read an i32 value exported under `name` as a global or a getter
/// function. Traps and type mismatches read as absent.
fn exported_u32(store: &mut Store<()>, instance: &Instance, name: &str) -> Option<u32> {
    if let Some(global) = instance.get_global(&mut *store, name) {
        if let Val::I32(value) = global.get(&mut *store) {
            return Some(value as u32);
        }
    }
    if let Ok(getter) = instance.get_typed_func::<(), i32>(&mut *store, name) {
        if let Ok(value) = getter.call(&mut *store, ()) {
            return Some(value as u32);
        }
    }
    None
}

fn required_u32(store: &mut Store<()>, instance: &Instance, name: &str) -> Result<u32> {
    exported_u32(store, instance, name).ok_or_else(|| {
        Error::BadModule(format!("Wasm module must export {name} as global or function"))
    })
}

fn exported_memory(store: &mut Store<()>, instance: &Instance) -> Result<Memory> {
    instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| Error::BadModule("Wasm module must export memory".to_string()))
}

pub fn probe_scalar(store: &mut Store<()>, instance: &Instance) -> Result<ScalarAbi> {
    let memory = exported_memory(store, instance)?;

    let run = instance
        .get_typed_func::<i32, i32>(&mut *store, "run")
        .map_err(|_| {
            Error::BadModule(
                "Wasm module must export run with signature (i32) -> i32".to_string(),
            )
        })?;

    let input_ptr = required_u32(store, instance, "input_ptr")?;

    let (input_cap, input_encoding) =
        if let Some(cap) = exported_u32(store, instance, "input_utf8_cap") {
            (cap, DataEncoding::Utf8)
        } else if let Some(cap) = exported_u32(store, instance, "input_bytes_cap") {
            (cap, DataEncoding::Raw)
        } else {
            return Err(Error::BadModule(
                "Wasm module must export input_utf8_cap or input_bytes_cap as global or function"
                    .to_string(),
            ));
        };

    let output_ptr = required_u32(store, instance, "output_ptr")?;

    let (output_cap, output_encoding) =
        if let Some(cap) = exported_u32(store, instance, "output_utf8_cap") {
            (cap, DataEncoding::Utf8)
        } else if let Some(cap) = exported_u32(store, instance, "output_i32_cap") {
            (cap, DataEncoding::I32Array)
        } else if let Some(cap) = exported_u32(store, instance, "output_bytes_cap") {
            (cap, DataEncoding::Raw)
        } else {
            return Err(Error::BadModule(
                "Wasm module must export output_utf8_cap or output_i32_cap or output_bytes_cap"
                    .to_string(),
            ));
        };

    Ok(ScalarAbi {
        memory,
        run,
        input_ptr,
        input_cap,
        input_encoding,
        output_ptr,
        output_cap,
        output_encoding,
    })
}

pub fn probe_tile(store: &mut Store<()>, instance: &Instance) -> Result<TileAbi> {
    let memory = exported_memory(store, instance)?;

    let tile = instance
        .get_typed_func::<(f32, f32), ()>(&mut *store, "tile_rgba_f32_64x64")
        .map_err(|_| {
            Error::BadModule(
                "Wasm module must export tile_rgba_f32_64x64 with signature (f32, f32)"
                    .to_string(),
            )
        })?;

    let input_ptr = required_u32(store, instance, "input_ptr")?;
    let input_cap = required_u32(store, instance, "input_bytes_cap")?;

    let uniform = instance
        .get_typed_func::<(f32, f32), ()>(&mut *store, "uniform_set_width_and_height")
        .ok();
    let halo = instance
        .get_typed_func::<(), i32>(&mut *store, "calculate_halo_px")
        .ok();

    Ok(TileAbi {
        memory,
        tile,
        input_ptr,
        input_cap,
        uniform,
        halo,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::engine::new_engine;
    use wasmtime::{Engine, Module};

    fn instantiate(engine: &Engine, wat: &str) -> (Store<()>, Instance) {
        let wasm = wat::parse_str(wat).unwrap();
        let module = Module::new(engine, wasm).unwrap();
        let mut store = Store::new(engine, ());
        store.set_epoch_deadline(u64::MAX / 2);
        let instance = Instance::new(&mut store, &module, &[]).unwrap();
        (store, instance)
    }

    #[test]
    fn scalar_abi_from_globals() {
        let engine = new_engine().unwrap();
        let (mut store, instance) = instantiate(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 16))
                (global (export "input_utf8_cap") i32 (i32.const 1024))
                (global (export "output_ptr") i32 (i32.const 2048))
                (global (export "output_utf8_cap") i32 (i32.const 1024))
                (func (export "run") (param i32) (result i32) (local.get 0))
            )
            "#,
        );
        let abi = probe_scalar(&mut store, &instance).unwrap();
        assert_eq!(abi.input_ptr, 16);
        assert_eq!(abi.input_cap, 1024);
        assert_eq!(abi.input_encoding, DataEncoding::Utf8);
        assert_eq!(abi.output_ptr, 2048);
        assert_eq!(abi.output_encoding, DataEncoding::Utf8);
    }

    #[test]
    fn scalar_abi_from_getter_functions() {
        let engine = new_engine().unwrap();
        let (mut store, instance) = instantiate(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (func (export "input_ptr") (result i32) (i32.const 0))
                (func (export "input_bytes_cap") (result i32) (i32.const 256))
                (func (export "output_ptr") (result i32) (i32.const 512))
                (func (export "output_i32_cap") (result i32) (i32.const 64))
                (func (export "run") (param i32) (result i32) (i32.const 0))
            )
            "#,
        );
        let abi = probe_scalar(&mut store, &instance).unwrap();
        assert_eq!(abi.input_encoding, DataEncoding::Raw);
        assert_eq!(abi.output_encoding, DataEncoding::I32Array);
        assert_eq!(abi.output_cap, 64);
    }

    #[test]
    fn missing_run_is_bad_module() {
        let engine = new_engine().unwrap();
        let (mut store, instance) = instantiate(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_bytes_cap") i32 (i32.const 256))
                (global (export "output_ptr") i32 (i32.const 512))
                (global (export "output_bytes_cap") i32 (i32.const 256))
            )
            "#,
        );
        let err = probe_scalar(&mut store, &instance).unwrap_err();
        assert!(matches!(err, Error::BadModule(msg) if msg.contains("run")));
    }

    #[test]
    fn mistyped_run_is_bad_module() {
        let engine = new_engine().unwrap();
        let (mut store, instance) = instantiate(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_bytes_cap") i32 (i32.const 256))
                (global (export "output_ptr") i32 (i32.const 512))
                (global (export "output_bytes_cap") i32 (i32.const 256))
                (func (export "run") (param i64) (result i32) (i32.const 0))
            )
            "#,
        );
        let err = probe_scalar(&mut store, &instance).unwrap_err();
        assert!(matches!(err, Error::BadModule(_)));
    }

    #[test]
    fn missing_output_caps_is_bad_module() {
        let engine = new_engine().unwrap();
        let (mut store, instance) = instantiate(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_bytes_cap") i32 (i32.const 256))
                (global (export "output_ptr") i32 (i32.const 512))
                (func (export "run") (param i32) (result i32) (i32.const 0))
            )
            "#,
        );
        let err = probe_scalar(&mut store, &instance).unwrap_err();
        assert!(matches!(err, Error::BadModule(msg) if msg.contains("output_")));
    }

    #[test]
    fn tile_abi_with_optional_exports() {
        let engine = new_engine().unwrap();
        let (mut store, instance) = instantiate(
            &engine,
            r#"
            (module
                (memory (export "memory") 2)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_bytes_cap") i32 (i32.const 131072))
                (func (export "tile_rgba_f32_64x64") (param f32 f32))
                (func (export "uniform_set_width_and_height") (param f32 f32))
                (func (export "calculate_halo_px") (result i32) (i32.const 1))
            )
            "#,
        );
        let abi = probe_tile(&mut store, &instance).unwrap();
        assert!(abi.uniform.is_some());
        assert!(abi.halo.is_some());
        assert_eq!(abi.input_cap, 131072);
    }

    #[test]
    fn tile_without_input_cap_is_bad_module() {
        let engine = new_engine().unwrap();
        let (mut store, instance) = instantiate(
            &engine,
            r#"
            (module
                (memory (export "memory") 2)
                (global (export "input_ptr") i32 (i32.const 0))
                (func (export "tile_rgba_f32_64x64") (param f32 f32))
            )
            "#,
        );
        let err = probe_tile(&mut store, &instance).unwrap_err();
        assert!(matches!(err, Error::BadModule(msg) if msg.contains("input_bytes_cap")));
    }
}
