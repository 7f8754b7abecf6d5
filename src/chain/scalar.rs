// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Scalar stage execution.
//!
//! One instance per invocation: write the whole input at `input_ptr`, call
//! `run(len)`, read the reported output window at `output_ptr`, and copy it
//! out before the instance is dropped. Capacity checks are hard
//! preconditions on both sides, and the output-capacity check is in bytes
//! (the reported length times the encoding's item factor).

use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use wasmtime::{Engine, Instance, Module, Store};

use crate::chain::content::{Content, DataEncoding};
use crate::errors::{Error, Result};
use crate::wasm::engine::{map_wasm_error, ExecContext};
use crate::wasm::probe::probe_scalar;

#[derive(Debug)]
pub struct ScalarOutcome {
    pub output: Content,
    pub instantiation: Duration,
    pub run: Duration,
}

pub fn run_scalar_stage(
    engine: &Engine,
    module: &Module,
    input: &[u8],
    ctx: &ExecContext,
    label: &str,
) -> Result<ScalarOutcome> {
    let mut store = Store::new(engine, ());
    ctx.arm_store(&mut store);

    let inst_start = Instant::now();
    let instance = Instance::new(&mut store, module, &[]).map_err(|e| {
        map_wasm_error(e, |_| {
            Error::BadModule("Wasm module could not be instantiated".to_string())
        })
    })?;
    let instantiation = inst_start.elapsed();

    let abi = probe_scalar(&mut store, &instance)?;

    if input.len() as u64 > u64::from(abi.input_cap) {
        return Err(Error::InputTooLarge {
            len: input.len() as u64,
            cap: u64::from(abi.input_cap),
        });
    }

    abi.memory
        .write(&mut store, abi.input_ptr as usize, input)
        .map_err(|_| Error::Memory("Could not write input".to_string()))?;

    let run_start = Instant::now();
    let reported = abi
        .run
        .call(&mut store, input.len() as i32)
        .map_err(|e| map_wasm_error(e, Error::ExecutionFailure))?;
    let run = run_start.elapsed();

    // A negative report reads as a huge unsigned length and fails the
    // capacity check below.
    let count = reported as u32;
    let bytes_out = u64::from(count) * u64::from(abi.output_encoding.item_factor());
    if bytes_out > u64::from(abi.output_cap) {
        return Err(Error::CapacityExceeded {
            len: bytes_out,
            cap: u64::from(abi.output_cap),
        });
    }

    let mut bytes = vec![0u8; bytes_out as usize];
    abi.memory
        .read(&store, abi.output_ptr as usize, &mut bytes)
        .map_err(|_| Error::Memory("Could not read output".to_string()))?;

    if abi.output_encoding == DataEncoding::Utf8 {
        std::str::from_utf8(&bytes)?;
    }

    if !bytes.is_empty() {
        tracing::debug!(
            module = label,
            sha256 = %hex::encode(Sha256::digest(&bytes)),
            len = bytes.len(),
            "stage output"
        );
    }

    Ok(ScalarOutcome {
        output: Content {
            bytes,
            encoding: abi.output_encoding,
        },
        instantiation,
        run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::engine::new_engine;
    use crate::wasm::loader::compile_module_bytes;

    const GENEROUS: Duration = Duration::from_secs(5);

    /// Copies the input window to the output window and reports the input
    /// length back.
    const ECHO_UTF8: &str = r#"
        (module
            (memory (export "memory") 1)
            (global (export "input_ptr") i32 (i32.const 1024))
            (global (export "input_utf8_cap") i32 (i32.const 4096))
            (global (export "output_ptr") i32 (i32.const 8192))
            (global (export "output_utf8_cap") i32 (i32.const 4096))
            (func (export "run") (param $len i32) (result i32)
                (memory.copy (i32.const 8192) (i32.const 1024) (local.get $len))
                (local.get $len)
            )
        )
    "#;

    fn stage(engine: &Engine, wat: &str) -> Module {
        let wasm = wat::parse_str(wat).unwrap();
        compile_module_bytes(engine, "test.wasm", &wasm).unwrap().module
    }

    #[test]
    fn echoes_utf8_input() {
        let engine = new_engine().unwrap();
        let module = stage(&engine, ECHO_UTF8);
        let ctx = ExecContext::with_timeout(GENEROUS);

        let outcome = run_scalar_stage(&engine, &module, b"hi", &ctx, "echo").unwrap();
        assert_eq!(outcome.output.bytes, b"hi");
        assert_eq!(outcome.output.encoding, DataEncoding::Utf8);
    }

    #[test]
    fn oversized_input_fails_before_running() {
        let engine = new_engine().unwrap();
        let module = stage(&engine, ECHO_UTF8);
        let ctx = ExecContext::with_timeout(GENEROUS);

        let input = vec![b'x'; 4097];
        let err = run_scalar_stage(&engine, &module, &input, &ctx, "echo").unwrap_err();
        assert!(matches!(err, Error::InputTooLarge { len: 4097, cap: 4096 }));
    }

    #[test]
    fn i32_output_length_is_counted_in_elements() {
        let engine = new_engine().unwrap();
        // Reports two elements; stores 0x2A and 0x01 at the output window.
        let module = stage(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_bytes_cap") i32 (i32.const 256))
                (global (export "output_ptr") i32 (i32.const 512))
                (global (export "output_i32_cap") i32 (i32.const 16))
                (func (export "run") (param i32) (result i32)
                    (i32.store (i32.const 512) (i32.const 42))
                    (i32.store (i32.const 516) (i32.const 1))
                    (i32.const 2)
                )
            )
            "#,
        );
        let ctx = ExecContext::with_timeout(GENEROUS);

        let outcome = run_scalar_stage(&engine, &module, b"", &ctx, "i32").unwrap();
        assert_eq!(outcome.output.encoding, DataEncoding::I32Array);
        assert_eq!(outcome.output.bytes, vec![42, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn overreported_output_is_capacity_exceeded() {
        let engine = new_engine().unwrap();
        let module = stage(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_bytes_cap") i32 (i32.const 256))
                (global (export "output_ptr") i32 (i32.const 512))
                (global (export "output_bytes_cap") i32 (i32.const 8))
                (func (export "run") (param i32) (result i32) (i32.const 9))
            )
            "#,
        );
        let ctx = ExecContext::with_timeout(GENEROUS);

        let err = run_scalar_stage(&engine, &module, b"", &ctx, "over").unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { len: 9, cap: 8 }));
    }

    #[test]
    fn negative_report_is_capacity_exceeded() {
        let engine = new_engine().unwrap();
        let module = stage(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_bytes_cap") i32 (i32.const 256))
                (global (export "output_ptr") i32 (i32.const 512))
                (global (export "output_bytes_cap") i32 (i32.const 256))
                (func (export "run") (param i32) (result i32) (i32.const -1))
            )
            "#,
        );
        let ctx = ExecContext::with_timeout(GENEROUS);

        let err = run_scalar_stage(&engine, &module, b"", &ctx, "neg").unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
    }

    #[test]
    fn invalid_utf8_output_is_rejected() {
        let engine = new_engine().unwrap();
        let module = stage(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_utf8_cap") i32 (i32.const 256))
                (global (export "output_ptr") i32 (i32.const 512))
                (global (export "output_utf8_cap") i32 (i32.const 256))
                (func (export "run") (param i32) (result i32)
                    (i32.store8 (i32.const 512) (i32.const 0xFF))
                    (i32.const 1)
                )
            )
            "#,
        );
        let ctx = ExecContext::with_timeout(GENEROUS);

        let err = run_scalar_stage(&engine, &module, b"", &ctx, "bad-utf8").unwrap_err();
        assert!(matches!(err, Error::InvalidEncoding(_)));
    }

    #[test]
    fn trapping_run_is_execution_failure() {
        let engine = new_engine().unwrap();
        let module = stage(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_bytes_cap") i32 (i32.const 256))
                (global (export "output_ptr") i32 (i32.const 512))
                (global (export "output_bytes_cap") i32 (i32.const 256))
                (func (export "run") (param i32) (result i32) unreachable)
            )
            "#,
        );
        let ctx = ExecContext::with_timeout(GENEROUS);

        let err = run_scalar_stage(&engine, &module, b"", &ctx, "trap").unwrap_err();
        assert!(matches!(err, Error::ExecutionFailure(_)));
    }

    #[test]
    fn looping_run_times_out_with_deadline_in_message() {
        let engine = new_engine().unwrap();
        let module = stage(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_bytes_cap") i32 (i32.const 256))
                (global (export "output_ptr") i32 (i32.const 512))
                (global (export "output_bytes_cap") i32 (i32.const 256))
                (func (export "run") (param i32) (result i32)
                    (loop br 0)
                    (i32.const 0)
                )
            )
            "#,
        );
        let ctx = ExecContext::with_timeout(Duration::from_millis(100));

        let err = run_scalar_stage(&engine, &module, b"", &ctx, "loop").unwrap_err();
        assert!(matches!(err, Error::ExecutionTimeout(d) if d == Duration::from_millis(100)));
        assert!(err.to_string().contains("100ms"));
    }
}
