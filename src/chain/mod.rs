// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Chain composition and execution.
//!
//! A chain is an ordered, non-empty list of compiled stages with the shape
//! `Scalar* Tile* Scalar*`: all tile stages must form one contiguous block,
//! checked at build time. Execution runs the leading scalar stages on raw
//! bytes, bridges into the tile block by decoding BMP, sweeps the tile
//! block, re-encodes BMP, and hands the bytes to the trailing scalar
//! stages. Modules are compiled once per chain; instances are created per
//! run.

pub mod content;
pub mod scalar;
pub mod tile;

pub use content::{format_output_bytes, Content, DataEncoding};

use std::ops::Range;
use std::time::{Duration, Instant};

use wasmtime::{Engine, Module};

use crate::errors::{Error, Result};
use crate::media::bmp::{decode_bmp, encode_bmp};
use crate::wasm::engine::{new_engine, ExecContext};
use crate::wasm::loader::{compile_module, compile_module_bytes, LoadedModule, StageKind};
use scalar::run_scalar_stage;
use tile::{run_tile_stages, TileInstance};

/// Deadline applied to one whole chain execution, in the CLI and per
/// request in the dev server. Chain build is not covered.
pub const CHAIN_DEADLINE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct ChainStage {
    pub module: Module,
    pub kind: StageKind,
    pub digest: [u8; 32],
    pub source: String,
}

/// Per-stage timings for one chain run. Instantiation and run time are
/// recorded independently.
#[derive(Debug, Clone, Default)]
pub struct ChainMetrics {
    pub stage_durations: Vec<Duration>,
    pub instantiation_durations: Vec<Duration>,
}

impl ChainMetrics {
    fn with_len(len: usize) -> Self {
        Self {
            stage_durations: vec![Duration::ZERO; len],
            instantiation_durations: vec![Duration::ZERO; len],
        }
    }

    pub fn instantiation_total(&self) -> Duration {
        self.instantiation_durations.iter().sum()
    }
}

pub struct Chain {
    engine: Engine,
    stages: Vec<ChainStage>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("stages", &self.stages)
            .finish()
    }
}

impl Chain {
    /// Compile `sources` (paths or URLs) into a chain.
    pub fn build(sources: &[String]) -> Result<Chain> {
        let engine = new_engine()?;
        let mut loaded = Vec::with_capacity(sources.len());
        for source in sources {
            let started = Instant::now();
            let module = compile_module(&engine, source)?;
            tracing::debug!(
                source = %source,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "compiled module"
            );
            loaded.push(module);
        }
        Self::from_modules(engine, loaded)
    }

    /// Compile in-memory module bodies into a chain (used by the recipe
    /// loader, which reads and digests the files itself).
    pub fn build_from_bytes(sources: &[(String, Vec<u8>)]) -> Result<Chain> {
        let engine = new_engine()?;
        let mut loaded = Vec::with_capacity(sources.len());
        for (source, body) in sources {
            loaded.push(compile_module_bytes(&engine, source, body)?);
        }
        Self::from_modules(engine, loaded)
    }

    fn from_modules(engine: Engine, loaded: Vec<LoadedModule>) -> Result<Chain> {
        let stages: Vec<ChainStage> = loaded
            .into_iter()
            .map(|m| ChainStage {
                module: m.module,
                kind: m.kind,
                digest: m.digest,
                source: m.source,
            })
            .collect();

        let mut seen_tile = false;
        let mut seen_scalar_after_tile = false;
        for (i, stage) in stages.iter().enumerate() {
            match stage.kind {
                StageKind::Tile => {
                    if seen_scalar_after_tile {
                        return Err(Error::ChainTopology(format!(
                            "Image stages must be contiguous to compose (module {i})"
                        )));
                    }
                    seen_tile = true;
                }
                StageKind::Scalar => {
                    if seen_tile {
                        seen_scalar_after_tile = true;
                    }
                }
            }
        }

        Ok(Chain { engine, stages })
    }

    pub fn stages(&self) -> &[ChainStage] {
        &self.stages
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Stage digests in chain order, for ETag derivation.
    pub fn digests(&self) -> Vec<[u8; 32]> {
        self.stages.iter().map(|s| s.digest).collect()
    }

    /// Execute the chain on `input` under `ctx`. Per-stage timings land in
    /// `metrics` even when a stage fails, so callers can still log them.
    pub fn run(
        &self,
        input: &[u8],
        ctx: &ExecContext,
        request_id: u64,
        metrics: &mut ChainMetrics,
    ) -> Result<Content> {
        *metrics = ChainMetrics::with_len(self.stages.len());
        if self.stages.is_empty() {
            return Ok(Content::raw(input.to_vec()));
        }

        let mut tile_range: Option<(usize, usize)> = None;
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.kind == StageKind::Tile {
                tile_range = Some(match tile_range {
                    None => (i, i),
                    Some((start, _)) => (start, i),
                });
            }
        }

        let Some((tile_start, tile_end)) = tile_range else {
            return self.run_scalar_span(
                0..self.stages.len(),
                Content::raw(input.to_vec()),
                ctx,
                request_id,
                metrics,
            );
        };

        let mut current = Content::raw(input.to_vec());
        if tile_start > 0 {
            current = self.run_scalar_span(0..tile_start, current, ctx, request_id, metrics)?;
            if current.encoding != DataEncoding::Raw {
                return Err(Error::ChainTopology(
                    "Image stage requires raw BMP bytes as input".to_string(),
                ));
            }
        }

        let input_rgba = decode_bmp(&current.bytes)?;

        let mut instances = Vec::with_capacity(tile_end - tile_start + 1);
        for i in tile_start..=tile_end {
            let (instance, instantiation) =
                TileInstance::new(&self.engine, &self.stages[i].module, ctx)
                    .map_err(|e| e.at_stage(i))?;
            metrics.instantiation_durations[i] = instantiation;
            instances.push(instance);
        }

        let (output_rgba, stage_durations) =
            run_tile_stages(&mut instances, &input_rgba, tile_start)?;
        for (i, duration) in stage_durations.into_iter().enumerate() {
            metrics.stage_durations[tile_start + i] = duration;
        }

        current = Content::raw(encode_bmp(&output_rgba)?);

        if tile_end + 1 < self.stages.len() {
            current = self.run_scalar_span(
                tile_end + 1..self.stages.len(),
                current,
                ctx,
                request_id,
                metrics,
            )?;
        }

        Ok(current)
    }

    fn run_scalar_span(
        &self,
        range: Range<usize>,
        mut current: Content,
        ctx: &ExecContext,
        request_id: u64,
        metrics: &mut ChainMetrics,
    ) -> Result<Content> {
        for i in range {
            let label = format!("req-{request_id}-{i}");
            let started = Instant::now();
            let outcome =
                run_scalar_stage(&self.engine, &self.stages[i].module, &current.bytes, ctx, &label)
                    .map_err(|e| e.at_stage(i))?;
            metrics.stage_durations[i] = started.elapsed();
            metrics.instantiation_durations[i] = outcome.instantiation;
            current = outcome.output;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::sniff::is_bmp_bytes;
    use image::RgbaImage;

    const GENEROUS: Duration = Duration::from_secs(10);

    const ECHO_BYTES: &str = r#"
        (module
            (memory (export "memory") 4)
            (global (export "input_ptr") i32 (i32.const 0))
            (global (export "input_bytes_cap") i32 (i32.const 65536))
            (global (export "output_ptr") i32 (i32.const 65536))
            (global (export "output_bytes_cap") i32 (i32.const 65536))
            (func (export "run") (param $len i32) (result i32)
                (memory.copy (i32.const 65536) (i32.const 0) (local.get $len))
                (local.get $len)
            )
        )
    "#;

    const ECHO_UTF8: &str = r#"
        (module
            (memory (export "memory") 1)
            (global (export "input_ptr") i32 (i32.const 0))
            (global (export "input_utf8_cap") i32 (i32.const 16384))
            (global (export "output_ptr") i32 (i32.const 16384))
            (global (export "output_utf8_cap") i32 (i32.const 16384))
            (func (export "run") (param $len i32) (result i32)
                (memory.copy (i32.const 16384) (i32.const 0) (local.get $len))
                (local.get $len)
            )
        )
    "#;

    const TILE_IDENTITY: &str = r#"
        (module
            (memory (export "memory") 2)
            (global (export "input_ptr") i32 (i32.const 0))
            (global (export "input_bytes_cap") i32 (i32.const 131072))
            (func (export "tile_rgba_f32_64x64") (param f32 f32))
        )
    "#;

    fn build_chain(wats: &[&str]) -> Result<Chain> {
        let sources: Vec<(String, Vec<u8>)> = wats
            .iter()
            .enumerate()
            .map(|(i, wat)| (format!("stage-{i}.wasm"), wat::parse_str(wat).unwrap()))
            .collect();
        Chain::build_from_bytes(&sources)
    }

    fn run_chain(chain: &Chain, input: &[u8]) -> Result<Content> {
        let ctx = ExecContext::with_timeout(GENEROUS);
        let mut metrics = ChainMetrics::default();
        chain.run(input, &ctx, 0, &mut metrics)
    }

    fn tiny_bmp() -> Vec<u8> {
        let mut img = RgbaImage::new(1, 1);
        img.put_pixel(0, 0, image::Rgba([1, 2, 3, 255]));
        encode_bmp(&img).unwrap()
    }

    #[test]
    fn scalar_tile_scalar_shape_composes() {
        let chain = build_chain(&[ECHO_BYTES, TILE_IDENTITY, ECHO_BYTES]).unwrap();
        assert_eq!(chain.stages().len(), 3);
    }

    #[test]
    fn scalar_between_tiles_is_rejected_at_build() {
        let err = build_chain(&[TILE_IDENTITY, ECHO_BYTES, TILE_IDENTITY]).unwrap_err();
        assert!(matches!(err, Error::ChainTopology(msg) if msg.contains("module 2")));
    }

    #[test]
    fn scalar_chain_pipelines_bytes() {
        let chain = build_chain(&[ECHO_UTF8, ECHO_UTF8]).unwrap();
        let output = run_chain(&chain, b"hello").unwrap();
        assert_eq!(output.bytes, b"hello");
        assert_eq!(output.encoding, DataEncoding::Utf8);
    }

    #[test]
    fn tile_block_round_trips_bmp_pixels() {
        let chain = build_chain(&[TILE_IDENTITY]).unwrap();
        let output = run_chain(&chain, &tiny_bmp()).unwrap();
        assert_eq!(output.encoding, DataEncoding::Raw);
        assert!(is_bmp_bytes(&output.bytes));

        let decoded = decode_bmp(&output.bytes).unwrap();
        assert_eq!(*decoded.get_pixel(0, 0), image::Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn scalar_bridge_into_tile_block() {
        let chain = build_chain(&[ECHO_BYTES, TILE_IDENTITY, ECHO_BYTES]).unwrap();
        let output = run_chain(&chain, &tiny_bmp()).unwrap();
        assert!(is_bmp_bytes(&output.bytes));
        let decoded = decode_bmp(&output.bytes).unwrap();
        assert_eq!(*decoded.get_pixel(0, 0), image::Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn utf8_output_cannot_cross_into_tile_block() {
        let chain = build_chain(&[ECHO_UTF8, TILE_IDENTITY]).unwrap();
        let err = run_chain(&chain, b"plain text").unwrap_err();
        assert!(matches!(err, Error::ChainTopology(msg) if msg.contains("raw BMP")));
    }

    #[test]
    fn non_bmp_input_to_tile_block_fails() {
        let chain = build_chain(&[TILE_IDENTITY]).unwrap();
        let err = run_chain(&chain, b"definitely not a bitmap").unwrap_err();
        assert!(matches!(err, Error::ChainTopology(_)));
    }

    #[test]
    fn stage_errors_carry_chain_position() {
        let trap = r#"
            (module
                (memory (export "memory") 1)
                (global (export "input_ptr") i32 (i32.const 0))
                (global (export "input_bytes_cap") i32 (i32.const 65536))
                (global (export "output_ptr") i32 (i32.const 0))
                (global (export "output_bytes_cap") i32 (i32.const 65536))
                (func (export "run") (param i32) (result i32) unreachable)
            )
        "#;
        let chain = build_chain(&[ECHO_BYTES, trap]).unwrap();
        let err = run_chain(&chain, b"x").unwrap_err();
        assert!(matches!(err, Error::Stage { index: 1, .. }));
    }

    #[test]
    fn metrics_cover_every_stage() {
        let chain = build_chain(&[ECHO_BYTES, TILE_IDENTITY, ECHO_BYTES]).unwrap();
        let ctx = ExecContext::with_timeout(GENEROUS);
        let mut metrics = ChainMetrics::default();
        chain.run(&tiny_bmp(), &ctx, 7, &mut metrics).unwrap();
        assert_eq!(metrics.stage_durations.len(), 3);
        assert_eq!(metrics.instantiation_durations.len(), 3);
    }
}
