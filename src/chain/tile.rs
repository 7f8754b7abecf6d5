// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Tile stage execution.
//!
//! Tile stages transform an RGBA image 64x64 pixels at a time as
//! float32-per-channel data in module memory. Stages without a halo
//! pipeline each tile through the whole block before quantizing; any stage
//! with `halo_px > 0` forces the full-image path, where each stage runs
//! over the entire image between a ping-pong pair of float buffers so its
//! neighbours see unfiltered pixels from the previous stage. Halo samples
//! are clamp-to-edge.

use std::time::{Duration, Instant};

use image::RgbaImage;
use wasmtime::{Engine, Instance, Module, Store};

use crate::errors::{Error, Result};
use crate::wasm::engine::{map_wasm_error, ExecContext};
use crate::wasm::probe::{probe_tile, TileAbi};

pub const TILE_SIZE: usize = 64;

const INV_255: f32 = 1.0 / 255.0;

/// One instantiated tile stage, live for a single image sweep.
pub struct TileInstance {
    store: Store<()>,
    abi: TileAbi,
    halo_px: usize,
    span: usize,
}

impl TileInstance {
    /// Instantiate and probe; returns the instance with its instantiation
    /// time.
    pub fn new(engine: &Engine, module: &Module, ctx: &ExecContext) -> Result<(Self, Duration)> {
        let mut store = Store::new(engine, ());
        ctx.arm_store(&mut store);

        let inst_start = Instant::now();
        let instance = Instance::new(&mut store, module, &[]).map_err(|e| {
            map_wasm_error(e, |_| {
                Error::BadModule("Wasm module could not be instantiated".to_string())
            })
        })?;
        let instantiation = inst_start.elapsed();

        let abi = probe_tile(&mut store, &instance)?;
        Ok((
            Self {
                store,
                abi,
                halo_px: 0,
                span: TILE_SIZE,
            },
            instantiation,
        ))
    }

    /// Once-per-instance setup: pass image dimensions, read the halo size
    /// (negative values clamp to 0), and verify the tile span fits the
    /// declared input capacity.
    fn prepare(&mut self, width: usize, height: usize) -> Result<()> {
        if let Some(uniform) = &self.abi.uniform {
            uniform
                .call(&mut self.store, (width as f32, height as f32))
                .map_err(|e| {
                    map_wasm_error(e, |m| {
                        Error::ExecutionFailure(format!(
                            "Error running uniform_set_width_and_height: {m}"
                        ))
                    })
                })?;
        }

        let mut halo_px: i32 = 0;
        if let Some(halo) = &self.abi.halo {
            halo_px = halo.call(&mut self.store, ()).map_err(|e| {
                map_wasm_error(e, |m| {
                    Error::ExecutionFailure(format!("Error running calculate_halo_px: {m}"))
                })
            })?;
        }
        self.halo_px = halo_px.max(0) as usize;
        self.span = TILE_SIZE + 2 * self.halo_px;

        let needed = (self.span as u128) * (self.span as u128) * 16;
        if needed > u128::from(self.abi.input_cap) {
            return Err(Error::InputTooLarge {
                len: needed.try_into().unwrap_or(u64::MAX),
                cap: u64::from(self.abi.input_cap),
            });
        }
        Ok(())
    }

    /// Round-trip one tile through module memory: write the float buffer at
    /// `input_ptr`, call the stage with the tile origin, read the same
    /// range back in place.
    fn process_tile(&mut self, tile: &mut [f32], origin_x: i64, origin_y: i64) -> Result<()> {
        let ptr = self.abi.input_ptr as usize;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(tile);

        self.abi
            .memory
            .write(&mut self.store, ptr, bytes)
            .map_err(|_| Error::Memory("Could not write tile to wasm memory".to_string()))?;

        self.abi
            .tile
            .call(&mut self.store, (origin_x as f32, origin_y as f32))
            .map_err(|e| {
                map_wasm_error(e, |m| {
                    Error::ExecutionFailure(format!("Error running tile_rgba_f32_64x64: {m}"))
                })
            })?;

        self.abi
            .memory
            .read(&self.store, ptr, bytes)
            .map_err(|_| Error::Memory("Could not read tile from wasm memory".to_string()))
    }
}

fn quantize_channel(v: f32) -> u8 {
    if v <= 0.0 {
        0
    } else if v >= 1.0 {
        255
    } else {
        (v * 255.0 + 0.5) as u8
    }
}

/// Run a contiguous block of tile stages over `input`.
///
/// Returns the transformed image and per-stage durations. Stage errors
/// carry `stage_offset + index` as their chain position.
pub fn run_tile_stages(
    stages: &mut [TileInstance],
    input: &RgbaImage,
    stage_offset: usize,
) -> Result<(RgbaImage, Vec<Duration>)> {
    if stages.is_empty() {
        return Ok((input.clone(), Vec::new()));
    }

    let width = input.width() as usize;
    let height = input.height() as usize;

    for (i, stage) in stages.iter_mut().enumerate() {
        stage
            .prepare(width, height)
            .map_err(|e| e.at_stage(stage_offset + i))?;
    }

    let use_halo = stages.iter().any(|s| s.halo_px > 0);
    if use_halo {
        run_halo(stages, input, stage_offset, width, height)
    } else {
        run_no_halo(stages, input, stage_offset, width, height)
    }
}

/// Fast path: every stage sees the same 64x64 tile, so the whole block
/// pipelines through one in-module buffer per tile and only the final
/// values are quantized.
fn run_no_halo(
    stages: &mut [TileInstance],
    input: &RgbaImage,
    stage_offset: usize,
    width: usize,
    height: usize,
) -> Result<(RgbaImage, Vec<Duration>)> {
    let pix: &[u8] = input.as_raw();
    let mut output = RgbaImage::new(width as u32, height as u32);
    let mut durations = vec![Duration::ZERO; stages.len()];

    let mut tile = vec![0f32; TILE_SIZE * TILE_SIZE * 4];

    let mut y = 0;
    while y < height {
        let tile_h = TILE_SIZE.min(height - y);
        let mut x = 0;
        while x < width {
            let tile_w = TILE_SIZE.min(width - x);

            // Partial edge tiles zero the buffer so stages see a full
            // square.
            if tile_w != TILE_SIZE || tile_h != TILE_SIZE {
                tile.fill(0.0);
            }
            for row in 0..tile_h {
                let src = ((y + row) * width + x) * 4;
                let dst = row * TILE_SIZE * 4;
                for i in 0..tile_w * 4 {
                    tile[dst + i] = f32::from(pix[src + i]) * INV_255;
                }
            }

            for (i, stage) in stages.iter_mut().enumerate() {
                let started = Instant::now();
                stage
                    .process_tile(&mut tile, x as i64, y as i64)
                    .map_err(|e| e.at_stage(stage_offset + i))?;
                durations[i] += started.elapsed();
            }

            let out_pix: &mut [u8] = &mut output;
            for row in 0..tile_h {
                let src = row * TILE_SIZE * 4;
                let dst = ((y + row) * width + x) * 4;
                for i in 0..tile_w * 4 {
                    out_pix[dst + i] = quantize_channel(tile[src + i]);
                }
            }

            x += TILE_SIZE;
        }
        y += TILE_SIZE;
    }

    Ok((output, durations))
}

/// Halo path: per stage, every tile is composed from the previous stage's
/// full-image buffer with clamp-to-edge sampling, and only the inner
/// region is written back. All tiles of a stage complete before the next
/// stage starts (the src/dst swap requires it).
fn run_halo(
    stages: &mut [TileInstance],
    input: &RgbaImage,
    stage_offset: usize,
    width: usize,
    height: usize,
) -> Result<(RgbaImage, Vec<Duration>)> {
    let pix: &[u8] = input.as_raw();
    let mut src = vec![0f32; width * height * 4];
    let mut dst = vec![0f32; width * height * 4];
    for (s, d) in pix.iter().zip(src.iter_mut()) {
        *d = f32::from(*s) * INV_255;
    }

    let mut durations = vec![Duration::ZERO; stages.len()];

    for (stage_index, stage) in stages.iter_mut().enumerate() {
        let started = Instant::now();
        let halo = stage.halo_px;
        let span = stage.span;
        let mut tile = vec![0f32; span * span * 4];

        let mut y = 0;
        while y < height {
            let tile_h = TILE_SIZE.min(height - y);
            let mut x = 0;
            while x < width {
                let tile_w = TILE_SIZE.min(width - x);

                for row in 0..span {
                    let sy = (y as i64 + row as i64 - halo as i64)
                        .clamp(0, height as i64 - 1) as usize;
                    let src_row = sy * width * 4;
                    let dst_row = row * span * 4;
                    for col in 0..span {
                        let sx = (x as i64 + col as i64 - halo as i64)
                            .clamp(0, width as i64 - 1) as usize;
                        let s = src_row + sx * 4;
                        let d = dst_row + col * 4;
                        tile[d..d + 4].copy_from_slice(&src[s..s + 4]);
                    }
                }

                stage
                    .process_tile(&mut tile, x as i64 - halo as i64, y as i64 - halo as i64)
                    .map_err(|e| e.at_stage(stage_offset + stage_index))?;

                for row in 0..tile_h {
                    let s = ((halo + row) * span + halo) * 4;
                    let d = ((y + row) * width + x) * 4;
                    dst[d..d + tile_w * 4].copy_from_slice(&tile[s..s + tile_w * 4]);
                }

                x += TILE_SIZE;
            }
            y += TILE_SIZE;
        }

        std::mem::swap(&mut src, &mut dst);
        durations[stage_index] = started.elapsed();
    }

    let mut output = RgbaImage::new(width as u32, height as u32);
    let out_pix: &mut [u8] = &mut output;
    for (s, d) in src.iter().zip(out_pix.iter_mut()) {
        *d = quantize_channel(*s);
    }

    Ok((output, durations))
}
