// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Module source acquisition and compilation.
//!
//! Sources are local paths or `https://` URLs. Compilation classifies each
//! module as a scalar or tile stage by export name; the SHA-256 of the raw
//! bytes is retained for ETag derivation.

use sha2::{Digest, Sha256};
use wasmtime::{Engine, Module};

use crate::errors::{Error, Result};

/// Stage classification, fixed at compile time.
///
/// A module is a tile stage iff it exports `tile_rgba_f32_64x64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Scalar,
    Tile,
}

#[derive(Debug)]
pub struct LoadedModule {
    pub module: Module,
    pub kind: StageKind,
    pub digest: [u8; 32],
    pub source: String,
}

/// Read module bytes from a local path or an `https://` URL.
pub fn read_module_source(source: &str) -> Result<Vec<u8>> {
    let body = if source.starts_with("https://") {
        let response = reqwest::blocking::get(source)
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        response
            .bytes()
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            .to_vec()
    } else {
        std::fs::read(source)?
    };

    tracing::debug!(
        source,
        sha256 = %hex::encode(Sha256::digest(&body)),
        len = body.len(),
        "read module source"
    );

    Ok(body)
}

pub fn compile_module(engine: &Engine, source: &str) -> Result<LoadedModule> {
    let body = read_module_source(source)?;
    compile_module_bytes(engine, source, &body)
}

pub fn compile_module_bytes(engine: &Engine, source: &str, body: &[u8]) -> Result<LoadedModule> {
    let digest: [u8; 32] = Sha256::digest(body).into();
    let module = Module::new(engine, body)
        .map_err(|_| Error::BadModule("Wasm module could not be compiled".to_string()))?;

    let kind = if module.get_export("tile_rgba_f32_64x64").is_some() {
        StageKind::Tile
    } else {
        StageKind::Scalar
    };

    Ok(LoadedModule {
        module,
        kind,
        digest,
        source: source.to_string(),
    })
}
