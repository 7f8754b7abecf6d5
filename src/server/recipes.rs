// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Recipe chain loading.
//!
//! Recipes live at `<type>/<subtype>/NN-name.wasm` under the recipes root;
//! the two-digit prefix orders the chain for that MIME type and a leading
//! `-` disables a file (which must still be well-formed). Orders must be
//! unique per MIME type. Each file's SHA-256 is retained so responses can
//! derive ETags from the source and recipe digests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::chain::Chain;
use crate::errors::{Error, Result};

struct RecipeCandidate {
    path: String,
    filename: String,
    order: u8,
    digest: [u8; 32],
    body: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct RecipeSet {
    chains: HashMap<String, Arc<Chain>>,
    digests: HashMap<String, Vec<[u8; 32]>>,
}

impl RecipeSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(recipes_root: &Path) -> Result<RecipeSet> {
        let mut by_mime: HashMap<String, Vec<RecipeCandidate>> = HashMap::new();

        for entry in WalkDir::new(recipes_root) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            if !entry.file_type().is_file() {
                return Err(Error::RecipeIndex(format!(
                    "recipe entry {:?} must be a regular file",
                    entry.path()
                )));
            }

            let rel = entry
                .path()
                .strip_prefix(recipes_root)
                .map_err(|e| Error::RecipeIndex(e.to_string()))?;
            let parts: Vec<&str> = rel
                .iter()
                .map(|part| {
                    part.to_str().ok_or_else(|| {
                        Error::RecipeIndex(format!("recipe path {rel:?} must be valid UTF-8"))
                    })
                })
                .collect::<Result<_>>()?;

            let filename = parts.last().copied().unwrap_or_default();
            if !filename.ends_with(".wasm") {
                continue;
            }
            if parts.len() != 3 {
                return Err(Error::RecipeIndex(format!(
                    "recipe path {:?} must match <type>/<subtype>/<file>",
                    parts.join("/")
                )));
            }
            let mime_type = format!("{}/{}", parts[0], parts[1]);

            let (order, disabled) = parse_recipe_filename(filename).map_err(|e| {
                Error::RecipeIndex(format!("invalid recipe filename {:?}: {e}", parts.join("/")))
            })?;
            if disabled {
                continue;
            }

            let body = std::fs::read(entry.path())?;
            let digest: [u8; 32] = Sha256::digest(&body).into();
            by_mime.entry(mime_type).or_default().push(RecipeCandidate {
                path: entry.path().display().to_string(),
                filename: filename.to_string(),
                order,
                digest,
                body,
            });
        }

        let mut mime_types: Vec<String> = by_mime.keys().cloned().collect();
        mime_types.sort();

        let mut set = RecipeSet::default();
        for mime_type in mime_types {
            let mut candidates = by_mime.remove(&mime_type).unwrap_or_default();
            candidates.sort_by(|a, b| {
                a.order.cmp(&b.order).then_with(|| a.filename.cmp(&b.filename))
            });

            let mut seen_order: HashMap<u8, &str> = HashMap::with_capacity(candidates.len());
            for candidate in &candidates {
                if let Some(prev) = seen_order.get(&candidate.order) {
                    return Err(Error::RecipeIndex(format!(
                        "duplicate recipe prefix for {}: {:02} in {:?} and {:?}",
                        mime_type, candidate.order, prev, candidate.path
                    )));
                }
                seen_order.insert(candidate.order, &candidate.path);
            }

            let sources: Vec<(String, Vec<u8>)> = candidates
                .iter()
                .map(|c| (c.path.clone(), c.body.clone()))
                .collect();
            let chain = Chain::build_from_bytes(&sources)?;

            set.digests
                .insert(mime_type.clone(), candidates.iter().map(|c| c.digest).collect());
            set.chains.insert(mime_type, Arc::new(chain));
        }

        Ok(set)
    }

    pub fn chain_for(&self, mime_type: &str) -> Option<&Arc<Chain>> {
        self.chains.get(mime_type)
    }

    pub fn digests_for(&self, mime_type: &str) -> &[[u8; 32]] {
        self.digests.get(mime_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// Parse `NN-name.wasm` with an optional leading `-` disable marker.
pub fn parse_recipe_filename(filename: &str) -> Result<(u8, bool)> {
    if !filename.is_ascii() {
        return Err(Error::RecipeIndex("filename must be ASCII".to_string()));
    }
    if !filename.ends_with(".wasm") {
        return Err(Error::RecipeIndex("filename must end with .wasm".to_string()));
    }

    let (trimmed, disabled) = match filename.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (filename, false),
    };

    let bytes = trimmed.as_bytes();
    if trimmed.len() < "00-a.wasm".len() {
        return Err(Error::RecipeIndex(
            "filename must match NN-name.wasm".to_string(),
        ));
    }
    if !bytes[0].is_ascii_digit() || !bytes[1].is_ascii_digit() {
        return Err(Error::RecipeIndex(
            "filename prefix must be two digits".to_string(),
        ));
    }
    if bytes[2] != b'-' {
        return Err(Error::RecipeIndex(
            "filename must match NN-name.wasm".to_string(),
        ));
    }
    let name_part = &trimmed[3..trimmed.len() - ".wasm".len()];
    if name_part.is_empty() {
        return Err(Error::RecipeIndex("recipe name must not be empty".to_string()));
    }

    let order = (bytes[0] - b'0') * 10 + (bytes[1] - b'0');
    Ok((order, disabled))
}

/// ETag seed: the quoted hex of the source digest alone, or of
/// `SHA-256(source_digest || recipe_digest_0 || ...)` when recipes exist.
pub fn build_etag(source_digest: &[u8; 32], recipe_digests: &[[u8; 32]]) -> String {
    if recipe_digests.is_empty() {
        return format!("\"{}\"", hex::encode(source_digest));
    }
    let mut hasher = Sha256::new();
    hasher.update(source_digest);
    for digest in recipe_digests {
        hasher.update(digest);
    }
    format!("\"{}\"", hex::encode(hasher.finalize()))
}
