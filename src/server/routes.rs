// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Content routing index.
//!
//! Walks the content directory once at startup and maps request paths to
//! source files. html/markdown files get an extensionless alias, and
//! `index.{html,md,markdown}` files alias their directory with and without
//! a trailing slash. Aliases must be unambiguous; a collision between two
//! files aborts the build.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::{Error, Result};

#[derive(Debug, Clone)]
pub struct Route {
    pub file_path: PathBuf,
    pub source_mime: String,
}

#[derive(Debug)]
pub struct RouteIndex {
    routes: HashMap<String, Route>,
}

impl RouteIndex {
    pub fn build(content_root: &Path) -> Result<RouteIndex> {
        let mut files: Vec<(String, PathBuf)> = Vec::new();

        for entry in WalkDir::new(content_root) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            if !entry.file_type().is_file() {
                return Err(Error::RouteIndex(format!(
                    "content entry {:?} must be a regular file",
                    entry.path()
                )));
            }

            let rel = entry
                .path()
                .strip_prefix(content_root)
                .map_err(|e| Error::RouteIndex(e.to_string()))?;
            let rel = canonical_rel_path(rel)?;
            files.push((rel, entry.path().to_path_buf()));
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut routes: HashMap<String, Route> = HashMap::with_capacity(files.len());
        for (rel, full_path) in files {
            let route = Route {
                file_path: full_path,
                source_mime: detect_source_mime(&rel).to_string(),
            };
            for request_path in request_paths(&rel) {
                if let Some(prev) = routes.get(&request_path) {
                    if prev.file_path != route.file_path {
                        return Err(Error::RouteIndex(format!(
                            "duplicate route path {:?} for {:?} and {:?}",
                            request_path, prev.file_path, route.file_path
                        )));
                    }
                }
                routes.insert(request_path, route.clone());
            }
        }

        Ok(RouteIndex { routes })
    }

    /// Try the path as requested, then its cleaned form, then with the
    /// trailing slash toggled. First hit wins.
    pub fn resolve(&self, request_path: &str) -> Option<&Route> {
        let mut requested = request_path.to_string();
        if requested.is_empty() {
            requested = "/".to_string();
        }
        if !requested.starts_with('/') {
            requested.insert(0, '/');
        }

        let mut candidates = vec![requested.clone()];
        let cleaned = clean_request_path(&requested);
        if cleaned != requested {
            candidates.push(cleaned);
        }
        if requested != "/" {
            if let Some(stripped) = requested.strip_suffix('/') {
                candidates.push(stripped.to_string());
            } else {
                candidates.push(format!("{requested}/"));
            }
        }

        candidates
            .iter()
            .find_map(|candidate| self.routes.get(candidate))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Validate a walked path and render it with forward slashes.
fn canonical_rel_path(rel: &Path) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    Error::RouteIndex(format!("content path {rel:?} must be valid UTF-8"))
                })?;
                if part.contains('\\') {
                    return Err(Error::RouteIndex(format!(
                        "content path {rel:?} must not contain backslash"
                    )));
                }
                parts.push(part);
            }
            _ => {
                return Err(Error::RouteIndex(format!(
                    "content path {rel:?} is not canonical"
                )));
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::RouteIndex(format!(
            "content path {rel:?} is not canonical"
        )));
    }
    Ok(parts.join("/"))
}

/// Lexical cleanup of an absolute request path: drops empty, `.`, and
/// resolved `..` segments.
fn clean_request_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// All request paths serving the file at `rel`.
pub fn request_paths(rel: &str) -> Vec<String> {
    fn push_unique(out: &mut Vec<String>, value: String) {
        if !out.contains(&value) {
            out.push(value);
        }
    }

    let mut out: Vec<String> = Vec::with_capacity(4);
    push_unique(&mut out, format!("/{rel}"));

    let base = rel.rsplit('/').next().unwrap_or(rel);
    let Some((stem, ext)) = split_extension(base) else {
        return out;
    };
    let lower_ext = ext.to_ascii_lowercase();
    if lower_ext == "html" || lower_ext == "md" || lower_ext == "markdown" {
        if stem.eq_ignore_ascii_case("index") {
            match rel.rsplit_once('/') {
                None => push_unique(&mut out, "/".to_string()),
                Some((dir, _)) => {
                    push_unique(&mut out, format!("/{dir}"));
                    push_unique(&mut out, format!("/{dir}/"));
                }
            }
        } else {
            let trimmed = &rel[..rel.len() - ext.len() - 1];
            push_unique(&mut out, format!("/{trimmed}"));
        }
    }
    out
}

/// `name.ext` split on the final dot; no-extension and dotfile names
/// return `None`.
fn split_extension(base: &str) -> Option<(&str, &str)> {
    let dot = base.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some((&base[..dot], &base[dot + 1..]))
}

/// Source MIME by extension; markdown is special-cased and everything
/// unknown falls back to `application/octet-stream`.
pub fn detect_source_mime(rel: &str) -> &'static str {
    let base = rel.rsplit('/').next().unwrap_or(rel);
    let ext = split_extension(base)
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "xml" => "text/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "bmp" => "image/bmp",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}
