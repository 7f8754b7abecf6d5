// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Per-request pipeline for the dev server.
//!
//! Each request resolves a route, reads the source file, runs the recipe
//! chain for the source MIME type (if any) on the blocking pool under a
//! fixed deadline, and negotiates the response content type. ETags derive
//! from the source and recipe digests; `If-None-Match` short-circuits to
//! 304 after the chain runs. Every request logs exactly one line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use sha2::{Digest, Sha256};

use crate::chain::{format_output_bytes, ChainMetrics, Content, DataEncoding, CHAIN_DEADLINE};
use crate::errors::Error;
use crate::media::{is_bmp_bytes, is_ico_bytes};
use crate::server::recipes::{build_etag, RecipeSet};
use crate::server::routes::RouteIndex;
use crate::wasm::ExecContext;

pub struct DevState {
    pub routes: RouteIndex,
    pub recipes: RecipeSet,
    pub request_counter: AtomicU64,
    pub chain_deadline: Duration,
}

impl DevState {
    pub fn new(routes: RouteIndex, recipes: RecipeSet) -> Self {
        Self {
            routes,
            recipes,
            request_counter: AtomicU64::new(0),
            chain_deadline: CHAIN_DEADLINE,
        }
    }
}

pub fn router(state: Arc<DevState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<Arc<DevState>>, req: Request) -> Response {
    let started = Instant::now();
    let request_id = state.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let if_none_match = req
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let empty = ChainMetrics::default();

    if method != Method::GET && method != Method::HEAD {
        log_request(&method, &path, "status=405", started.elapsed(), &empty);
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let Some(route) = state.routes.resolve(&path) else {
        log_request(&method, &path, "status=404", started.elapsed(), &empty);
        return status_response(StatusCode::NOT_FOUND);
    };
    let route = route.clone();

    let input = match tokio::fs::read(&route.file_path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            log_request(
                &method,
                &path,
                &format!("error={err}"),
                started.elapsed(),
                &empty,
            );
            return error_response(&err.to_string());
        }
    };
    let source_digest: [u8; 32] = Sha256::digest(&input).into();

    let chain = state.recipes.chain_for(&route.source_mime).cloned();
    let has_recipes = chain.is_some();

    let (result, metrics) = match chain {
        Some(chain) => {
            let deadline = state.chain_deadline;
            let task = tokio::task::spawn_blocking(move || {
                let ctx = ExecContext::with_timeout(deadline);
                let mut metrics = ChainMetrics::default();
                let result = chain.run(&input, &ctx, request_id, &mut metrics);
                (result, metrics)
            });
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => (
                    Err(Error::ExecutionFailure(err.to_string())),
                    ChainMetrics::default(),
                ),
            }
        }
        None => (Ok(Content::raw(input)), ChainMetrics::default()),
    };

    let output = match result {
        Ok(output) => output,
        Err(err) => {
            log_request(
                &method,
                &path,
                &format!("error={err}"),
                started.elapsed(),
                &metrics,
            );
            return error_response(&err.to_string());
        }
    };
    let body = format_output_bytes(&output);

    let etag = build_etag(&source_digest, state.recipes.digests_for(&route.source_mime));
    if if_none_match.as_deref() == Some(etag.as_str()) {
        log_request(&method, &path, "status=304", started.elapsed(), &metrics);
        let mut response = status_response(StatusCode::NOT_MODIFIED);
        set_header(&mut response, header::ETAG, &etag);
        return response;
    }

    let content_type = response_content_type(&route.source_mime, has_recipes, &output, &body);

    log_request(&method, &path, "status=200", started.elapsed(), &metrics);

    let payload = if method == Method::HEAD { Vec::new() } else { body };
    let mut response = Response::new(Body::from(payload));
    set_header(&mut response, header::ETAG, &etag);
    set_header(&mut response, header::CONTENT_TYPE, &content_type);
    response
}

fn status_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn set_header(response: &mut Response, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

/// Minimal HTML error page with a timestamp and the escaped message.
fn error_response(message: &str) -> Response {
    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let body = format!(
        "<!doctype html><meta charset=\"utf-8\"><title>quern dev error</title><pre>{timestamp}\n{}</pre>",
        escape_html(message)
    );
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    set_header(&mut response, header::CONTENT_TYPE, "text/html; charset=utf-8");
    response
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Content-type negotiation for the response body.
fn response_content_type(
    source_mime: &str,
    recipes_applied: bool,
    output: &Content,
    body: &[u8],
) -> String {
    if recipes_applied && source_mime == "text/markdown" {
        return "text/html; charset=utf-8".to_string();
    }
    if output.encoding == DataEncoding::Raw {
        if is_ico_bytes(body) {
            return "image/x-icon".to_string();
        }
        if is_bmp_bytes(body) {
            return "image/bmp".to_string();
        }
    }
    if source_mime.is_empty() {
        return "application/octet-stream".to_string();
    }
    if source_mime.starts_with("text/") {
        return format!("{source_mime}; charset=utf-8");
    }
    source_mime.to_string()
}

fn log_request(
    method: &Method,
    path: &str,
    outcome: &str,
    total: Duration,
    metrics: &ChainMetrics,
) {
    tracing::info!(
        "dev: {method} {path} {outcome} {}",
        format_duration_parts(total, metrics)
    );
}

/// `duration_ms=N`, extended with the instantiation sum and per-stage
/// durations when any stage ran.
fn format_duration_parts(total: Duration, metrics: &ChainMetrics) -> String {
    let total_ms = total.as_millis();
    if metrics.stage_durations.is_empty() {
        return format!("duration_ms={total_ms}");
    }
    let stages: Vec<String> = metrics
        .stage_durations
        .iter()
        .map(|d| d.as_millis().to_string())
        .collect();
    format!(
        "duration_ms={total_ms} instantiation_ms={} module_durations_ms=[{}]",
        metrics.instantiation_total().as_millis(),
        stages.join(",")
    )
}
