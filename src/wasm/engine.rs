// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Engine construction and call cancellation.
//!
//! Every chain owns one `wasmtime::Engine` configured for epoch
//! interruption. A background ticker thread advances the epoch at a fixed
//! cadence and exits once the engine is dropped; each `Store` is armed with
//! an epoch-deadline callback that converts deadline expiry and explicit
//! cancellation into typed errors, leaving every other trap as an
//! execution failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use wasmtime::{Config, Engine, Store, UpdateDeadline};

use crate::errors::{Error, Result};

/// Epoch cadence. Deadlines are only observed at this granularity.
const EPOCH_TICK: Duration = Duration::from_millis(5);

pub fn new_engine() -> Result<Engine> {
    let mut config = Config::new();

    config.wasm_threads(false);
    config.wasm_memory64(false);
    config.wasm_component_model(false);
    config.epoch_interruption(true);

    let engine = Engine::new(&config).map_err(|e| Error::BadModule(e.to_string()))?;
    spawn_epoch_ticker(&engine)?;
    Ok(engine)
}

/// The ticker holds only a weak handle so it dies with the engine.
fn spawn_epoch_ticker(engine: &Engine) -> Result<()> {
    let weak = engine.weak();
    std::thread::Builder::new()
        .name("quern-epoch-ticker".to_string())
        .spawn(move || loop {
            std::thread::sleep(EPOCH_TICK);
            match weak.upgrade() {
                Some(engine) => engine.increment_epoch(),
                None => break,
            }
        })?;
    Ok(())
}

/// Deadline and cancellation state for one chain execution.
///
/// Cloned into every store of the chain; the epoch callback re-arms itself
/// each tick until the deadline passes or the flag is set.
#[derive(Clone)]
pub struct ExecContext {
    total: Duration,
    expires_at: Instant,
    canceled: Arc<AtomicBool>,
}

impl ExecContext {
    pub fn with_timeout(total: Duration) -> Self {
        Self {
            total,
            expires_at: Instant::now() + total,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Abort in-flight and future calls armed with this context.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    pub fn deadline(&self) -> Duration {
        self.total
    }

    /// Arm `store` so wasm calls unwind when this context expires.
    pub fn arm_store(&self, store: &mut Store<()>) {
        let ctx = self.clone();
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(move |_| {
            if ctx.is_canceled() {
                return Err(Error::ExecutionCanceled.into());
            }
            if Instant::now() >= ctx.expires_at {
                return Err(Error::ExecutionTimeout(ctx.total).into());
            }
            Ok(UpdateDeadline::Continue(1))
        });
    }
}

/// Map a failed wasm call or instantiation back into the crate taxonomy.
///
/// Timeout/cancel errors raised by the epoch callback pass through intact;
/// anything else (traps, missing imports) takes the caller's fallback kind.
pub(crate) fn map_wasm_error(
    err: anyhow::Error,
    fallback: impl FnOnce(String) -> Error,
) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => err,
        Err(err) => fallback(format!("{err:#}")),
    }
}
