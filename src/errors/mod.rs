// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while building or running a module chain, or while
/// indexing content and recipes for the dev server.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Bad module: {0}")]
    BadModule(String),

    #[error("Input is too large: {len} bytes exceeds input capacity of {cap} bytes")]
    InputTooLarge { len: u64, cap: u64 },

    #[error("Module reported {len} output bytes, exceeding its stated capacity of {cap} bytes")]
    CapacityExceeded { len: u64, cap: u64 },

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Invalid UTF-8 in module output: {0}")]
    InvalidEncoding(#[from] std::str::Utf8Error),

    #[error("Wasm execution error: {0}")]
    ExecutionFailure(String),

    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("Execution canceled")]
    ExecutionCanceled,

    #[error("Chain error: {0}")]
    ChainTopology(String),

    #[error("Route index error: {0}")]
    RouteIndex(String),

    #[error("Recipe index error: {0}")]
    RecipeIndex(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stage {index}: {source}")]
    Stage {
        index: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach the chain position to a stage-level error.
    pub fn at_stage(self, index: usize) -> Error {
        Error::Stage {
            index,
            source: Box::new(self),
        }
    }

    /// The innermost error, unwrapping any stage-index context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
