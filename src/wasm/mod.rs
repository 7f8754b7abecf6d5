// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod engine;
pub mod loader;
pub mod probe;

pub use engine::{new_engine, ExecContext};
pub use loader::{compile_module, compile_module_bytes, read_module_source, LoadedModule, StageKind};
pub use probe::{probe_scalar, probe_tile, ScalarAbi, TileAbi};
