pub mod chain;   // stage composition + executors
pub mod errors;  // error handling
pub mod media;   // BMP bridge + magic sniffing
pub mod server;  // dev server
pub mod wasm;    // engine, loading, ABI probing
