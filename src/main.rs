// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use image::ImageFormat;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use quern::chain::{format_output_bytes, Chain, ChainMetrics, DataEncoding, CHAIN_DEADLINE};
use quern::chain::tile::{run_tile_stages, TileInstance};
use quern::server::{serve, DevServerConfig};
use quern::wasm::{compile_module, new_engine, ExecContext};

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];

#[derive(Parser, Debug)]
#[command(
    name = "quern",
    version,
    about = "Run chains of untrusted wasm transforms over bytes, text, and images"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a chain of wasm modules on input bytes or text.
    Run(RunArgs),
    /// Run wasm tile filters over an input image.
    Image(ImageArgs),
    /// Serve a content directory, applying per-MIME recipe chains.
    Dev(DevArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Input file path, or `-` for stdin. With no `-i`, stdin is read when
    /// it is not a terminal.
    #[arg(short = 'i')]
    input: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Wasm module paths or https:// URLs, executed in order.
    #[arg(required = true)]
    modules: Vec<String>,
}

#[derive(Args, Debug)]
struct ImageArgs {
    /// Input image path (PNG or JPEG).
    #[arg(short = 'i')]
    input: PathBuf,

    /// Output image path (always written as PNG).
    #[arg(short = 'o')]
    output: PathBuf,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Wasm tile module paths or https:// URLs, executed in order.
    #[arg(required = true)]
    modules: Vec<String>,
}

#[derive(Args, Debug)]
struct DevArgs {
    /// Content directory to serve.
    content_dir: PathBuf,

    /// Recipe modules root directory.
    #[arg(long)]
    recipes: Option<PathBuf>,

    /// Port to listen on.
    #[arg(short = 'p', default_value_t = 4000)]
    port: u16,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Commands::Run(args) => args.verbose,
        Commands::Image(args) => args.verbose,
        Commands::Dev(args) => args.verbose,
    };
    init_tracing(verbose);

    match cli.command {
        Commands::Run(args) => run_cmd(args),
        Commands::Image(args) => image_cmd(args),
        Commands::Dev(args) => dev_cmd(args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "quern=debug" } else { "quern=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_cmd(args: RunArgs) -> anyhow::Result<()> {
    let input = read_run_input(args.input.as_deref())?;
    tracing::debug!(sha256 = %hex::encode(Sha256::digest(&input)), "input digest");

    let started = Instant::now();
    let chain = Chain::build(&args.modules)?;

    let ctx = ExecContext::with_timeout(CHAIN_DEADLINE);
    let mut metrics = ChainMetrics::default();
    let result = chain.run(&input, &ctx, 0, &mut metrics)?;

    let mut stdout = std::io::stdout().lock();
    match result.encoding {
        DataEncoding::Raw => stdout
            .write_all(&result.bytes)
            .context("Error writing raw output")?,
        DataEncoding::Utf8 => {
            stdout
                .write_all(&result.bytes)
                .context("Error writing output")?;
            stdout.write_all(b"\n").context("Error writing output")?;
        }
        DataEncoding::I32Array => stdout
            .write_all(&format_output_bytes(&result))
            .context("Error writing i32 output")?,
    }

    tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "command took");
    Ok(())
}

fn read_run_input(input: Option<&str>) -> anyhow::Result<Vec<u8>> {
    match input {
        Some("-") => {
            let mut bytes = Vec::new();
            std::io::stdin()
                .read_to_end(&mut bytes)
                .context("Error reading stdin")?;
            Ok(bytes)
        }
        Some(path) => std::fs::read(path).context("Error reading input file"),
        None => {
            let stdin = std::io::stdin();
            if stdin.is_terminal() {
                return Ok(Vec::new());
            }
            let mut bytes = Vec::new();
            stdin
                .lock()
                .read_to_end(&mut bytes)
                .context("Error reading stdin")?;
            Ok(bytes)
        }
    }
}

fn image_cmd(args: ImageArgs) -> anyhow::Result<()> {
    let input_bytes = std::fs::read(&args.input).context("Error reading image file")?;
    let decoded = if input_bytes.len() >= 8 && input_bytes[..8] == PNG_SIGNATURE {
        image::load_from_memory_with_format(&input_bytes, ImageFormat::Png)
    } else {
        image::load_from_memory(&input_bytes)
    }
    .context("Error decoding image file")?;
    let input_rgba = decoded.to_rgba8();

    let started = Instant::now();
    let engine = new_engine()?;
    let ctx = ExecContext::with_timeout(CHAIN_DEADLINE);

    let mut stages = Vec::with_capacity(args.modules.len());
    for source in &args.modules {
        let loaded = compile_module(&engine, source)?;
        let (stage, _) = TileInstance::new(&engine, &loaded.module, &ctx)?;
        stages.push(stage);
    }

    let (output_rgba, _) = run_tile_stages(&mut stages, &input_rgba, 0)?;

    output_rgba
        .save_with_format(&args.output, ImageFormat::Png)
        .context("Error writing output image")?;

    tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "command took");
    Ok(())
}

fn dev_cmd(args: DevArgs) -> anyhow::Result<()> {
    if args.port == 0 {
        anyhow::bail!("Invalid port: {}", args.port);
    }
    serve(DevServerConfig {
        content_root: args.content_dir,
        recipes_root: args.recipes,
        port: args.port,
    })
}
