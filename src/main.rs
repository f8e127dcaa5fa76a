use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use toyframe::ViewerConfig;

/// Runs ShaderToy shaders in a desktop window.
#[derive(Parser, Debug)]
#[command(name = "toyframe", version)]
struct Cli {
    /// Shader description (JSON) to open at startup.
    shader: Option<PathBuf>,

    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    fullscreen: bool,

    /// Window width, used together with --height.
    #[arg(long, requires = "height")]
    width: Option<u32>,

    #[arg(long, requires = "width")]
    height: Option<u32>,
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info"))
        .filter_module("wgpu_hal", log::LevelFilter::Error)
        .filter_module("naga", log::LevelFilter::Warn)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ViewerConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => ViewerConfig::default(),
    };
    if let Some(shader) = cli.shader {
        config = config.shader(shader);
    }
    if cli.fullscreen {
        config = config.fullscreen(true);
    }
    if let (Some(width), Some(height)) = (cli.width, cli.height) {
        config = config.size(width, height);
    }

    toyframe::run(config)?;
    Ok(())
}
