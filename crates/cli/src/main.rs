use std::io;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use camstream::{Server, ServerConfig};

mod backend;

#[derive(Parser)]
#[command(
    name = "camstream-server",
    about = "RTSP camera streaming server with an MJPEG HTTP endpoint"
)]
struct Args {
    /// TOML configuration file (all fields optional)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the RTSP port
    #[arg(long, short)]
    port: Option<u16>,

    /// Override the MJPEG HTTP port
    #[arg(long)]
    mjpeg_port: Option<u16>,

    /// Disable authentication (explicit opt-out)
    #[arg(long)]
    no_auth: bool,
}

fn load_config(args: &Args) -> Result<ServerConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| format!("read {}: {e}", path.display()))?;
            toml::from_str(&contents).map_err(|e| format!("parse {}: {e}", path.display()))?
        }
        None => ServerConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.bind_address = bind.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(port) = args.mjpeg_port {
        config.mjpeg_server_port = port;
    }
    if args.no_auth {
        config.auth_required = false;
    }
    Ok(config)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let rtsp = format!("rtsp://{}:{}/live", config.bind_address, config.port);
    let mjpeg = format!("http://{}:{}/Back/", config.bind_address, config.mjpeg_server_port);

    let mut server = Server::new(config, backend::demo_backends());
    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {e}");
        std::process::exit(1);
    }

    println!("RTSP stream at {rtsp} (front camera: {rtsp}/front)");
    println!("MJPEG preview at {mjpeg}");
    println!("Press Enter to stop");
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    server.stop();
}
