//! rpcchannel - command-line front end for the rpcchannel library.
//!
//! `serve` runs the built-in `Calc`/`Ticker` targets over plain TCP, or over
//! Noise when `--key` is given. `call` issues a single call and prints the
//! result along with any events that arrive. `keygen` writes a Noise key file.

mod demo;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rpcchannel::noise::parse_key;
use rpcchannel::{
    dial_noise, dial_tcp, serve_noise, serve_tcp, ClientConfig, Connection, NoiseKeypair,
    NoiseSettings, Payload, RpcClient, ServerConfig, SessionConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "rpcchannel")]
#[command(about = "Bidirectional RPC over TCP or Noise")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the built-in Calc and Ticker targets
    Serve(ServeArgs),
    /// Issue one call and print the result
    Call(CallArgs),
    /// Generate a Noise key file
    Keygen {
        /// Where to write the key file
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct NoiseArgs {
    /// Noise key file; enables the encrypted transport
    #[arg(long)]
    key: Option<PathBuf>,

    /// Hex public key of an accepted peer (repeatable)
    #[arg(long = "allow")]
    allow: Vec<String>,
}

impl NoiseArgs {
    fn settings(&self) -> Result<Option<NoiseSettings>> {
        let Some(path) = &self.key else {
            if !self.allow.is_empty() {
                bail!("--allow requires --key");
            }
            return Ok(None);
        };
        let keypair = NoiseKeypair::load(path)
            .with_context(|| format!("Failed to load key file {}", path.display()))?;
        let mut settings = NoiseSettings::new(keypair);
        for key in &self.allow {
            settings = settings.allow(parse_key(key)?);
        }
        Ok(Some(settings))
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Maximum concurrent sessions
    #[arg(long, default_value_t = rpcchannel::ProtocolConfig::MAX_CONNECTIONS)]
    max_connections: usize,

    /// Maximum concurrently running handlers per session
    #[arg(long)]
    max_in_flight: Option<usize>,

    #[command(flatten)]
    noise: NoiseArgs,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7420")]
    addr: String,

    /// Target object, e.g. Calc
    target: String,

    /// Mangled method name, e.g. "add(int,int)"
    mangle: String,

    /// JSON parameter list
    #[arg(default_value = "[]")]
    params: String,

    /// Keep listening for events this many milliseconds after the result
    #[arg(long, default_value = "0")]
    linger_ms: u64,

    /// Connect timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    #[command(flatten)]
    noise: NoiseArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging on stderr; stdout carries results.
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Call(args) => call(args).await,
        Command::Keygen { out } => keygen(out),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig::default()
        .max_connections(args.max_connections)
        .session(SessionConfig::default().max_in_flight(args.max_in_flight));
    let addr = format!("{}:{}", args.host, args.port);

    let mut server = match args.noise.settings()? {
        Some(settings) => {
            info!("Public key: {}", settings.keypair.public_key_hex());
            serve_noise(addr.as_str(), settings, config, demo::registry).await?
        }
        None => serve_tcp(addr.as_str(), config, demo::registry).await?,
    };

    // Print port for scripts to read (intentional stdout)
    println!("RPC_PORT={}", server.local_addr().port());
    info!("RPC server running on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, disconnecting sessions");
    server.shutdown();
    // Give sessions a moment to complete the disconnect handshake.
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}

async fn call(args: CallArgs) -> Result<()> {
    let parameters = Payload::from_json(args.params.as_str()).context("Parameters must be valid JSON")?;
    let config = ClientConfig::default().connect_timeout(Duration::from_secs(args.timeout));

    let connection: Connection = match args.noise.settings()? {
        Some(settings) => dial_noise(args.addr.as_str(), &settings, &config).await?,
        None => dial_tcp(args.addr.as_str(), &config).await?,
    };
    if let Some(noise) = &connection.info().noise {
        info!("Server key: {}", noise.remote_static_hex());
    }

    let client = RpcClient::builder(connection)
        .config(config.session)
        .on_event(|event| println!("event {} {}", event.target, event.parameters))
        .start();

    let outcome = client.call(&args.target, &args.mangle, parameters).await;
    match &outcome {
        Ok(Some(value)) => println!("{}", value),
        Ok(None) => println!("(void)"),
        Err(_) => {}
    }

    if args.linger_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.linger_ms)).await;
    }
    client.disconnect().await;

    outcome.map(|_| ()).context("Call failed")
}

fn keygen(out: PathBuf) -> Result<()> {
    if out.exists() {
        bail!("Refusing to overwrite {}", out.display());
    }
    let keypair = NoiseKeypair::generate()?;
    keypair
        .save(&out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!("{}", keypair.public_key_hex());
    Ok(())
}
