/// quicmux daemon
///
/// Small driver around the quicmux endpoints:
/// - runs an echo or uppercase server
/// - sends a single request as a client
/// - measures round trips of many concurrent requests
/// - writes a self-signed certificate for development

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};

use quicmux_common::EndpointConfig;
use quicmux_core::server::handler;
use quicmux_core::transport::tls;
use quicmux_core::{Client, MultiplexerStats, QuicClient, QuicServer};

const CONFIG_FILE: &str = "quicmux.toml";
const CERT_DIR: &str = "quicmux-certs";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => print_help(),
        "version" | "--version" | "-v" => {
            println!("quicmux daemon v{}", env!("CARGO_PKG_VERSION"));
        }
        "server" => {
            let mode = args.get(2).map(String::as_str).unwrap_or("echo");
            run_server(mode).await?;
        }
        "client" => {
            let message = args.get(2).cloned().unwrap_or_else(|| "hello".to_string());
            run_client(message).await?;
        }
        "bench" => {
            let count = match args.get(2) {
                Some(n) => n.parse().with_context(|| format!("invalid request count: {}", n))?,
                None => 1000,
            };
            run_bench(count).await?;
        }
        "gen-cert" => {
            let dir = PathBuf::from(args.get(2).map(String::as_str).unwrap_or(CERT_DIR));
            let material = tls::generate_self_signed(&dir, &["localhost"])?;
            println!("Certificate: {}", material.cert_path.display());
            println!("Private key: {}", material.key_path.display());
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Read `quicmux.toml`, writing the defaults on first run
fn load_config() -> Result<EndpointConfig> {
    let config_path = PathBuf::from(CONFIG_FILE);
    if config_path.exists() {
        info!("Loading configuration from {:?}", config_path);
        return Ok(EndpointConfig::from_file(&config_path)?);
    }

    info!("No configuration file found, using defaults");
    let config = EndpointConfig::default();
    if let Err(e) = config.to_file(&config_path) {
        warn!("Failed to save default config: {}", e);
    } else {
        info!("Saved default configuration to {:?}", config_path);
    }
    Ok(config)
}

async fn run_server(mode: &str) -> Result<()> {
    let mut config = load_config()?;
    if config.cert_path.is_none() || config.key_path.is_none() {
        let material = tls::generate_self_signed(Path::new(CERT_DIR), &["localhost"])?;
        info!("Using self-signed certificate {:?}", material.cert_path);
        config = config
            .with_cert(material.cert_path)
            .with_key(material.key_path);
    }

    let builder = QuicServer::from_config(config).with_error_hook(|stream_id, err| {
        warn!(stream_id = %stream_id, "Handler failed: {:#}", err);
    });
    let builder = match mode {
        "echo" => builder.with_handler(handler::Echo),
        "upper" | "uppercase" => builder.with_handler(handler::uppercase()),
        other => bail!("unknown server mode '{}' (expected echo or upper)", other),
    };

    let server = tokio::task::spawn_blocking(move || builder.start()).await??;
    info!("Server listening on {}. Press Ctrl+C to stop.", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let stats = tokio::task::spawn_blocking(move || {
        server.close();
        server.stats()
    })
    .await?;

    println!("\n========================================");
    println!("         quicmux server summary");
    println!("========================================");
    println!("Connections:      {}", stats.connections);
    println!("Invocations:      {}", stats.invocations);
    println!("Replies:          {}", stats.replies);
    println!("Handler errors:   {}", stats.handler_errors);
    println!("Rejected streams: {}", stats.rejected_streams);
    println!("========================================\n");
    Ok(())
}

async fn connect() -> Result<Client> {
    let config = load_config()?;
    let builder = QuicClient::from_config(config);
    let builder = if builder.config().ca_path.is_none() && !builder.config().insecure {
        warn!("No CA bundle configured, skipping server certificate verification");
        builder.insecure(true)
    } else {
        builder
    };

    let client = tokio::task::spawn_blocking(move || builder.start()).await??;
    info!("Connected to {}", client.remote_addr());
    Ok(client)
}

async fn run_client(message: String) -> Result<()> {
    let client = connect().await?;

    let reply = tokio::task::spawn_blocking(move || {
        let reply = client.request(message, Some(REQUEST_TIMEOUT));
        client.close();
        reply
    })
    .await??;

    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}

async fn run_bench(count: usize) -> Result<()> {
    let client = Arc::new(connect().await?);
    info!("Sending {} concurrent requests", count);

    let started = Instant::now();
    let requests: Vec<_> = (0..count)
        .map(|i| {
            let client = client.clone();
            tokio::task::spawn_blocking(move || {
                let payload = Bytes::from(format!("request-{}", i));
                client.request(payload.clone(), Some(REQUEST_TIMEOUT)).map(|reply| reply.len() == payload.len())
            })
        })
        .collect();

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for request in requests {
        match request.await? {
            Ok(true) => succeeded += 1,
            Ok(false) => {
                warn!("Reply length did not match request");
                failed += 1;
            }
            Err(e) => {
                warn!("Request failed: {}", e);
                failed += 1;
            }
        }
    }
    let elapsed = started.elapsed();

    let stats = tokio::task::spawn_blocking(move || {
        let stats = client.stats();
        client.close();
        stats
    })
    .await??;

    print_bench(count, succeeded, failed, elapsed, &stats);
    Ok(())
}

fn print_bench(count: usize, succeeded: usize, failed: usize, elapsed: Duration, stats: &MultiplexerStats) {
    let per_second = count as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

    println!("\n========================================");
    println!("         quicmux benchmark");
    println!("========================================");
    println!("Requests:         {}", count);
    println!("Succeeded:        {}", succeeded);
    println!("Failed:           {}", failed);
    println!("Elapsed:          {:.3}s", elapsed.as_secs_f64());
    println!("Throughput:       {:.0} req/s", per_second);
    println!("Timed out:        {}", stats.timed_out);
    println!("Late chunks:      {}", stats.unknown_stream_chunks);
    println!("========================================\n");
}

/// Print help message
fn print_help() {
    println!("quicmux daemon - multiplexed request/response over QUIC");
    println!();
    println!("USAGE:");
    println!("    quicmux-daemon [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    server [echo|upper]   Run a server with the given handler (default echo)");
    println!("    client [MESSAGE]      Send one request and print the reply");
    println!("    bench [N]             Send N concurrent requests and report timing");
    println!("    gen-cert [DIR]        Write a self-signed cert.pem/key.pem into DIR");
    println!("    help                  Show this help message");
    println!("    version               Show version information");
    println!();
    println!("Settings are read from {} in the working directory.", CONFIG_FILE);
    println!("Without cert_path/key_path the server generates a certificate in {}.", CERT_DIR);
}
