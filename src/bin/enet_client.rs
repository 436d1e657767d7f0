//! enet-client: interactive line client for enet-server
//!
//! Sends each line typed on stdin and prints whatever the server replies.

use clap::Parser;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "enet-client")]
#[command(version = "0.1.0")]
#[command(about = "Interactive client for enet-server", long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 5000)]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn prompt() -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "Enter string: ")?;
    stdout.flush()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let stream = TcpStream::connect((args.host.as_str(), args.port)).await?;
    info!(server = %stream.peer_addr()?, "Connected");
    let (mut reader, mut writer) = stream.into_split();

    // Print replies as they arrive
    let mut replies = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    println!();
                    println!("Server closed the connection");
                    break;
                }
                Ok(n) => {
                    print!("{}", String::from_utf8_lossy(&buf[..n]));
                    let _ = prompt();
                }
                Err(e) => {
                    warn!(error = %e, "Receive failed");
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    loop {
        tokio::select! {
            _ = &mut replies => return Ok(()),
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.is_empty() {
                    prompt()?;
                    continue;
                }
                writer.write_all(format!("{line}\n").as_bytes()).await?;
                debug!(bytes = line.len() + 1, "Sent");
            }
        }
    }

    writer.shutdown().await?;
    replies.abort();
    Ok(())
}
