use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "handoffctl")]
#[command(about = "Control a running handoffd", long_about = None)]
struct Cli {
    /// Admin API base URL
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,

    /// Admin API key
    #[arg(short, long, env = "HANDOFF_API_KEY", default_value = "")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a successor that takes over the listening sockets (SIGHUP)
    Restart {
        #[arg(long)]
        pid: i32,
    },
    /// Drain connections and exit (SIGTERM)
    Stop {
        #[arg(long)]
        pid: i32,
    },
    /// Abandon in-flight connections after a shutdown (SIGUSR2)
    Hammer {
        #[arg(long)]
        pid: i32,
    },
    /// Reopen the log file after rotation (SIGUSR1)
    ReopenLogs {
        #[arg(long)]
        pid: i32,
    },
    /// Show lifecycle state, listeners and servers via the admin API
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (pid, signal) = match cli.command {
        Commands::Restart { pid } => (pid, Signal::SIGHUP),
        Commands::Stop { pid } => (pid, Signal::SIGTERM),
        Commands::Hammer { pid } => (pid, Signal::SIGUSR2),
        Commands::ReopenLogs { pid } => (pid, Signal::SIGUSR1),
        Commands::Status => return status(&cli.url, &cli.key).await,
    };

    if pid <= 0 {
        return Err(format!("refusing to signal pid {pid}").into());
    }
    kill(Pid::from_raw(pid), signal)?;
    println!("sent {signal} to {pid}");
    Ok(())
}

async fn status(url: &str, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}"))?);

    let res = reqwest::Client::new()
        .get(format!("{}/admin/status", url.trim_end_matches('/')))
        .headers(headers)
        .send()
        .await?;

    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {status}");
        if let Ok(text) = res.text().await {
            eprintln!("{text}");
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
