//! Lock server.

use clap::Parser;
use std::{process::ExitCode, time::Duration};

use lockq::{server::Server, Cfg};

/// Network-reachable advisory lock broker.
#[derive(Parser, Debug)]
#[command(name = "lockq-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Maximum number of pending lock requests per namespace.
    #[arg(long)]
    max_pending: Option<usize>,

    /// Token clients must present to authenticate.
    #[arg(long, env = "LOCKQ_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Milliseconds after which an idle namespace is removed.
    #[arg(long, default_value_t = 10_000)]
    idle_timeout_ms: u64,

    /// Milliseconds a connection has to authenticate.
    #[arg(long, default_value_t = 2_000)]
    auth_timeout_ms: u64,
}

impl Args {
    fn cfg(&self) -> Result<Cfg, String> {
        if self.idle_timeout_ms == 0 || self.auth_timeout_ms == 0 {
            return Err("timeouts must be positive".to_string());
        }
        if matches!(&self.token, Some(token) if token.is_empty()) {
            return Err("token must not be empty".to_string());
        }

        Ok(Cfg {
            max_pending: self.max_pending,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            token: self.token.clone(),
            auth_timeout: Duration::from_millis(self.auth_timeout_ms),
            ..Default::default()
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = match args.cfg() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::FAILURE;
        }
    };
    if cfg.token.is_none() {
        log::warn!("no token configured, clients are not authenticated");
    }

    let server = match Server::bind((args.host.as_str(), args.port), cfg).await {
        Ok(server) => server,
        Err(err) => {
            log::error!("cannot listen on {}:{}: {}", &args.host, args.port, err);
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = server.run().await {
        log::error!("lock server failed: {}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
