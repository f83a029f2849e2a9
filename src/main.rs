use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use waitd::cli::{Cli, Command};
use waitd::{client, probe, server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            socket,
            max_events,
            max_wait_ms,
        } => {
            let config = server::state::ServerConfig {
                socket_path: socket,
                max_events,
                max_wait: Duration::from_millis(max_wait_ms),
            };
            if let Err(e) = server::run(config).await {
                tracing::error!(error = %e, "daemon failed");
                eprintln!("waitd serve: {e}");
                std::process::exit(1);
            }
        }
        Command::Client { socket, action } => match client::run(socket, action).await {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                tracing::error!(error = %e, "client failed");
                eprintln!("waitd client: {e}");
                std::process::exit(1);
            }
        },
        Command::Probe {
            delay_ms,
            timeout_ms,
            no_signal,
        } => {
            let config = probe::ProbeConfig {
                signal_after: (!no_signal).then(|| Duration::from_millis(delay_ms)),
                timeout: Duration::from_millis(timeout_ms),
            };
            // The probe blocks its thread; keep it off the async workers.
            match tokio::task::spawn_blocking(move || probe::run(config)).await {
                Ok(Ok(report)) => {
                    println!(
                        "{} after {} ms",
                        if report.signaled { "signaled" } else { "timed out" },
                        report.elapsed.as_millis()
                    );
                    std::process::exit(if report.signaled {
                        0
                    } else {
                        client::EXIT_TIMED_OUT
                    });
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "probe failed");
                    eprintln!("waitd probe: {e}");
                    std::process::exit(1);
                }
                Err(e) => {
                    tracing::error!(error = %e, "probe thread failed");
                    eprintln!("waitd probe: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
