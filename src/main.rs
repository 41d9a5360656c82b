use clap::Parser;
use rscp::cli::{Cli, Command};
use rscp::progress::{LogSink, ProgressSink, TerminalSink};
use rscp::service;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Command::Transfer(args) = cli.command;

    if let Err(e) = rscp::logger::init(args.log_level()) {
        eprintln!("failed to initialize logging: {e}");
    }

    let config = match args.to_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("rscp: {message}");
            std::process::exit(2);
        }
    };

    let sink: Arc<dyn ProgressSink> = if args.quiet {
        Arc::new(rscp::progress::NoOpSink)
    } else if atty_stdout() {
        Arc::new(TerminalSink::new(0))
    } else {
        Arc::new(LogSink)
    };

    let src = args.src.clone();
    let dst = args.dst.clone();
    let auth = args.ssh_auth();

    let cancel = Arc::new(AtomicBool::new(false));
    tokio::spawn(wait_for_signal(cancel.clone()));

    let result = tokio::task::spawn_blocking(move || {
        service::run_transfer(&src, &dst, config, auth, sink, cancel)
    })
    .await;

    match result {
        Ok(Ok(outcome)) => {
            tracing::info!(
                bytes = outcome.bytes_transferred,
                chunks = outcome.chunks,
                elapsed_secs = outcome.elapsed.as_secs_f64(),
                hash = %outcome.file_hash,
                "transfer complete"
            );
            std::process::exit(0);
        }
        Ok(Err(err)) => {
            let code = err.exit_code();
            eprintln!("rscp: {err}");
            std::process::exit(code);
        }
        Err(join_err) => {
            eprintln!("rscp: internal task failure: {join_err}");
            std::process::exit(1);
        }
    }
}

/// `indicatif`'s bar is only useful against an interactive terminal;
/// elsewhere it would just spam a log file with carriage returns.
fn atty_stdout() -> bool {
    use std::io::IsTerminal;
    std::io::stdout().is_terminal()
}

/// Wait for SIGINT or SIGTERM, then request a graceful stop. Runs detached
/// alongside the (blocking) transfer task; dropped with the runtime once
/// `main` returns.
async fn wait_for_signal(cancel: Arc<AtomicBool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, draining in-flight chunks"),
        _ = terminate => tracing::info!("received SIGTERM, draining in-flight chunks"),
    }

    cancel.store(true, Ordering::SeqCst);
}
