//! `sewerpipe`: a minimal MQTT 3.1.1 broker.
//!
//! Parses CLI flags, wires up logging, installs signal handling, and hands
//! off to [`mqtt_broker::Broker`]. Everything that matters is in the
//! library; this binary is the thin ambient shell around it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGPIPE, SIGTERM};
use signal_hook::iterator::Signals;

use mqtt_broker::limits::DEFAULT_PORT;
use mqtt_broker::Broker;

/// A minimal MQTT 3.1.1 broker.
#[derive(Parser)]
#[command(name = "sewerpipe", version, about)]
struct Cli {
    /// TCP port to listen on.
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    if std::env::var_os("RUST_LOG").is_none() {
        let level = if cli.verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }
    pretty_env_logger::init();

    if let Err(err) = run(cli.port) {
        log::error!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run(port: u16) -> anyhow::Result<()> {
    ignore_sigpipe()?;

    let running = Arc::new(AtomicBool::new(true));
    spawn_shutdown_watcher(Arc::clone(&running))?;

    let mut broker = Broker::bind(port)?;
    broker.run(&running)?;

    log::info!("shut down cleanly");
    Ok(())
}

/// By default a write to a peer that already closed its end of the socket
/// raises `SIGPIPE`, which kills the process outright; the broker would
/// rather see that as an `EPIPE` on the write call and close the session.
fn ignore_sigpipe() -> anyhow::Result<()> {
    unsafe {
        signal_hook::low_level::register(SIGPIPE, || {})?;
    }
    Ok(())
}

/// `SIGINT`/`SIGTERM` clear the running flag from a dedicated thread; the
/// event loop notices within one `poll` timeout and exits after the current
/// iteration, then [`Broker::run`] tears down every session on the way out.
fn spawn_shutdown_watcher(running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            log::info!("received shutdown signal");
            running.store(false, Ordering::SeqCst);
        }
    });
    Ok(())
}
