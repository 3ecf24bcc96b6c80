//! Daemon entry point (§4.11): loads configuration, derives the endpoint's
//! identity, wires the dispatcher/endpoint/sequencer together, arms the
//! configured auto-connect targets, and runs until `Ctrl+C`/`SIGINT`, at which
//! point every connected peer is sent `BY` before the process exits.
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use log::{info, warn};

use rtpmidid::config;
use rtpmidid::dispatcher::Dispatcher;
use rtpmidid::endpoint::Endpoint;
use rtpmidid::sequencer::LoopbackSequencer;
use rtpmidid::ssrc;

#[cfg(feature = "mdns")]
use rtpmidid::discovery::{MdnsAdvertisement, MdnsBrowser, SkipSelf};

const DEFAULT_CONFIG_PATH: &str = "rtpmidid.conf";

struct Args {
    config_path: PathBuf,
    auto_connect: Vec<String>,
}

/// Hand-rolled argument parsing, matching the corpus's own lack of a CLI-parsing
/// crate for a daemon this small: `--config <path>` plus `host:port` positionals
/// (§6 "Command-line positional arguments are also treated as host:port
/// auto-connect entries").
fn parse_args() -> Args {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut auto_connect = Vec::new();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            if let Some(path) = iter.next() {
                config_path = PathBuf::from(path);
            }
        } else {
            auto_connect.push(arg);
        }
    }
    Args { config_path, auto_connect }
}

#[cfg(feature = "mdns")]
fn default_name() -> String {
    hostname::get().map(|h| h.to_string_lossy().to_string()).unwrap_or_else(|e| {
        warn!("main: failed to read hostname, falling back to a fixed name: {e}");
        "rtpmidid".to_string()
    })
}

#[cfg(not(feature = "mdns"))]
fn default_name() -> String {
    "rtpmidid".to_string()
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = parse_args();
    let mut cfg = config::load(&args.config_path).with_context(|| format!("loading configuration from {}", args.config_path.display()))?;
    cfg.add_cli_targets(&args.auto_connect).context("parsing host:port arguments")?;

    let name = default_name();
    let ssrc = cfg.ssrc_override.unwrap_or_else(|| ssrc::derive_ssrc(&name));
    info!("starting {name} (ssrc {ssrc:#010x}) on port {}/{}", cfg.port, cfg.port + 1);

    let sequencer = LoopbackSequencer::new().context("creating the local sequencer bridge")?;
    let endpoint = Endpoint::bind(cfg.port, name.clone(), ssrc, sequencer)
        .with_context(|| format!("binding control/data sockets on port {}/{}", cfg.port, cfg.port + 1))?;
    let mut dispatcher = Dispatcher::new(endpoint).context("creating the event dispatcher")?;

    let poll_registry = dispatcher.registry_handle().context("cloning the poll registry")?;
    dispatcher.handler_mut().register_sources(&poll_registry).context("registering sockets and sequencer with the poll loop")?;

    for addr in cfg.auto_connect.clone() {
        dispatcher.with_handler(|endpoint, timers| {
            if let Err(e) = endpoint.invite_participant(addr, timers) {
                warn!("startup: invite to {addr} failed: {e}");
            }
        });
    }

    #[cfg(feature = "mdns")]
    let _advertisement = MdnsAdvertisement::announce(&name, cfg.port).map_err(|e| warn!("mdns: failed to announce this endpoint: {e}")).ok();

    #[cfg(feature = "mdns")]
    let _browser = {
        let sender = dispatcher.task_sender();
        let policy = SkipSelf { own_name: name.clone() };
        MdnsBrowser::start(sender, policy).map_err(|e| warn!("mdns: failed to start browsing for peers: {e}")).ok()
    };

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown_requested.clone();
    let sender = dispatcher.task_sender();
    ctrlc::set_handler(move || {
        info!("received shutdown signal, tearing down sessions");
        let shutdown_flag = shutdown_flag.clone();
        sender.send(Box::new(move |endpoint, timers| {
            endpoint.shutdown(timers);
            shutdown_flag.store(true, Ordering::SeqCst);
        }));
    })
    .context("installing the Ctrl+C handler")?;

    while !shutdown_requested.load(Ordering::SeqCst) {
        dispatcher.run_once().context("running the event dispatcher")?;
    }

    info!("shutdown complete, exiting");
    Ok(())
}
