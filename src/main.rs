#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Result;
use lazy_static::lazy_static;
use log::{error, info};
use poem::listener::{Listener, TcpListener};
use tokio::sync::watch;

// Form Store Utilities
use crate::services::forwarder::Forwarder;
use crate::services::ingest_listener::{run_ingest_listener, IngestSource};
use crate::services::store::{spawn_store, JsonStore};
use crate::services::web_front::{run_web_front, WebCtx};
use crate::utils::config::{init_log, init_runtime_context, RuntimeCtx, Transport};
use crate::utils::errors::Errors;

// Modules
mod services;
mod utils;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Queue depth between web front and ingest listener in channel mode.
const CHANNEL_DEPTH: usize = 1024;

// ***************************************************************************
//                             Static Variables
// ***************************************************************************
// Lazily initialize the parameters variable so that is has a 'static lifetime.
// We exit if we can't read our parameters.
lazy_static! {
    static ref RUNTIME_CTX: RuntimeCtx = load_runtime_context();
}

// ---------------------------------------------------------------------------
// main:
// ---------------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<()> {
    // --------------- Initialize ---------------------
    println!("Starting formstore_server!");
    init_log()?;
    info!("{}", Errors::InputParms(format!("{:#?}", *RUNTIME_CTX)));
    print_version_info();

    let config = &RUNTIME_CTX.parms.config;

    // --------------- Store --------------------------
    let store = JsonStore::new(RUNTIME_CTX.store_path());
    match store.load() {
        Ok(doc) => info!("Store document {} holds {} records.", store.path().display(), doc.len()),
        Err(e) => error!("{} Submissions will be lost until this is fixed.", e),
    }
    let (store_handle, store_writer) = spawn_store(store);

    // --------------- Bind Endpoints -----------------
    // Both endpoints are bound before anything is served.
    let (forwarder, source) = match config.transport {
        Transport::Udp => {
            let ingest_addr = config.ingest_socket_addr();
            let source = IngestSource::bind_udp(&ingest_addr).await?;
            let forwarder = Forwarder::udp(&ingest_addr).await?;
            (forwarder, source)
        },
        Transport::Channel => Forwarder::channel(CHANNEL_DEPTH),
    };

    let http_addr = config.http_socket_addr();
    let acceptor = TcpListener::bind(http_addr.clone()).into_acceptor().await
        .map_err(|e| Errors::BindFailed("web front".to_string(), http_addr.clone(), e))?;
    info!("Web front listening on http://{}.", http_addr);

    // --------------- Main Loops ---------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_interrupt(shutdown_tx));

    let web_ctx = WebCtx::new(RUNTIME_CTX.pages_dir(), RUNTIME_CTX.static_dir(),
                              forwarder, config.submission_limit());
    let web = tokio::spawn(run_web_front(acceptor, web_ctx, config.title.clone(), shutdown_rx.clone(),
                                         Duration::from_secs(config.shutdown_timeout_secs)));
    let ingest = tokio::spawn(run_ingest_listener(source, store_handle, shutdown_rx));

    // --------------- Shutdown -----------------------
    let (web_result, ingest_result) = tokio::join!(web, ingest);
    match web_result {
        Ok(Ok(())) => info!("Web front stopped."),
        Ok(Err(e)) => error!("Web front failed: {}", e),
        Err(e) => error!("Web front task failed: {}", e),
    }
    if let Err(e) = ingest_result {
        error!("Ingest listener task failed: {}", e);
    }

    // The writer drains once the listener has dropped its handle.
    if let Err(e) = store_writer.await {
        error!("Store writer task failed: {}", e);
    }

    info!("formstore_server exiting.");
    Ok(())
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// load_runtime_context:
// ---------------------------------------------------------------------------
fn load_runtime_context() -> RuntimeCtx {
    match init_runtime_context() {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("FAILED to read configuration: {}", e);
            eprintln!("FAILED to read configuration: {}", e);
            std::process::exit(1);
        }
    }
}

// ---------------------------------------------------------------------------
// wait_for_interrupt:
// ---------------------------------------------------------------------------
/** Flip the shutdown flag on Ctrl-C.  If the signal handler cannot be
 * installed the flag is never flipped and the sender is kept alive, so the
 * loops keep running rather than stopping immediately.
 */
async fn wait_for_interrupt(shutdown: watch::Sender<bool>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Interrupt received, stopping web front and ingest listener.");
            let _ = shutdown.send(true);
        },
        Err(e) => {
            error!("Unable to listen for the interrupt signal: {}", e);
            std::future::pending::<()>().await;
        },
    }
}

// ---------------------------------------------------------------------------
// print_version_info:
// ---------------------------------------------------------------------------
fn print_version_info() {
    info!("*** Running formstore_server={}", option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"));
}
