//! Hub, panel and two tabs over WebSocket.
//!
//! Demonstrates:
//! - A hub accepting WebSocket channels on a random local port
//! - Panel broadcast answered by every tab
//! - Hub message targeted at a single tab
//! - Log verbosity driven by a settings store at runtime
//!
//! Usage:
//!   cargo run --example hub_and_tabs
//!   cargo run --example hub_and_tabs -- --debug

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use context_relay::settings::{LOG_LEVEL_KEY, MemorySettings, watch_log_level};
use context_relay::transport::WebSocketHost;
use context_relay::{ContextId, Error, MessageType, Relay, Result, Topic};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload};

// ============================================================================
// Constants
// ============================================================================

const TAB_COUNT: u32 = 2;
const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let debug = std::env::args().any(|a| a == "--debug");

    if let Err(e) = run(debug).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(debug: bool) -> Result<()> {
    println!("=== Hub and Tabs ===\n");

    // ========================================================================
    // Logging
    // ========================================================================

    let (filter, reload_handle) = reload::Layer::new(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    let settings = Arc::new(MemorySettings::new());
    settings.set(LOG_LEVEL_KEY, if debug { "debug" } else { "info" });
    let _log_watcher = watch_log_level(Arc::clone(&settings), move |level| {
        let _ = reload_handle.reload(LevelFilter::from(level));
    });

    // ========================================================================
    // Hub
    // ========================================================================

    println!("[1] Starting hub...");
    let hub_host = Arc::new(WebSocketHost::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?);
    let hub_url = hub_host.ws_url();
    let hub = Relay::builder()
        .shared_host(hub_host.clone())
        .identity(ContextId::Hub)
        .build()?;
    println!("    Hub listening on {hub_url}");

    let _hub_log = hub.subscribe(Topic::All, |message| {
        println!("    [hub] {} from {}", message.kind, message.source);
    });

    // ========================================================================
    // Panel and Tabs
    // ========================================================================

    println!("\n[2] Connecting panel and {TAB_COUNT} tabs...");
    let panel = Relay::builder()
        .host(WebSocketHost::dialer(&hub_url)?)
        .identity(ContextId::Panel)
        .build()?;

    let mut tabs = Vec::new();
    for n in 1..=TAB_COUNT {
        let identity = ContextId::tab(n);
        let tab = Relay::builder()
            .host(WebSocketHost::dialer(&hub_url)?)
            .identity(identity)
            .build()?;

        // Every tab answers an inspect request with a selection.
        let responder = tab.clone();
        let _ = tab.subscribe(MessageType::InspectStart, move |_| {
            let responder = responder.clone();
            tokio::spawn(async move {
                let payload = json!({ "selector": format!("#tab-{n}-heading") });
                let _ = responder
                    .send(MessageType::ElementSelected, payload, Some(ContextId::Panel))
                    .await;
            });
        });
        tabs.push(tab);
    }

    let expected = TAB_COUNT as usize + 1;
    let mut connections = hub.watch_connections();
    timeout(WAIT, connections.wait_for(|count| *count == expected))
        .await
        .map_err(|_| Error::connection_timeout(WAIT.as_millis() as u64))?
        .map_err(|_| Error::RelayClosed)?;
    println!("    Hub has {expected} channels");

    // ========================================================================
    // Broadcast
    // ========================================================================

    println!("\n[3] Panel broadcasts INSPECT_START...");
    let (selected_tx, mut selected_rx) = mpsc::unbounded_channel();
    let _selections = panel.subscribe(MessageType::ElementSelected, move |message| {
        let _ = selected_tx.send(message.clone());
    });

    panel
        .send(MessageType::InspectStart, json!({ "mode": "click" }), None)
        .await?;

    for _ in 0..TAB_COUNT {
        match timeout(WAIT, selected_rx.recv()).await {
            Ok(Some(message)) => println!(
                "    [panel] {} selected {}",
                message.source, message.payload["selector"]
            ),
            _ => println!("    [panel] timed out waiting for a selection"),
        }
    }

    // ========================================================================
    // Targeted
    // ========================================================================

    println!("\n[4] Raising log level and targeting tab-2...");
    settings.set(LOG_LEVEL_KEY, "trace");

    let (activated_tx, mut activated_rx) = mpsc::unbounded_channel();
    for tab in &tabs {
        let activated_tx = activated_tx.clone();
        let identity = tab.identity();
        let _ = tab.subscribe(MessageType::TabActivated, move |_| {
            let _ = activated_tx.send(identity);
        });
    }

    let outcome = hub
        .send(MessageType::TabActivated, json!({}), Some(ContextId::tab(2)))
        .await?;
    println!("    Hub send outcome: {outcome:?}");

    if let Ok(Some(identity)) = timeout(WAIT, activated_rx.recv()).await {
        println!("    {identity} activated");
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    println!("\n[5] Invalidating hub host...");
    settings.set(LOG_LEVEL_KEY, "info");
    hub_host.invalidate();
    tokio::time::sleep(Duration::from_millis(200)).await;

    for relay in std::iter::once(&panel).chain(&tabs) {
        println!("    {} is {}", relay.identity(), relay.state());
        relay.shutdown();
    }
    hub.shutdown();

    println!("\n=== Done ===");
    Ok(())
}
