//! Offline Sync Demo
//!
//! Two replicas of the same list share one peer. The mobile replica goes
//! offline, keeps editing, and catches up when it reconnects.
//!
//! Run with: cargo run --example offline_sync

use loam_core::{Item, MemoryStorage, SystemClock};
use loam_log::Placement;
use loam_sync::{Client, ClientConfig, MemoryPeer, SyncConfigBuilder};
use std::sync::Arc;

fn open(peer: &Arc<MemoryPeer>) -> loam_sync::Result<Client<MemoryPeer>> {
    let config = ClientConfig {
        sync: SyncConfigBuilder::new().online_debounce(50).build(),
        ..Default::default()
    };
    Client::open(
        Arc::new(MemoryStorage::new()),
        Arc::new(SystemClock),
        peer.clone(),
        config,
    )
}

fn show(name: &str, items: &[Item]) {
    println!("{name}:");
    for item in items {
        let mark = if item.completed { "x" } else { " " };
        println!("  [{mark}] {}", item.text);
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Offline Sync Demo ===\n");

    let peer = Arc::new(MemoryPeer::new());
    let mobile = open(&peer)?;
    let desktop = open(&peer)?;

    // === Phase 1: Both online ===
    println!("=== Phase 1: Both Online ===\n");
    let milk = desktop.create_item("Milk", Placement::Tail)?;
    desktop.create_item("Bread", Placement::Tail)?;
    desktop.settled().await;
    mobile.sync_now().await?;
    show("Mobile", &mobile.items());

    // === Phase 2: Mobile goes offline ===
    println!("=== Phase 2: Mobile Goes Offline ===\n");
    mobile.set_online(false);
    mobile.create_item("Eggs", Placement::Head)?;
    mobile.set_text(&milk, "Oat milk")?;
    mobile.toggle_completed(&milk)?;
    println!(
        "Mobile has {} unpushed events\n",
        mobile.status().unacknowledged
    );

    desktop.create_item("Coffee", Placement::Tail)?;
    desktop.settled().await;
    show("Desktop (online)", &desktop.items());
    show("Mobile (offline)", &mobile.items());

    // === Phase 3: Mobile reconnects ===
    println!("=== Phase 3: Mobile Reconnects ===\n");
    mobile.set_online(true);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    mobile.settled().await;
    desktop.sync_now().await?;

    show("Mobile", &mobile.items());
    show("Desktop", &desktop.items());

    let converged = *mobile.items() == *desktop.items();
    println!("Converged: {converged}");
    println!("Events on peer: {}", peer.len());
    Ok(())
}
