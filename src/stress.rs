//! Randomised multi-replica workload against an in-memory peer.
//!
//! Every replica edits its own copy of the list while syncing in rounds
//! through a shared [`MemoryPeer`] that drops requests and acknowledgements
//! at random. Once the edits are done the faults stop, and the replicas
//! must all converge on the same list.

use async_stream::stream;
use futures::future::join_all;
use futures::stream::{Stream, StreamExt};
use loam_core::{MemoryStorage, SystemClock};
use loam_log::Placement;
use loam_sync::{Client, ClientConfig, MemoryPeer, SyncConfigBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Statistics collected during a stress run.
#[derive(Clone, Debug)]
pub struct StressStats {
    pub replicas: usize,
    pub ops_per_replica: usize,
    pub sync_rounds: usize,
    pub failed_syncs: usize,
    pub injected_faults: usize,
    pub peer_events: usize,
    pub final_items: usize,
    pub converged: bool,
    pub total_time: Duration,
    pub avg_round_time: Duration,
    pub ops_per_second: f64,
}

impl StressStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Stress Test Statistics                        ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Replicas:                  {:>30} ║", self.replicas);
        println!("║  Operations per Replica:    {:>30} ║", self.ops_per_replica);
        println!("║  Sync Rounds:               {:>30} ║", self.sync_rounds);
        println!("║  Failed Syncs:              {:>30} ║", self.failed_syncs);
        println!("║  Injected Faults:           {:>30} ║", self.injected_faults);
        println!("║  Events on Peer:            {:>30} ║", self.peer_events);
        println!("║  Items after Convergence:   {:>30} ║", self.final_items);
        println!("║  Converged:                 {:>30} ║", self.converged);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Round Time:        {:>28}µs ║", self.avg_round_time.as_micros());
        println!("║  Operations/Second:         {:>30.0} ║", self.ops_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// One random edit. Targets are resolved against the replica's current
/// items when the edit is applied.
#[derive(Clone, Copy, Debug)]
enum Edit {
    Create { tail: bool },
    SetText(usize),
    ToggleCompleted(usize),
    ToggleArchived(usize),
    Move { target: usize, anchor: usize },
    Delete(usize),
}

/// Generator yielding a seeded sequence of edits for one replica.
fn edit_generator(seed: u64, count: usize) -> impl Stream<Item = Edit> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..count {
            let pick = rng.gen_range(0..usize::MAX);
            yield match rng.gen_range(0..100) {
                0..=34 => Edit::Create { tail: rng.gen_bool(0.7) },
                35..=59 => Edit::SetText(pick),
                60..=69 => Edit::ToggleCompleted(pick),
                70..=74 => Edit::ToggleArchived(pick),
                75..=89 => Edit::Move { target: pick, anchor: rng.gen_range(0..usize::MAX) },
                _ => Edit::Delete(pick),
            };
        }
    }
}

fn apply_edit(client: &Client<MemoryPeer>, edit: Edit, counter: usize) -> loam_sync::Result<()> {
    let items = client.items();
    let nth = |pick: usize| items.get(pick % items.len().max(1)).map(|item| item.id.clone());

    match edit {
        Edit::Create { tail } => {
            let placement = if tail { Placement::Tail } else { Placement::Head };
            client.create_item(format!("item {counter}"), placement)?;
        }
        Edit::SetText(pick) => {
            if let Some(id) = nth(pick) {
                client.set_text(&id, format!("edited {counter}"))?;
            }
        }
        Edit::ToggleCompleted(pick) => {
            if let Some(id) = nth(pick) {
                client.toggle_completed(&id)?;
            }
        }
        Edit::ToggleArchived(pick) => {
            if let Some(id) = nth(pick) {
                client.toggle_archived(&id)?;
            }
        }
        Edit::Move { target, anchor } => {
            if let (Some(id), Some(anchor)) = (nth(target), nth(anchor)) {
                if id != anchor {
                    client.move_item(&id, Placement::After(anchor))?;
                }
            }
        }
        Edit::Delete(pick) => {
            if let Some(id) = nth(pick) {
                client.delete_item(&id)?;
            }
        }
    }
    Ok(())
}

fn inject_faults(peer: &MemoryPeer, rng: &mut StdRng) -> usize {
    let mut injected = 0;
    if rng.gen_bool(0.2) {
        peer.fail_next_submits(1, 503);
        injected += 1;
    }
    if rng.gen_bool(0.1) {
        peer.lose_next_submit_responses(1);
        injected += 1;
    }
    if rng.gen_bool(0.1) {
        peer.fail_next_fetches(1, 500);
        injected += 1;
    }
    injected
}

fn open_client(peer: &Arc<MemoryPeer>) -> loam_sync::Result<Client<MemoryPeer>> {
    let config = ClientConfig {
        sync: SyncConfigBuilder::new()
            .page_size(50)
            .base_delay(5)
            .max_delay(100)
            .auto_sync(false)
            .build(),
        ..Default::default()
    };
    Client::open(
        Arc::new(MemoryStorage::new()),
        Arc::new(SystemClock),
        peer.clone(),
        config,
    )
}

/// Sync every replica in turn until a full pass pulls nothing new.
async fn converge(clients: &[Client<MemoryPeer>], max_passes: usize) -> usize {
    let mut failed = 0;
    for pass in 0..max_passes {
        let mut moved = 0;
        for client in clients {
            client.settled().await;
            match client.sync_now().await {
                Ok(report) => moved += report.pushed + report.pulled,
                Err(err) => {
                    tracing::warn!(pass, error = %err, "sync failed while converging");
                    failed += 1;
                    moved += 1;
                }
            }
        }
        if moved == 0 {
            break;
        }
    }
    failed
}

/// Run `replicas` clients through `ops_per_replica` random edits each,
/// syncing every `ops_per_round` edits.
pub async fn stress_test_replicas(
    replicas: usize,
    ops_per_replica: usize,
    ops_per_round: usize,
    seed: u64,
) -> loam_sync::Result<StressStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Replication Stress Test                             ║");
    println!(
        "║  Replicas: {} | Ops/Replica: {} | Ops/Round: {}",
        replicas, ops_per_replica, ops_per_round
    );
    println!("╚════════════════════════════════════════════════════════════╝");

    let replicas = replicas.max(1);
    let start = Instant::now();
    let peer = Arc::new(MemoryPeer::new());
    let clients = (0..replicas)
        .map(|_| open_client(&peer))
        .collect::<loam_sync::Result<Vec<_>>>()?;

    let mut generators: Vec<_> = (0..replicas)
        .map(|idx| Box::pin(edit_generator(seed.wrapping_add(idx as u64), ops_per_replica)))
        .collect();
    let mut rng = StdRng::seed_from_u64(seed);
    let ops_per_round = ops_per_round.max(1);

    println!("\n[Phase 1/2] Editing and syncing with faults...");

    let mut round_times = Vec::new();
    let mut failed_syncs = 0;
    let mut injected_faults = 0;
    let mut applied = 0;
    loop {
        let mut progressed = false;
        for (client, generator) in clients.iter().zip(generators.iter_mut()) {
            for _ in 0..ops_per_round {
                match generator.next().await {
                    Some(edit) => {
                        apply_edit(client, edit, applied)?;
                        applied += 1;
                        progressed = true;
                    }
                    None => break,
                }
            }
        }
        if !progressed {
            break;
        }

        injected_faults += inject_faults(&peer, &mut rng);
        let round_start = Instant::now();
        let results = join_all(clients.iter().map(|client| client.sync_now())).await;
        failed_syncs += results.iter().filter(|result| result.is_err()).count();
        round_times.push(round_start.elapsed());

        if round_times.len() % 10 == 0 {
            println!("  Rounds completed: {}", round_times.len());
        }
    }

    println!("[Phase 1/2] ✓ Completed");
    println!("[Phase 2/2] Converging without faults...");

    failed_syncs += converge(&clients, replicas * 4 + 4).await;

    let reference = clients[0].items();
    let converged = clients.iter().all(|client| *client.items() == *reference);
    if !converged {
        tracing::error!("replicas diverged after convergence passes");
    }

    println!("[Phase 2/2] ✓ Completed");

    let total_time = start.elapsed();
    let avg_round_time = if round_times.is_empty() {
        Duration::ZERO
    } else {
        round_times.iter().sum::<Duration>() / round_times.len() as u32
    };

    Ok(StressStats {
        replicas,
        ops_per_replica,
        sync_rounds: round_times.len(),
        failed_syncs,
        injected_faults,
        peer_events: peer.len(),
        final_items: reference.len(),
        converged,
        total_time,
        avg_round_time,
        ops_per_second: applied as f64 / total_time.as_secs_f64(),
    })
}

/// Repeat the workload with a growing number of replicas.
pub async fn stress_test_scaling(max_replicas: usize, step_size: usize) -> loam_sync::Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Convergence vs Replicas            ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let step_size = step_size.max(1);
    let mut current = step_size;
    while current <= max_replicas {
        stress_test_replicas(current, 100, 20, current as u64).await?.print();
        current += step_size;
    }
    Ok(())
}
