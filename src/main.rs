use std::env;
use stress::{stress_test_replicas, stress_test_scaling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod stress;

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOAM_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "loam=debug,info"
        } else {
            "loam=info,warn"
        })
    });

    let format = env::var("LOAM_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            REPLICATION STRESS TESTS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let seed = env::var("LOAM_SEED")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as u64);
    tracing::info!(seed, "starting stress run");

    let runs = [(3, 100, 10), (5, 300, 25), (8, 600, 50)];
    let mut diverged = 0;
    for (replicas, ops, per_round) in runs {
        let stats = stress_test_replicas(replicas, ops, per_round, seed).await?;
        stats.print();
        if !stats.converged {
            diverged += 1;
        }
    }

    stress_test_scaling(12, 4).await?;

    if diverged > 0 {
        return Err(format!("{diverged} run(s) failed to converge (seed {seed})").into());
    }
    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
