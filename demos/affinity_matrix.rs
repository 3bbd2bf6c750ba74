//! Affinity matrix example demonstrating trueno-affinity usage
//!
//! Run with: cargo run --example affinity_matrix
//! Verbose: RUST_LOG=trueno_affinity=debug cargo run --example affinity_matrix

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use trueno_affinity::{BuildOptions, EmulatedDevice, SharedDevice, SparseMatrix};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("🦀 trueno-affinity Example\n");

    let emulated = Arc::new(EmulatedDevice::new());
    let device: SharedDevice = emulated.clone();

    // 1. Affinities between 5 line segments seen in two views
    println!("📊 Building affinity matrix...");
    let affinities = [
        (0, 3, 0.9), // segment 0 ↔ segment 3
        (3, 0, 0.9),
        (1, 4, 0.6),
        (4, 1, 0.6),
        (1, 3, 0.2), // weak competing match
        (3, 1, 0.2),
    ];

    let rows = SparseMatrix::from_edges(
        Arc::clone(&device),
        affinities,
        5,
        BuildOptions::default().with_normalization(0.9),
    )?;

    println!(
        "  ✅ Matrix built: {} keys, {} entries, resident: {}\n",
        rows.dimension(),
        rows.num_entries(),
        rows.is_on_device()
    );

    // 2. Query per-segment neighborhoods
    println!("🔍 Row-sorted view...");
    for key in 0..5 {
        let neighbors: Vec<_> = rows
            .entries_for(key)
            .iter()
            .map(|e| format!("{}:{:.2}", e.col, e.weight))
            .collect();
        println!(
            "  segment {key} (start {:?}): {}",
            rows.start_index(key),
            neighbors.join(", ")
        );
    }

    // 3. Column-sorted copy for the reverse pass
    println!("\n🔄 Column-sorted view...");
    let cols = rows.resorted()?;
    for key in cols.keys() {
        let sources: Vec<_> = cols.entries_for(key).iter().map(|e| e.row).collect();
        println!("  segment {key} ← {sources:?}");
    }

    if let Some(entries) = cols.entries() {
        println!(
            "\n  Device layout: ptr {:?}, pitch {} bytes, stride {} entries",
            entries.device_ptr(),
            entries.device_pitch(),
            entries.device_stride()
        );
    }
    println!(
        "  Emulated device: {} allocations, {} bytes\n",
        emulated.allocation_count(),
        emulated.allocated_bytes()
    );

    // 4. Persist and reload
    println!("💾 Saving to Parquet...");
    let dir = std::env::temp_dir().join("trueno_affinity_demo");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("affinity");
    rows.write_parquet(&path).await?;
    println!("  ✅ Saved to {}_*.parquet\n", path.display());

    println!("📂 Loading from Parquet...");
    let loaded = SparseMatrix::read_parquet(device, &path).await?;
    println!(
        "  ✅ Loaded: {} entries, row-sorted: {}\n",
        loaded.num_entries(),
        loaded.is_row_sorted()
    );

    println!("🎉 Example complete!");
    Ok(())
}
