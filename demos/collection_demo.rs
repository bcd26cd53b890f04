//! Demonstration of a protocol collecting with the simulated probes.
//!
//! This example shows how to:
//! 1. Build a runtime context and a protocol from the sample document
//! 2. Execute the protocol and watch prompts arrive
//! 3. Halt it and decrypt the batches the file sink wrote
//!
//! Run with: cargo run --example collection_demo

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sensing_runtime::{
    FileSink, ProbeRegistry, Protocol, ProtocolConfig, ProtocolController, RuntimeContext,
    SymmetricEncryption,
};

fn main() {
    println!("Sensing Runtime - Collection Demo");
    println!("=================================");
    println!();

    let batch_dir = std::env::temp_dir().join("sensing-runtime-demo");
    let context = match RuntimeContext::ephemeral("demo-device") {
        Ok(context) => context,
        Err(e) => {
            eprintln!("Error creating runtime context: {e}");
            return;
        }
    };

    let mut config = ProtocolConfig::sample();
    config.commit_interval = Duration::from_secs(5);
    let key = config.encryption_key.clone();

    let protocol = match Protocol::build(
        config,
        &ProbeRegistry::builtin(),
        &context,
        Arc::new(FileSink::new(&batch_dir)),
    ) {
        Ok(protocol) => protocol,
        Err(e) => {
            eprintln!("Error building protocol: {e}");
            return;
        }
    };
    let controller = ProtocolController::new(protocol, context.clone());

    println!("Protocol: {}", controller.protocol().name());
    for probe in controller.protocol().probes() {
        println!("  {} ({})", probe.probe_type(), probe.kind().label());
    }
    println!("Batches: {batch_dir:?}");
    println!();
    println!("Collecting for 15 seconds...");
    println!();

    if let Err(e) = controller.execute_protocol() {
        eprintln!("Error executing protocol: {e}");
        return;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    let prompts = controller.prompts();
    let started = Instant::now();
    while running.load(Ordering::SeqCst) && started.elapsed() < Duration::from_secs(15) {
        if let Ok(prompt) = prompts.recv_timeout(Duration::from_millis(500)) {
            println!("[{}] Prompt #{}", prompt.at.format("%H:%M:%S"), prompt.sequence);
        }
    }

    let status = controller.status();
    println!();
    println!("Pending datums before halt: {}", status.pending);
    for probe in &status.probes {
        println!(
            "  {}: {} stored, {} dropped by rate limit",
            probe.probe_type, probe.stored, probe.dropped_rate_limit
        );
    }

    if let Err(e) = controller.halt_protocol() {
        eprintln!("Error halting protocol: {e}");
        return;
    }

    println!();
    println!("{}", context.stats().summary());
    println!();

    // Decrypt what the sink wrote
    let cipher = SymmetricEncryption::new(&key);
    let Ok(entries) = std::fs::read_dir(&batch_dir) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let Ok(data) = std::fs::read(&path) else {
            continue;
        };
        match cipher.decrypt_to_string(&data) {
            Ok(json) => {
                let count = serde_json::from_str::<Vec<serde_json::Value>>(&json)
                    .map(|datums| datums.len())
                    .unwrap_or(0);
                println!("{:?}: {count} datums", path.file_name().unwrap_or_default());
            }
            Err(_) => println!("{:?}: not from this run", path.file_name().unwrap_or_default()),
        }
    }
}
