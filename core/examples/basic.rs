//! Basic monitor usage example
//!
//! Run with `RUST_LOG=monitor_machines=debug` to see the library's own logs.

use monitor_machines::{CallOptions, Monitor, MonitorEvent};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Monitor Basic Example ===\n");

    // Create a monitor with builder API
    let monitor = Monitor::builder()
        .failure_threshold(3)
        .reset_timeout(Duration::from_millis(500))
        .success_threshold(2)
        .resource_delay("payment_api", Duration::from_millis(100))
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build()?;

    monitor.subscribe(|event| match event {
        MonitorEvent::MetricRecorded(metric) => {
            println!("   📈 {} = {:.1}", metric.name, metric.value)
        }
        other => println!("   📣 {}", serde_json::to_string(other).unwrap_or_default()),
    });

    // Simulate successful calls
    println!("--- Successful calls ---");
    for i in 1..=2 {
        match monitor
            .execute_with_circuit_breaker("payment_api", || async move {
                Ok::<_, String>(format!("Payment {}", i))
            })
            .await
        {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ Error: {}", e),
        }
    }
    println!("State: {}\n", monitor.circuit_state("payment_api"));

    // Simulate failures
    println!("--- Simulating failures ---");
    for i in 1..=3 {
        match monitor
            .execute_with_circuit_breaker("payment_api", || async move {
                Err::<String, _>(format!("Payment gateway timeout {}", i))
            })
            .await
        {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ Error: {}", e),
        }
    }
    println!("State: {}\n", monitor.circuit_state("payment_api"));

    // Calls are refused while open; a fallback can stand in
    println!("--- Circuit open ---");
    let result = monitor
        .execute_with_options(
            "payment_api",
            || async { Ok::<_, String>("should not execute".to_string()) },
            CallOptions::new().with_fallback(|ctx| {
                Ok(format!(
                    "queued for later (retry in {:?})",
                    ctx.retry_after.unwrap_or_default()
                ))
            }),
        )
        .await;
    match result {
        Ok(value) => println!("↩ Fallback: {}\n", value),
        Err(e) => println!("✗ Error: {}\n", e),
    }

    // Wait for the reset timeout, then probe
    println!("--- Waiting for reset timeout ---");
    tokio::time::sleep(Duration::from_millis(600)).await;
    for i in 1..=2 {
        match monitor
            .execute_with_circuit_breaker("payment_api", || async move {
                Ok::<_, String>(format!("Recovered payment {}", i))
            })
            .await
        {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ Error: {}", e),
        }
    }
    println!("State: {}\n", monitor.circuit_state("payment_api"));

    // Manual instrumentation
    println!("--- Timers ---");
    let timer = monitor.start_timer("reconcile");
    tokio::time::sleep(Duration::from_millis(30)).await;
    timer.stop()?;

    println!("\n--- Admin ---");
    let admin = monitor.admin();
    admin.force_open("ledger");
    for snapshot in admin.circuits() {
        println!(
            "{}: {} (failures: {}, forced: {})",
            snapshot.name, snapshot.state, snapshot.failure_count, snapshot.forced_open
        );
    }
    admin.reset_all();

    Ok(())
}
