use std::time::Duration;
use anyhow::Context;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::time::Instant;
use throttler::config::loader::AppConfig;
use throttler::observability::{metrics, tracing::init_tracing};
use throttler::{Error, Throttle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("THROTTLER_ENV").unwrap_or_else(|_| "development".to_string());
    let app = AppConfig::load(&env).context("loading configuration")?;
    init_tracing(&app.logging).context("installing tracing subscriber")?;

    let registry = Registry::new();
    metrics::register_metrics(&registry).context("registering metrics")?;

    let started = Instant::now();
    let interval = Duration::from_millis(app.driver.interval_ms);
    let throttle = Throttle::new_async(interval, app.throttle.clone(), move |(), request: usize| async move {
        let elapsed = started.elapsed();
        tracing::info!(request, elapsed_ms = elapsed.as_millis() as u64, "sending request");
        Ok::<_, Error>(elapsed)
    })?;

    let mut calls = Vec::with_capacity(app.driver.calls);
    for request in 0..app.driver.calls {
        match throttle.run(request) {
            Ok(call) => calls.push(call),
            Err(e) if e.is_backpressure() => tracing::warn!(request, "dropped: {}", e),
            Err(e) => return Err(e.into()),
        }
    }

    let completed = futures::future::join_all(calls).await
        .into_iter()
        .collect::<throttler::Result<Vec<_>>>()?;
    tracing::info!(completed = completed.len(), "burst finished");

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    println!("{}", String::from_utf8_lossy(&buffer));
    Ok(())
}
