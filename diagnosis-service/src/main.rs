use anyhow::Context;
use diagnosis_flow::{CoordinatorConfig, ServiceHealth};
use diagnosis_service::{ServiceEndpoints, build_coordinator, read_request};
use std::io::Read;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured JSON tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "diagnosis_service=info,diagnosis_flow=info".into());

    match log_format.as_str() {
        "pretty" => {
            // Human-readable logging for development
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let raw = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading diagnosis request from {path}"))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("reading diagnosis request from stdin")?;
            buffer
        }
    };
    let request = read_request(&raw).context("parsing diagnosis request")?;

    let endpoints = ServiceEndpoints::from_env();
    let config = CoordinatorConfig::from_env();
    info!(
        deadline_ms = config.overall_deadline.as_millis() as u64,
        max_parallel_calls = config.max_parallel_calls,
        "Diagnosis service starting"
    );
    let coordinator = build_coordinator(&endpoints, config)?;

    for (collaborator, health) in coordinator.check_services_health().await {
        match health {
            ServiceHealth::Healthy => info!(collaborator = %collaborator, "Collaborator healthy"),
            ServiceHealth::Unhealthy => warn!(
                collaborator = %collaborator,
                url = endpoints.url(collaborator),
                "Collaborator unhealthy"
            ),
        }
    }

    let result = coordinator.coordinate_diagnosis(&request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
