use sr_optimizer::*;
use tracing_subscriber::EnvFilter;

/// Toy training run: a noisy bowl with its optimum near lr=1e-3, momentum=0.9.
fn train(params: &ParameterSet, ctx: &TrialContext<'_>) -> anyhow::Result<Metrics> {
    let lr = params["lr"].as_f64().unwrap_or(1e-2);
    let momentum = params["momentum"].as_f64().unwrap_or(0.0);
    let layers = params["layers"].as_i64().unwrap_or(1) as f64;
    let activation_bonus = match params["activation"].as_str() {
        Some("gelu") => 0.05,
        _ => 0.0,
    };

    let lr_term = (lr.log10() + 3.0).powi(2);
    let momentum_term = (momentum - 0.9).powi(2) * 4.0;
    let depth_term = (layers - 4.0).powi(2) * 0.01;
    let accuracy = (1.0 - 0.1 * lr_term - momentum_term - depth_term + activation_bonus).max(0.0);

    tracing::debug!(
        trial = ctx.trial_name,
        devices = %ctx.allocation.visible_devices(),
        accuracy,
        "Evaluated configuration"
    );
    Ok(Metrics::from([
        ("average_res".to_string(), accuracy),
        ("lr_term".to_string(), lr_term),
    ]))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("SpaceRay quickstart");

    let space = parse_bounds(
        r#"{
            "lr": [1e-5, 1e-1, "log-uniform"],
            "momentum": [0.5, 0.99],
            "layers": [1, 8],
            "activation": ["relu", "tanh", "gelu"]
        }"#,
    )?;

    let output_dir = std::env::temp_dir().join("spaceray-quickstart");
    let config = RunConfig::new("quickstart", &output_dir)
        .with_trials(15)
        .with_initial_points(5)
        .with_num_splits(4)
        .with_resources(WorkerResources::new(1.0, 0.0))
        .with_extra_data(serde_json::json!({ "dataset": "synthetic" }));

    let experiment = Experiment::new(config);
    let report = experiment.run(&space, train).await?;

    println!(
        "Ran {} regions on {} workers ({:?}) in {:.2}s",
        report.dispatched_regions,
        report.parallelism.workers,
        report.parallelism.source,
        report.elapsed.as_secs_f64()
    );
    for chunk in &report.chunks {
        println!(
            "  {}: {} completed, {} failed, status {:?}",
            chunk.worker_id,
            chunk.summary.completed.len(),
            chunk.summary.failed.len(),
            chunk.status
        );
    }

    // Pick the best region from the persisted checkpoints.
    let persister = ResultPersister::new(&output_dir);
    let mut best: Option<(usize, f64)> = None;
    for index in persister.completed_regions()? {
        let checkpoint = persister.load_checkpoint(index)?;
        if let Some(obs) = checkpoint.state.best {
            if best.map_or(true, |(_, value)| obs.value > value) {
                best = Some((index, obs.value));
            }
        }
    }
    if let Some((index, value)) = best {
        println!("Best region: {index} (average_res = {value:.4})");
        println!("Trial table: {}", persister.table_path(index).display());
    }

    Ok(())
}
