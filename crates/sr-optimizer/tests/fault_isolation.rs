use anyhow::bail;
use sr_optimizer::{
    ChunkStatus, Experiment, FixedDeviceProbe, LocalCluster, Metrics, ObjectiveDirection,
    ParameterSet, ResultPersister, RunConfig, SearchSpace, TrialContext,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

/// Five splittable dimensions: 32 regions.
fn space() -> SearchSpace {
    SearchSpace::new()
        .add_float("x0", -1.0, 1.0)
        .add_float("x1", -1.0, 1.0)
        .add_int("x2", 0, 16)
        .add_log_uniform("x3", 1e-4, 1.0)
        .add_choice("x4", vec!["adam".into(), "sgd".into()])
}

fn objective(p: &ParameterSet, _ctx: &TrialContext<'_>) -> anyhow::Result<Metrics> {
    let x0 = p["x0"].as_f64().unwrap_or_default();
    let x1 = p["x1"].as_f64().unwrap_or_default();
    Ok(Metrics::from([
        ("loss".to_string(), x0 * x0 + x1 * x1),
        ("epochs".to_string(), 1.0),
    ]))
}

fn experiment(config: RunConfig, cluster_gpus: usize) -> Experiment {
    Experiment::new(
        config
            .with_trials(3)
            .with_initial_points(2)
            .with_objective("loss", ObjectiveDirection::Minimize),
    )
    .with_cluster(Arc::new(LocalCluster::new(4, cluster_gpus)))
    .with_probe(Arc::new(FixedDeviceProbe(0)))
}

#[tokio::test]
async fn failing_region_does_not_affect_its_chunk() {
    let dir = TempDir::new().unwrap();
    // 32 regions over 2 workers is 16 per chunk; region 3 sits mid-chunk.
    let config = RunConfig::new("isolation", dir.path()).with_num_splits(2);
    let report = experiment(config, 0)
        .run(&space(), |p: &ParameterSet, ctx: &TrialContext<'_>| -> anyhow::Result<Metrics> {
            if ctx.region_index == 3 && ctx.trial_number == 1 {
                bail!("CUDA out of memory");
            }
            objective(p, ctx)
        })
        .await
        .unwrap();

    assert!(report.all_succeeded());
    assert_eq!(report.failed_regions(), vec![3]);
    assert_eq!(report.completed_regions().len(), 31);

    let persister = ResultPersister::new(dir.path());
    let done = persister.completed_regions().unwrap();
    let expected: BTreeSet<usize> = (0..32).filter(|&i| i != 3).collect();
    assert_eq!(done, expected);
    assert!(!persister.table_path(3).exists());
    assert!(!persister.checkpoint_path(3).exists());
    assert_eq!(persister.resume_offset(32).unwrap(), 3);
}

#[tokio::test]
async fn five_region_chunk_skips_only_the_failing_region() {
    let dir = TempDir::new().unwrap();
    // Resume at 27 leaves regions 27..32 in a single chunk.
    let config = RunConfig::new("chunk", dir.path())
        .with_start_region(27)
        .with_num_splits(1);
    let report = experiment(config, 0)
        .run(&space(), |p: &ParameterSet, ctx: &TrialContext<'_>| -> anyhow::Result<Metrics> {
            if ctx.region_index == 30 {
                return Ok(Metrics::from([("loss".to_string(), f64::INFINITY)]));
            }
            objective(p, ctx)
        })
        .await
        .unwrap();

    assert_eq!(report.chunks.len(), 1);
    assert_eq!(report.chunks[0].region_indices, vec![27, 28, 29, 30, 31]);
    assert_eq!(report.chunks[0].summary.completed, vec![27, 28, 29, 31]);
    assert_eq!(report.chunks[0].summary.failed, vec![30]);

    let persister = ResultPersister::new(dir.path());
    for index in [27, 28, 29, 31] {
        let table = persister.load_table(index).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.headers.contains(&"config/x4".to_string()));
    }
    assert!(!persister.table_path(30).exists());
}

#[tokio::test]
async fn crashed_worker_reports_what_it_left_behind() {
    let dir = TempDir::new().unwrap();
    let config = RunConfig::new("crash", dir.path());
    // Four cluster GPUs: four chunks of eight regions each.
    let report = experiment(config, 4)
        .run(&space(), |p: &ParameterSet, ctx: &TrialContext<'_>| -> anyhow::Result<Metrics> {
            if ctx.region_index == 10 {
                panic!("worker lost");
            }
            objective(p, ctx)
        })
        .await
        .unwrap();

    assert_eq!(report.parallelism.workers, 4);
    assert_eq!(report.failed_chunks().len(), 1);
    let crashed = report.failed_chunks()[0];
    assert_eq!(crashed.chunk_id, 1);
    match &crashed.status {
        ChunkStatus::Failed { unprocessed, .. } => {
            assert_eq!(unprocessed, &(10..16).collect::<Vec<_>>());
        }
        ChunkStatus::Finished => panic!("chunk 1 should have failed"),
    }
    assert_eq!(crashed.summary.completed, vec![8, 9]);

    // Every other chunk ran to completion.
    let persister = ResultPersister::new(dir.path());
    let done = persister.completed_regions().unwrap();
    assert_eq!(done.len(), 32 - 6);
    assert!((0..8).chain(16..32).all(|i| done.contains(&i)));
}

#[tokio::test]
async fn resuming_finishes_an_interrupted_run() {
    let dir = TempDir::new().unwrap();
    let space = SearchSpace::new()
        .add_float("x0", -1.0, 1.0)
        .add_float("x1", -1.0, 1.0)
        .add_int("x2", 0, 4);

    let first = experiment(RunConfig::new("resume", dir.path()).with_num_splits(1), 0);
    first
        .run(&space, |p: &ParameterSet, ctx: &TrialContext<'_>| -> anyhow::Result<Metrics> {
            if ctx.region_index == 5 {
                panic!("preempted");
            }
            objective(p, ctx)
        })
        .await
        .unwrap();

    let offset = first.resume_hint(&space).unwrap();
    assert_eq!(offset, 5);

    let second = experiment(
        RunConfig::new("resume", dir.path())
            .with_start_region(offset)
            .with_num_splits(2),
        0,
    );
    let report = second.run(&space, objective).await.unwrap();
    assert_eq!(report.completed_regions(), vec![5, 6, 7]);
    assert_eq!(second.resume_hint(&space).unwrap(), 8);
}
