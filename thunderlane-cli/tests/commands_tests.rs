#![allow(missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use thunderlane_cli::commands::{
    BurstOptions, RunOptions, parse_shape, plan_partition, run_burst, run_control_plane,
};
use thunderlane_cli::parse_level;
use thunderlane_core::ThunderlaneConfig;
use thunderlane_core::consensus::RunStatus;
use thunderlane_core::topology::{GridShape, PartitionStrategy};
use tracing::Level;

#[test]
fn shapes_parse_from_extents_or_a_cube_side() {
    assert_eq!(parse_shape("12x8x4").unwrap(), GridShape::new(12, 8, 4));
    assert_eq!(parse_shape("16").unwrap(), GridShape::new(16, 16, 16));
    assert_eq!(parse_shape("2X3X5").unwrap(), GridShape::new(2, 3, 5));
    assert!(parse_shape("12x8").is_err());
    assert!(parse_shape("ax1x1").is_err());
}

#[test]
fn unknown_log_levels_fall_back_to_info() {
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn partition_plan_conserves_cells() {
    let config = ThunderlaneConfig::default();
    for strategy in [
        PartitionStrategy::Grid3d,
        PartitionStrategy::SpatialHash,
        PartitionStrategy::HilbertCurve,
        PartitionStrategy::LoadBalanced,
    ] {
        let plan = plan_partition(&config, GridShape::new(8, 8, 8), strategy, 4).unwrap();
        let cells: u64 = plan.partitions.iter().map(|p| p.cell_count).sum();
        assert_eq!(cells, 512, "{strategy}");
    }
}

#[test]
fn custom_strategy_needs_an_assigner() {
    let config = ThunderlaneConfig::default();
    assert!(plan_partition(&config, GridShape::new(4, 4, 4), PartitionStrategy::Custom, 2).is_err());
}

#[tokio::test]
async fn seeded_burst_is_reproducible() {
    let config = ThunderlaneConfig::default();
    let options = BurstOptions {
        matrix_size: Some(60),
        max_steps: Some(40),
        seed: Some(3),
        lane_health: Some([1.0, 0.5, 0.0]),
        ..BurstOptions::default()
    };
    let first = run_burst(&config, options.clone()).await.unwrap();
    let second = run_burst(&config, options).await.unwrap();
    assert_eq!(first.seed, 3);
    assert_ne!(first.status, RunStatus::Running);
    assert_eq!(first.result, second.result);
    assert_eq!(first.result.unwrap().spin_configuration.len(), 60);
}

#[tokio::test]
async fn oversized_burst_is_rejected() {
    let config = ThunderlaneConfig::default();
    let options = BurstOptions {
        matrix_size: Some(1_000_000),
        ..BurstOptions::default()
    };
    assert!(run_burst(&config, options).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bounded_control_plane_run_stops_cleanly() {
    let mut config = ThunderlaneConfig::default();
    config.consensus.matrix_size = 30;
    config.consensus.seed = Some(1);
    let summary = run_control_plane(
        config,
        RunOptions {
            shape: GridShape::new(8, 8, 8),
            strategy: PartitionStrategy::Grid3d,
            partitions: 8,
            nodes: 2,
            tick: Duration::from_millis(20),
            duration: Some(Duration::from_millis(300)),
            seed: 9,
        },
    )
    .await
    .unwrap();
    assert!(summary.ticks > 0);
    assert!(summary.converged <= summary.bursts);
    assert!(summary.folds <= summary.converged);
    assert_eq!(summary.health.lanes.len(), 3);
}

#[tokio::test]
async fn zero_nodes_is_rejected() {
    let err = run_control_plane(
        ThunderlaneConfig::default(),
        RunOptions {
            shape: GridShape::new(4, 4, 4),
            strategy: PartitionStrategy::Grid3d,
            partitions: 2,
            nodes: 0,
            tick: Duration::from_millis(10),
            duration: Some(Duration::from_millis(10)),
            seed: 0,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("compute node"));
}
