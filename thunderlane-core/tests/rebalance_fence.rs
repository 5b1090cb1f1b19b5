//! Lanes racing a rebalance must never run while partitions move.

#![allow(missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;

use thunderlane_core::events::names;
use thunderlane_core::topology::{ComputeNode, GridShape, PartitionRequest, PartitionStrategy, TopologySpec};
use thunderlane_core::{ThunderLane, ThunderlaneConfig};
use tokio::sync::broadcast::error::TryRecvError;

const REBALANCES: usize = 40;
const RACER_ROUNDS: usize = 300;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resumes_never_land_inside_a_rebalance() {
    let mut config = ThunderlaneConfig::default();
    config.events.capacity = 65_536;
    let plane = Arc::new(ThunderLane::new(config).unwrap());

    let topology = plane
        .topologies()
        .create(TopologySpec::rectangular("fence", GridShape::new(4, 4, 4)))
        .unwrap();
    plane
        .topologies()
        .partition(topology, PartitionStrategy::Grid3d, &PartitionRequest::with_count(4))
        .unwrap();
    plane
        .topologies()
        .distribute(
            topology,
            vec![
                ComputeNode::new("node-a", "10.0.0.1:7000"),
                ComputeNode::new("node-b", "10.0.0.2:7000"),
            ],
        )
        .await
        .unwrap();
    let lanes = plane.bring_up_lanes(topology).await.unwrap();
    let mut events = plane.subscribe();

    // each racer toggles its lane with the coordinator lock released in between
    let racers: Vec<_> = lanes
        .iter()
        .map(|lane| {
            let plane = Arc::clone(&plane);
            let id = lane.id;
            tokio::spawn(async move {
                let coordinator = plane.lanes().coordinator(id).unwrap();
                let mut refused = 0usize;
                for _ in 0..RACER_ROUNDS {
                    let _ = coordinator.lock().await.pause().await;
                    tokio::task::yield_now().await;
                    if coordinator.lock().await.resume().await.is_err() {
                        refused += 1;
                    }
                    tokio::task::yield_now().await;
                }
                refused
            })
        })
        .collect();

    for _ in 0..REBALANCES {
        plane.rebalance(topology).await.unwrap();
        tokio::task::yield_now().await;
    }
    for racer in racers {
        racer.await.unwrap();
    }

    let mut active: HashMap<String, bool> =
        lanes.iter().map(|lane| (lane.id.to_string(), true)).collect();
    let mut rebalanced = 0;
    loop {
        let event = match events.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Empty) => break,
            Err(err) => panic!("event stream broken: {err}"),
        };
        match event.name.as_str() {
            names::LANE_PAUSED => {
                active.insert(event.entity_id, false);
            }
            names::LANE_RESUMED => {
                active.insert(event.entity_id, true);
            }
            names::TOPOLOGY_REBALANCED => {
                rebalanced += 1;
                let running: Vec<_> = active.iter().filter(|(_, on)| **on).collect();
                assert!(running.is_empty(), "lanes running during handoff: {running:?}");
            }
            _ => {}
        }
    }
    assert_eq!(rebalanced, REBALANCES);
}
