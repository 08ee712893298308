//! Two-rank scenarios: a uniform workload that settles after a single
//! renegotiation, and a fully skewed workload where each rank produces for
//! the other end of the key space.

use rangeshuffle::test_support::{particle_id, payload_for_prop, uniform_props, LoopbackWorld};
use rangeshuffle::{RangeState, ShuffleConfig};

fn drive_epoch(world: &LoopbackWorld, epoch: u32, streams: &[Vec<f32>], cfg: &ShuffleConfig) {
    std::thread::scope(|scope| {
        for (rank, props) in streams.iter().enumerate() {
            let engine = world.engine(rank as u32);
            scope.spawn(move || {
                engine.epoch_start(epoch).unwrap();
                for (i, prop) in props.iter().enumerate() {
                    let id = particle_id(cfg, rank as u32, i as u64);
                    let payload = payload_for_prop(cfg, *prop);
                    engine.write(&id, &payload, epoch).unwrap();
                }
                engine.epoch_end().unwrap();
            });
        }
    });
}

#[test]
fn uniform_load_settles_after_one_renegotiation() {
    let cfg = ShuffleConfig::default()
        .with_oob_max(256)
        .with_pivot_count(32);
    let world = LoopbackWorld::new(2, cfg.clone());

    let streams = vec![
        uniform_props(11, 2000, 0.0, 1.0),
        uniform_props(23, 2000, 0.0, 1.0),
    ];
    drive_epoch(&world, 0, &streams, &cfg);

    for rank in 0..2 {
        let engine = world.engine(rank);
        assert_eq!(
            engine.stats().reneg_rounds,
            1,
            "rank {rank} saw more than the warm-up round"
        );
        assert_eq!(engine.round_no(), 1);
        assert_eq!(engine.oob_depth(), 0, "rank {rank} oob not drained");
        assert_eq!(engine.range_state(), RangeState::Ready);
    }

    // the election only sees the ~512 warm-up samples, so give the split
    // a few standard errors of slack around the true median
    let bounds = world.engine(0).boundaries().unwrap();
    let split = bounds.as_slice()[1];
    assert!(
        (split - 0.5).abs() < 0.08,
        "uniform load should split near the median, got {split}"
    );

    let received0 = world.store_records(0).len();
    let received1 = world.store_records(1).len();
    assert_eq!(received0 + received1, 4000);
    let (lo, hi) = (received0.min(received1), received0.max(received1));
    assert!(
        hi as f64 <= lo as f64 * 1.4,
        "load imbalance: {received0} vs {received1}"
    );

    assert!(!world.is_aborted());
    world.finalize_all().unwrap();
}

#[test]
fn skewed_ranks_swap_nothing_and_stay_balanced() {
    let cfg = ShuffleConfig::default();
    let world = LoopbackWorld::new(2, cfg.clone());

    // each rank produces only for its own end of the key space
    let streams = vec![
        uniform_props(5, 4000, 0.0, 0.1),
        uniform_props(6, 4000, 0.9, 1.0),
    ];

    // warm both ranks up below the saturation point before racing on, so
    // the electing round sees a confident summary from each side
    std::thread::scope(|scope| {
        for (rank, props) in streams.iter().enumerate() {
            let engine = world.engine(rank as u32);
            let cfg = &cfg;
            scope.spawn(move || {
                engine.epoch_start(0).unwrap();
                for (i, prop) in props[..400].iter().enumerate() {
                    let id = particle_id(cfg, rank as u32, i as u64);
                    engine.write(&id, &payload_for_prop(cfg, *prop), 0).unwrap();
                }
            });
        }
    });
    std::thread::scope(|scope| {
        for (rank, props) in streams.iter().enumerate() {
            let engine = world.engine(rank as u32);
            let cfg = &cfg;
            scope.spawn(move || {
                for (i, prop) in props.iter().enumerate().skip(400) {
                    let id = particle_id(cfg, rank as u32, i as u64);
                    engine.write(&id, &payload_for_prop(cfg, *prop), 0).unwrap();
                }
                engine.epoch_end().unwrap();
            });
        }
    });

    let bounds = world.engine(0).boundaries().unwrap();
    let split = bounds.as_slice()[1];
    assert!(
        (split - 0.5).abs() < 0.1,
        "boundary should land in the gap between the clusters, got {split}"
    );
    assert_eq!(world.engine(0).stats().reneg_rounds, 1);
    assert_eq!(world.engine(1).stats().reneg_rounds, 1);

    // with the boundary in the gap, nothing crosses ranks
    let received0 = world.store_records(0);
    let received1 = world.store_records(1);
    assert_eq!(received0.len(), 4000);
    assert_eq!(received1.len(), 4000);
    for record in &received0 {
        assert_eq!(record.id[0], b'0', "rank 0 received a foreign particle");
    }
    for record in &received1 {
        assert_eq!(record.id[0], b'1', "rank 1 received a foreign particle");
    }

    for rank in 0..2 {
        assert_eq!(world.engine(rank).oob_depth(), 0);
    }
    assert!(!world.is_aborted());
    world.finalize_all().unwrap();
}
