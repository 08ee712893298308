//! Renegotiation-protocol scenarios: simultaneous triggers collapsing into
//! one round, and round/boundary agreement across the group.

use rangeshuffle::test_support::{particle_id, payload_for_prop, uniform_props, LoopbackWorld};
use rangeshuffle::{RangeState, ShuffleConfig};

#[test]
fn simultaneous_triggers_collapse_into_one_round() {
    // tiny buffers so both ranks saturate within a hair of each other
    let cfg = ShuffleConfig::default().with_oob_max(64).with_pivot_count(8);
    let world = LoopbackWorld::new(2, cfg.clone());

    let streams = vec![
        uniform_props(41, 64, 0.0, 1.0),
        uniform_props(43, 64, 0.0, 1.0),
    ];
    std::thread::scope(|scope| {
        for (rank, props) in streams.iter().enumerate() {
            let engine = world.engine(rank as u32);
            let cfg = &cfg;
            scope.spawn(move || {
                engine.epoch_start(0).unwrap();
                for (i, prop) in props.iter().enumerate() {
                    let id = particle_id(cfg, rank as u32, i as u64);
                    engine.write(&id, &payload_for_prop(cfg, *prop), 0).unwrap();
                }
                engine.epoch_end().unwrap();
            });
        }
    });

    // the two concurrent BEGINs must have been absorbed into a single round
    for rank in 0..2 {
        let engine = world.engine(rank);
        assert_eq!(engine.stats().reneg_rounds, 1, "rank {rank}");
        assert_eq!(engine.round_no(), 1, "rank {rank}");
        assert_eq!(engine.range_state(), RangeState::Ready);
        assert_eq!(engine.oob_depth(), 0);
    }

    // both ranks agree on the installed vector
    let b0 = world.engine(0).boundaries().unwrap();
    let b1 = world.engine(1).boundaries().unwrap();
    assert_eq!(b0.as_slice(), b1.as_slice());

    assert_eq!(
        world.store_records(0).len() + world.store_records(1).len(),
        128
    );
    assert!(!world.is_aborted());
    world.finalize_all().unwrap();
}

#[test]
fn interval_trigger_renegotiates_without_saturation() {
    let cfg = ShuffleConfig::default()
        .with_oob_max(4096)
        .with_pivot_count(8)
        .with_reneg_interval(200);
    let world = LoopbackWorld::new(2, cfg.clone());

    let streams = vec![
        uniform_props(61, 300, 0.0, 1.0),
        uniform_props(67, 300, 0.0, 1.0),
    ];
    std::thread::scope(|scope| {
        for (rank, props) in streams.iter().enumerate() {
            let engine = world.engine(rank as u32);
            let cfg = &cfg;
            scope.spawn(move || {
                engine.epoch_start(0).unwrap();
                for (i, prop) in props.iter().enumerate() {
                    let id = particle_id(cfg, rank as u32, i as u64);
                    engine.write(&id, &payload_for_prop(cfg, *prop), 0).unwrap();
                }
                engine.epoch_end().unwrap();
            });
        }
    });

    // the count-based trigger ended the warm-up well before any side filled
    for rank in 0..2 {
        let engine = world.engine(rank);
        assert!(engine.stats().reneg_rounds >= 1, "rank {rank} never left warm-up");
        assert_eq!(engine.oob_depth(), 0);
        assert_eq!(engine.range_state(), RangeState::Ready);
    }
    assert_eq!(
        world.store_records(0).len() + world.store_records(1).len(),
        600
    );
    world.finalize_all().unwrap();
}

#[test]
fn rounds_and_boundaries_agree_across_four_ranks() {
    let cfg = ShuffleConfig::default()
        .with_oob_max(128)
        .with_pivot_count(16);
    let world = LoopbackWorld::new(4, cfg.clone());

    let streams: Vec<Vec<f32>> = (0..4)
        .map(|rank| uniform_props(100 + rank as u64, 1000, 0.0, 1.0))
        .collect();
    std::thread::scope(|scope| {
        for (rank, props) in streams.iter().enumerate() {
            let engine = world.engine(rank as u32);
            let cfg = &cfg;
            scope.spawn(move || {
                engine.epoch_start(0).unwrap();
                for (i, prop) in props.iter().enumerate() {
                    let id = particle_id(cfg, rank as u32, i as u64);
                    engine.write(&id, &payload_for_prop(cfg, *prop), 0).unwrap();
                }
                engine.epoch_end().unwrap();
            });
        }
    });

    let round = world.engine(0).round_no();
    assert!(round >= 1);
    let bounds = world.engine(0).boundaries().unwrap();
    for rank in 1..4 {
        assert_eq!(world.engine(rank).round_no(), round, "rank {rank} round");
        assert_eq!(
            world.engine(rank).boundaries().unwrap().as_slice(),
            bounds.as_slice(),
            "rank {rank} boundaries"
        );
    }

    // quartile boundaries for a uniform workload
    let slice = bounds.as_slice();
    for (i, expected) in [(1usize, 0.25f32), (2, 0.5), (3, 0.75)] {
        assert!(
            (slice[i] - expected).abs() < 0.08,
            "boundary {i} = {}, expected near {expected}",
            slice[i]
        );
    }

    let total: usize = (0..4).map(|r| world.store_records(r).len()).sum();
    assert_eq!(total, 4000);
    assert_eq!((0..4).map(|r| world.engine(r).oob_depth()).sum::<usize>(), 0);
    world.finalize_all().unwrap();
}
