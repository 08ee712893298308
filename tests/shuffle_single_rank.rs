//! A single-rank group never negotiates: it runs under the open boundary
//! vector from the start and every write lands in the local store.

use rangeshuffle::test_support::{particle_id, payload_for_prop, LoopbackWorld};
use rangeshuffle::{RangeState, ShuffleConfig};

#[test]
fn single_rank_delivers_everything_locally() {
    let cfg = ShuffleConfig::default();
    let world = LoopbackWorld::new(1, cfg.clone());
    let engine = world.engine(0);

    engine.epoch_start(0).unwrap();
    for i in 0..1000u64 {
        let id = particle_id(&cfg, 0, i);
        let payload = payload_for_prop(&cfg, i as f32 / 1000.0);
        engine.write(&id, &payload, 0).unwrap();
    }
    engine.epoch_end().unwrap();

    let stats = engine.stats();
    assert_eq!(stats.writes, 1000);
    assert_eq!(stats.local_writes, 1000);
    assert_eq!(stats.remote_writes, 0);
    assert_eq!(stats.reneg_rounds, 0, "no renegotiation may ever trigger");
    assert_eq!(engine.round_no(), 0);
    assert_eq!(engine.oob_depth(), 0);
    assert_eq!(engine.range_state(), RangeState::Ready);

    let records = world.store_records(0);
    assert_eq!(records.len(), 1000);
    assert!(records.iter().all(|r| r.epoch == 0));
    assert!(!world.is_aborted());

    world.finalize_all().unwrap();
}

#[test]
fn single_rank_force_rpc_routes_through_the_transport() {
    let cfg = ShuffleConfig::default().with_force_rpc(true);
    let world = LoopbackWorld::new(1, cfg.clone());
    let engine = world.engine(0);

    engine.epoch_start(0).unwrap();
    for i in 0..50u64 {
        let id = particle_id(&cfg, 0, i);
        let payload = payload_for_prop(&cfg, i as f32 / 50.0);
        engine.write(&id, &payload, 0).unwrap();
    }
    engine.epoch_end().unwrap();

    let stats = engine.stats();
    assert_eq!(stats.local_writes, 0);
    assert_eq!(stats.remote_writes, 50);
    assert_eq!(world.store_records(0).len(), 50);

    world.finalize_all().unwrap();
}
