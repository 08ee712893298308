//! # Test Support
//!
//! An in-process world of N ranks wired together over a loopback mesh: one
//! delivery thread per rank, a shared-memory group runtime, and a capturing
//! store. Used by the unit tests and the integration scenarios; none of it
//! is reachable from production wiring.

use crate::config::ShuffleConfig;
use crate::engine::ShuffleEngine;
use crate::transport::{DeliverFn, GroupRuntime, ParticleStore, Transport};
use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A payload of the configured size whose extracted property equals `prop`:
/// the momentum triple is `(prop, 0, 0)`.
pub fn payload_for_prop(cfg: &ShuffleConfig, prop: f32) -> Vec<u8> {
    let mut payload = vec![0u8; cfg.payload_size];
    payload[cfg.prop_offset..cfg.prop_offset + 4].copy_from_slice(&prop.to_le_bytes());
    payload
}

/// A fixed-width id for the n-th particle of a rank.
pub fn particle_id(cfg: &ShuffleConfig, rank: u32, n: u64) -> Vec<u8> {
    let mut id = format!("{rank}.{n}").into_bytes();
    id.resize(cfg.id_size, b'_');
    id.truncate(cfg.id_size);
    id
}

/// Seeded uniform properties in `[lo, hi)`.
pub fn uniform_props(seed: u64, count: usize, lo: f32, hi: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| rng.random_range(lo..hi)).collect()
}

/// One particle as the capturing store received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
    pub epoch: u32,
}

/// Store stub that records every foreign write in arrival order.
#[derive(Debug, Default)]
pub struct CapturingStore {
    records: Mutex<Vec<StoredRecord>>,
    fail_writes: AtomicBool,
}

impl CapturingStore {
    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Make every subsequent write fail, to exercise the fatal store path.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }
}

impl ParticleStore for CapturingStore {
    fn foreign_write(&self, id: &[u8], payload: &[u8], epoch: u32) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            anyhow::bail!("store rejected write");
        }
        self.records.lock().push(StoredRecord {
            id: id.to_vec(),
            payload: payload.to_vec(),
            epoch,
        });
        Ok(())
    }
}

struct Envelope {
    src: u32,
    dst: u32,
    bytes: Vec<u8>,
}

/// Shared spine of the loopback mesh: one inbox per rank plus an in-flight
/// counter the flush calls drain against.
struct MeshInner {
    inboxes: Vec<Sender<Envelope>>,
    in_flight: Mutex<usize>,
    quiesced: Condvar,
}

impl MeshInner {
    fn send(&self, envelope: Envelope) -> Result<()> {
        *self.in_flight.lock() += 1;
        if self.inboxes[envelope.dst as usize].send(envelope).is_err() {
            let mut count = self.in_flight.lock();
            *count -= 1;
            anyhow::bail!("loopback inbox closed");
        }
        Ok(())
    }

    fn mark_handled(&self) {
        let mut count = self.in_flight.lock();
        *count -= 1;
        if *count == 0 {
            self.quiesced.notify_all();
        }
    }

    fn wait_quiesced(&self) {
        let mut count = self.in_flight.lock();
        while *count > 0 {
            self.quiesced.wait(&mut count);
        }
    }
}

/// One frame as this rank's transport accepted it. Lets tests assert on the
/// epoch tag the engine handed down with each enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentFrame {
    pub dst: u32,
    pub tag: u8,
    pub epoch: u32,
}

/// Per-rank handle onto the mesh. Frames between one (source, destination)
/// pair arrive in enqueue order; both flush calls wait for full mesh
/// quiescence, which is a stronger guarantee than the production transport
/// needs to give.
pub struct LoopbackTransport {
    mesh: Arc<MeshInner>,
    rank: u32,
    inbox: Mutex<Option<Receiver<Envelope>>>,
    sent: Mutex<Vec<SentFrame>>,
}

impl LoopbackTransport {
    /// Push a raw frame into a rank's inbox, bypassing any engine. Lets
    /// tests inject malformed traffic.
    pub fn inject(&self, src: u32, dst: u32, bytes: &[u8]) -> Result<()> {
        self.mesh.send(Envelope {
            src,
            dst,
            bytes: bytes.to_vec(),
        })
    }

    /// Every frame this rank has enqueued, in order.
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.sent.lock().clone()
    }
}

impl Transport for LoopbackTransport {
    fn enqueue(&self, dst: u32, bytes: &[u8], epoch: u32) -> Result<()> {
        self.sent.lock().push(SentFrame {
            dst,
            tag: bytes.first().copied().unwrap_or(0),
            epoch,
        });
        self.mesh.send(Envelope {
            src: self.rank,
            dst,
            bytes: bytes.to_vec(),
        })
    }

    fn flush_local(&self) -> Result<()> {
        self.mesh.wait_quiesced();
        Ok(())
    }

    fn flush_remote(&self) -> Result<()> {
        self.mesh.wait_quiesced();
        Ok(())
    }

    fn register_deliver(&self, deliver: Box<DeliverFn>) {
        let inbox = self
            .inbox
            .lock()
            .take()
            .expect("deliver callback registered twice");
        let mesh = self.mesh.clone();
        let rank = self.rank;
        std::thread::Builder::new()
            .name(format!("deliver-{rank}"))
            .spawn(move || {
                for envelope in inbox.iter() {
                    let outcome = deliver(envelope.src, envelope.dst, &envelope.bytes);
                    mesh.mark_handled();
                    if outcome.is_err() {
                        // the group is aborting: swallow the backlog so
                        // flush calls still quiesce
                        for skipped in inbox.iter() {
                            drop(skipped);
                            mesh.mark_handled();
                        }
                        break;
                    }
                }
            })
            .expect("spawning delivery thread");
    }
}

struct CollectiveState {
    sum: u64,
    arrived: usize,
    generation: u64,
    result: u64,
}

/// Shared-memory stand-in for the bulk-synchronous group runtime.
pub struct LoopbackGroup {
    nranks: usize,
    barrier: std::sync::Barrier,
    collective: Mutex<CollectiveState>,
    collective_done: Condvar,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
}

impl LoopbackGroup {
    fn new(nranks: usize) -> Self {
        Self {
            nranks,
            barrier: std::sync::Barrier::new(nranks),
            collective: Mutex::new(CollectiveState {
                sum: 0,
                arrived: 0,
                generation: 0,
                result: 0,
            }),
            collective_done: Condvar::new(),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().clone()
    }
}

impl GroupRuntime for LoopbackGroup {
    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }

    fn allreduce_sum(&self, value: u64) -> Result<u64> {
        let mut state = self.collective.lock();
        let generation = state.generation;
        state.sum += value;
        state.arrived += 1;
        if state.arrived == self.nranks {
            state.result = state.sum;
            state.sum = 0;
            state.arrived = 0;
            state.generation += 1;
            self.collective_done.notify_all();
        } else {
            while state.generation == generation {
                self.collective_done.wait(&mut state);
            }
        }
        Ok(state.result)
    }

    fn abort(&self, reason: &str) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            *self.abort_reason.lock() = Some(reason.to_string());
        }
    }
}

/// N fully wired ranks sharing a loopback mesh and one group runtime.
pub struct LoopbackWorld {
    engines: Vec<ShuffleEngine>,
    transports: Vec<Arc<LoopbackTransport>>,
    group: Arc<LoopbackGroup>,
    stores: Vec<Arc<CapturingStore>>,
}

impl LoopbackWorld {
    /// Build a world of `nranks` engines under one configuration.
    pub fn new(nranks: u32, cfg: ShuffleConfig) -> Self {
        let mut inboxes = Vec::with_capacity(nranks as usize);
        let mut receivers = Vec::with_capacity(nranks as usize);
        for _ in 0..nranks {
            let (tx, rx) = unbounded();
            inboxes.push(tx);
            receivers.push(rx);
        }
        let mesh = Arc::new(MeshInner {
            inboxes,
            in_flight: Mutex::new(0),
            quiesced: Condvar::new(),
        });
        let group = Arc::new(LoopbackGroup::new(nranks as usize));

        let mut transports = Vec::with_capacity(nranks as usize);
        let mut stores = Vec::with_capacity(nranks as usize);
        let mut engines = Vec::with_capacity(nranks as usize);
        for (rank, inbox) in receivers.into_iter().enumerate() {
            let transport = Arc::new(LoopbackTransport {
                mesh: mesh.clone(),
                rank: rank as u32,
                inbox: Mutex::new(Some(inbox)),
                sent: Mutex::new(Vec::new()),
            });
            let store = Arc::new(CapturingStore::default());
            let engine = ShuffleEngine::new(
                cfg.clone(),
                rank as u32,
                nranks,
                transport.clone(),
                group.clone(),
                store.clone(),
            )
            .expect("engine init");
            transports.push(transport);
            stores.push(store);
            engines.push(engine);
        }
        Self {
            engines,
            transports,
            group,
            stores,
        }
    }

    pub fn engine(&self, rank: u32) -> &ShuffleEngine {
        &self.engines[rank as usize]
    }

    pub fn transport(&self, rank: u32) -> Arc<LoopbackTransport> {
        self.transports[rank as usize].clone()
    }

    pub fn group(&self, _rank: u32) -> Arc<LoopbackGroup> {
        self.group.clone()
    }

    pub fn store(&self, rank: u32) -> Arc<CapturingStore> {
        self.stores[rank as usize].clone()
    }

    pub fn store_records(&self, rank: u32) -> Vec<StoredRecord> {
        self.stores[rank as usize].records()
    }

    pub fn is_aborted(&self) -> bool {
        self.group.is_aborted()
    }

    /// Wait until every in-flight frame on the mesh has been dispatched.
    pub fn settle(&self) {
        self.transports[0].mesh.wait_quiesced();
    }

    /// Finalize every engine collectively, one thread per rank.
    pub fn finalize_all(self) -> Result<()> {
        let engines = self.engines;
        let mut failures = Vec::new();
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for engine in engines {
                handles.push(scope.spawn(move || engine.finalize()));
            }
            for handle in handles {
                if let Err(err) = handle.join().expect("finalize thread panicked") {
                    failures.push(err);
                }
            }
        });
        match failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capturing_store_records_in_order() {
        let store = CapturingStore::default();
        store.foreign_write(b"a", &[1], 0).unwrap();
        store.foreign_write(b"b", &[2], 0).unwrap();
        let records = store.records();
        assert_eq!(records[0].id, b"a");
        assert_eq!(records[1].id, b"b");
    }

    #[test]
    fn group_allreduce_sums_across_ranks() {
        let group = Arc::new(LoopbackGroup::new(3));
        let mut totals = Vec::new();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..3u64)
                .map(|value| {
                    let group = group.clone();
                    scope.spawn(move || group.allreduce_sum(value + 1).unwrap())
                })
                .collect();
            for handle in handles {
                totals.push(handle.join().unwrap());
            }
        });
        assert_eq!(totals, vec![6, 6, 6]);
    }

    #[test]
    fn abort_keeps_first_reason() {
        let group = LoopbackGroup::new(2);
        group.abort("first");
        group.abort("second");
        assert!(group.is_aborted());
        assert_eq!(group.abort_reason().as_deref(), Some("first"));
    }

    #[test]
    fn uniform_props_are_seeded() {
        assert_eq!(uniform_props(7, 5, 0.0, 1.0), uniform_props(7, 5, 0.0, 1.0));
        assert!(uniform_props(7, 100, 0.2, 0.4)
            .iter()
            .all(|p| (0.2..0.4).contains(p)));
    }
}
