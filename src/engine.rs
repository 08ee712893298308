//! # Shuffle Engine
//!
//! The foreground write path and the shared range state it negotiates over.
//! A write is classified against the current boundary vector under one
//! mutex: in-range records route to their owner rank, out-of-range records
//! park in the bounded OOB buffer, and a side filling up blocks the writer
//! and kicks the negotiation task. Boundary installs happen on that task;
//! writers observe them through the state word and the condition variable.
//!
//! ```text
//! write ──► classify ──┬─► route ──► transport / local store
//!        (state_mu)    └─► oob park ──► saturation ──► RENEG ──► flush
//! ```

use crate::config::ShuffleConfig;
use crate::dispatch::Dispatcher;
use crate::error::ShuffleError;
use crate::frame;
use crate::oob::OobBuffer;
use crate::record::ParticleRecord;
use crate::reneg::{NegMsg, Negotiator, TriggerReason};
use crate::router::{mask_receiver, BoundaryVector};
use crate::stats::{ShuffleStats, StatsSnapshot};
use crate::transport::{GroupRuntime, ParticleStore, Transport};
use anyhow::Result;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of the negotiated range on one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeState {
    /// No boundaries yet; every write parks in the warm-up buffer.
    Init,
    /// Boundaries installed; writes classify normally.
    Ready,
    /// An OOB side is full; foreground writers wait.
    Blocked,
    /// A negotiation round is in progress; new writes park out-of-bounds.
    Reneg,
}

/// Mutable routing state, guarded by the engine's single state mutex.
pub(crate) struct RangeShared {
    pub state: RangeState,
    pub boundaries: Option<Arc<BoundaryVector>>,
    /// Round of the currently installed boundaries. Monotone.
    pub round_no: u32,
    pub oob: OobBuffer,
    /// Properties of writes accepted in-range this epoch.
    pub samples: Vec<f32>,
    pub writes_since_reneg: u64,
    /// Set on fatal failure; wakes and fails every waiter.
    pub aborted: bool,
}

/// State shared between the write path, the negotiation task, and the
/// delivery dispatcher.
pub(crate) struct EngineShared {
    pub cfg: ShuffleConfig,
    pub rank: u32,
    pub nranks: u32,
    pub state_mu: Mutex<RangeShared>,
    pub state_cv: Condvar,
    pub transport: Arc<dyn Transport>,
    pub group: Arc<dyn GroupRuntime>,
    pub store: Arc<dyn ParticleStore>,
    pub stats: ShuffleStats,
    epoch: AtomicU32,
}

impl EngineShared {
    pub(crate) fn current_epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Collective-fatal exit: abort the group and fail every waiter.
    pub(crate) fn fatal(&self, reason: &str) {
        self.group.abort(reason);
        let mut shared = self.state_mu.lock();
        shared.aborted = true;
        self.state_cv.notify_all();
    }

    /// Hand one record to its destination under the given boundary vector.
    /// The epoch is the one the originating write call carried, threaded
    /// through to the transport and the store unchanged.
    fn deliver_routed(
        &self,
        record: &ParticleRecord,
        vector: &BoundaryVector,
        epoch: u32,
    ) -> Result<()> {
        let dst = mask_receiver(vector.route(record.prop), self.cfg.receiver_radix) as u32;
        if dst == self.rank && !self.cfg.force_rpc {
            ShuffleStats::incr(&self.stats.local_writes);
            if let Err(err) = self.store.foreign_write(&record.id, &record.payload, epoch) {
                let err = ShuffleError::Store(err.to_string());
                self.group.abort(&err.to_string());
                return Err(err.into());
            }
            return Ok(());
        }
        ShuffleStats::incr(&self.stats.remote_writes);
        let wire = frame::encode_data(&self.cfg, &record.id, &record.payload);
        self.transport
            .enqueue(dst, &wire, epoch)
            .map_err(|err| ShuffleError::Transport(err.to_string()).into())
    }

    /// Post-install OOB drain: re-route everything under the new vector,
    /// preserving only entries the merged envelope somehow failed to cover.
    /// Each entry flushes under the epoch of the write that parked it.
    /// Returns the preserved count. Caller holds the state lock.
    pub(crate) fn flush_oob_round(
        &self,
        shared: &mut RangeShared,
        vector: &Arc<BoundaryVector>,
    ) -> Result<usize> {
        let vector = vector.clone();
        shared.oob.flush_retaining(|entry| {
            if !vector.contains(entry.record.prop) {
                return Ok(Some(entry));
            }
            self.deliver_routed(&entry.record, &vector, entry.epoch)?;
            Ok(None)
        })
    }

    /// Epoch-end OOB drain: route every remaining entry with the total edge
    /// policy, leaving nothing behind.
    fn flush_oob_total(&self, shared: &mut RangeShared) -> Result<()> {
        let vector = match &shared.boundaries {
            Some(vector) => vector.clone(),
            None => return Ok(()),
        };
        let drained = shared.oob.flush_retaining(|entry| {
            self.deliver_routed(&entry.record, &vector, entry.epoch)?;
            Ok(None)
        })?;
        debug_assert_eq!(drained, 0);
        Ok(())
    }
}

/// The range-partitioning shuffle engine for one rank. One instance per
/// process; every piece of shuffle state lives here, threaded explicitly
/// through the public API.
pub struct ShuffleEngine {
    shared: Arc<EngineShared>,
    neg_tx: Sender<NegMsg>,
    neg_thread: Option<JoinHandle<()>>,
}

impl ShuffleEngine {
    /// Initialise the engine: validate configuration, install the delivery
    /// dispatcher, and start the negotiation task. A single-rank group
    /// starts `READY` under an open boundary vector; everyone else starts in
    /// `INIT` warm-up.
    pub fn new(
        cfg: ShuffleConfig,
        rank: u32,
        nranks: u32,
        transport: Arc<dyn Transport>,
        group: Arc<dyn GroupRuntime>,
        store: Arc<dyn ParticleStore>,
    ) -> Result<Self> {
        cfg.validate()?;
        if nranks == 0 || rank >= nranks {
            return Err(
                ShuffleError::config(format!("rank {rank} outside group of {nranks}")).into(),
            );
        }

        let single = nranks == 1;
        let mut oob = OobBuffer::new(cfg.oob_max);
        let boundaries = if single {
            let vector = BoundaryVector::open(1);
            let (min, max) = vector.envelope();
            oob.set_range(min, max);
            Some(Arc::new(vector))
        } else {
            None
        };
        let shared = Arc::new(EngineShared {
            cfg,
            rank,
            nranks,
            state_mu: Mutex::new(RangeShared {
                state: if single {
                    RangeState::Ready
                } else {
                    RangeState::Init
                },
                boundaries,
                round_no: 0,
                oob,
                samples: Vec::new(),
                writes_since_reneg: 0,
                aborted: false,
            }),
            state_cv: Condvar::new(),
            transport,
            group,
            store,
            stats: ShuffleStats::default(),
            epoch: AtomicU32::new(0),
        });

        let (neg_tx, neg_rx) = unbounded();
        let dispatcher = Dispatcher::new(shared.clone(), neg_tx.clone());
        shared
            .transport
            .register_deliver(Box::new(move |src, dst, bytes| {
                dispatcher.deliver(src, dst, bytes)
            }));

        let negotiator = Negotiator::new(shared.clone(), neg_rx);
        let neg_thread = std::thread::Builder::new()
            .name(format!("reneg-{rank}"))
            .spawn(move || negotiator.run())
            .map_err(|err| ShuffleError::config(format!("spawning negotiation task: {err}")))?;

        info!(rank, nranks, "shuffle engine ready");
        Ok(Self {
            shared,
            neg_tx,
            neg_thread: Some(neg_thread),
        })
    }

    /// Begin a bulk-synchronous interval: pre-flush deliveries left over
    /// from the previous epoch, reset the per-epoch sample set, and meet the
    /// group barrier so no rank emits traffic before every peer has advanced
    /// its epoch.
    pub fn epoch_start(&self, epoch: u32) -> Result<()> {
        self.shared.epoch.store(epoch, Ordering::Release);
        self.shared.transport.flush_local()?;
        {
            let mut shared = self.shared.state_mu.lock();
            shared.samples.clear();
            shared.writes_since_reneg = 0;
        }
        self.shared.group.barrier()?;
        debug!(rank = self.shared.rank, epoch, "epoch started");
        Ok(())
    }

    /// Accept one particle. Classifies against the current range, parking
    /// out-of-range records; suspends only when an OOB side saturates, until
    /// the resulting renegotiation completes. The epoch argument tags the
    /// record all the way to the transport and the store, and survives
    /// parking: a record flushed rounds later still carries it.
    pub fn write(&self, id: &[u8], payload: &[u8], epoch: u32) -> Result<()> {
        let record = ParticleRecord::from_parts(&self.shared.cfg, id, payload)?;
        ShuffleStats::incr(&self.shared.stats.writes);

        let mut shared = self.shared.state_mu.lock();
        loop {
            if shared.aborted {
                return Err(ShuffleError::Shutdown("group aborted".to_string()).into());
            }
            shared.writes_since_reneg += 1;
            if let Some(interval) = self.shared.cfg.reneg_interval {
                if shared.writes_since_reneg >= interval
                    && matches!(shared.state, RangeState::Init | RangeState::Ready)
                {
                    shared.writes_since_reneg = 0;
                    self.send_trigger(TriggerReason::Interval)?;
                }
            }
            match shared.state {
                RangeState::Blocked => {
                    // an OOB side is full; wait out the round in flight
                    shared.writes_since_reneg -= 1;
                    self.shared.state_cv.wait(&mut shared);
                }
                RangeState::Init | RangeState::Reneg => {
                    return self.park_record(&mut shared, record, epoch);
                }
                RangeState::Ready => {
                    let vector = shared
                        .boundaries
                        .clone()
                        .ok_or_else(|| ShuffleError::protocol("READY without boundaries"))?;
                    if vector.contains(record.prop) {
                        shared.samples.push(record.prop);
                        return self.shared.deliver_routed(&record, &vector, epoch);
                    }
                    return self.park_record(&mut shared, record, epoch);
                }
            }
        }
    }

    /// Park an out-of-range (or warm-up, or mid-round) record. Saturating a
    /// side transitions to `BLOCKED`, triggers a renegotiation, and waits
    /// for the installed boundaries to flush the backlog.
    fn park_record(
        &self,
        shared: &mut parking_lot::MutexGuard<'_, RangeShared>,
        record: ParticleRecord,
        epoch: u32,
    ) -> Result<()> {
        loop {
            let side = shared.oob.side_of(record.prop);
            if !shared.oob.side_full(side) {
                break;
            }
            shared.state = RangeState::Blocked;
            self.send_trigger(TriggerReason::OobSaturated)?;
            self.shared.state_cv.wait(shared);
            if shared.aborted {
                return Err(ShuffleError::Shutdown("group aborted".to_string()).into());
            }
            // boundaries changed: the record may be routable now
            if shared.state == RangeState::Ready {
                let vector = shared
                    .boundaries
                    .clone()
                    .ok_or_else(|| ShuffleError::protocol("READY without boundaries"))?;
                if vector.contains(record.prop) {
                    shared.samples.push(record.prop);
                    return self.shared.deliver_routed(&record, &vector, epoch);
                }
            }
        }
        let side = shared.oob.side_of(record.prop);
        shared.oob.park(record, epoch)?;
        ShuffleStats::incr(&self.shared.stats.oob_parked);
        if shared.oob.side_full(side) {
            shared.state = RangeState::Blocked;
            self.send_trigger(TriggerReason::OobSaturated)?;
            while shared.state != RangeState::Ready && !shared.aborted {
                self.shared.state_cv.wait(shared);
            }
            if shared.aborted {
                return Err(ShuffleError::Shutdown("group aborted".to_string()).into());
            }
        }
        Ok(())
    }

    /// Close the epoch: make sure the rank is `READY` with a drained OOB
    /// buffer, flush the transport, and meet the group barrier. Every data
    /// frame produced this epoch has been handed downstream when this
    /// returns on all ranks.
    pub fn epoch_end(&self) -> Result<()> {
        {
            let mut shared = self.shared.state_mu.lock();
            loop {
                if shared.aborted {
                    return Err(ShuffleError::Shutdown("group aborted".to_string()).into());
                }
                match shared.state {
                    RangeState::Reneg | RangeState::Blocked => {
                        self.shared.state_cv.wait(&mut shared);
                    }
                    RangeState::Init => {
                        if shared.oob.is_empty() {
                            break;
                        }
                        // warm-up never ended: elect boundaries now
                        self.send_trigger(TriggerReason::EpochEnd)?;
                        self.shared.state_cv.wait(&mut shared);
                    }
                    RangeState::Ready => {
                        self.shared.flush_oob_total(&mut shared)?;
                        break;
                    }
                }
            }
        }
        self.shared.transport.flush_local()?;
        self.shared.transport.flush_remote()?;
        self.shared.group.barrier()?;
        // frames from peers sent before their barrier entry are now queued
        // locally; hand them downstream before the epoch closes
        self.shared.transport.flush_local()?;
        debug!(
            rank = self.shared.rank,
            epoch = self.shared.current_epoch(),
            "epoch closed"
        );
        Ok(())
    }

    /// Shut the engine down collectively: drain in-flight traffic, report
    /// aggregate statistics on rank 0, and stop the negotiation task.
    pub fn finalize(mut self) -> Result<()> {
        {
            let mut shared = self.shared.state_mu.lock();
            while matches!(shared.state, RangeState::Reneg | RangeState::Blocked)
                && !shared.aborted
            {
                self.shared.state_cv.wait(&mut shared);
            }
            if !shared.oob.is_empty() {
                warn!(
                    rank = self.shared.rank,
                    entries = shared.oob.len(),
                    "finalizing with undrained oob entries"
                );
                self.shared.flush_oob_total(&mut shared)?;
            }
        }
        self.shared.transport.flush_local()?;
        self.shared.transport.flush_remote()?;
        self.shared.group.barrier()?;
        self.shared.transport.flush_local()?;

        let total_writes = self
            .shared
            .group
            .allreduce_sum(self.shared.stats.writes.load(Ordering::Relaxed))?;
        if self.shared.rank == 0 {
            info!(total_writes, "shuffle finalized");
        }

        let _ = self.neg_tx.send(NegMsg::Shutdown);
        if let Some(handle) = self.neg_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Point-in-time counters for this rank.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// The installed range state, for callers that want to observe progress.
    pub fn range_state(&self) -> RangeState {
        self.shared.state_mu.lock().state
    }

    /// Round number of the currently installed boundaries.
    pub fn round_no(&self) -> u32 {
        self.shared.state_mu.lock().round_no
    }

    /// Entries currently parked out-of-bounds on this rank.
    pub fn oob_depth(&self) -> usize {
        self.shared.state_mu.lock().oob.len()
    }

    /// The installed boundary vector, if any.
    pub fn boundaries(&self) -> Option<Arc<BoundaryVector>> {
        self.shared.state_mu.lock().boundaries.clone()
    }

    fn send_trigger(&self, reason: TriggerReason) -> Result<()> {
        self.neg_tx
            .send(NegMsg::Trigger(reason))
            .map_err(|_| ShuffleError::Shutdown("negotiation task stopped".to_string()).into())
    }
}

impl Drop for ShuffleEngine {
    fn drop(&mut self) {
        // finalize() already joined; anything else is an unwind path
        let _ = self.neg_tx.send(NegMsg::Shutdown);
        if let Some(handle) = self.neg_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{payload_for_prop, LoopbackWorld};

    #[test]
    fn single_rank_starts_ready() {
        let world = LoopbackWorld::new(1, ShuffleConfig::default());
        let engine = world.engine(0);
        assert_eq!(engine.range_state(), RangeState::Ready);
        assert_eq!(engine.round_no(), 0);
    }

    #[test]
    fn multi_rank_starts_in_init() {
        let world = LoopbackWorld::new(2, ShuffleConfig::default());
        assert_eq!(world.engine(0).range_state(), RangeState::Init);
        assert!(world.engine(0).boundaries().is_none());
    }

    #[test]
    fn rejects_out_of_group_rank() {
        let world = LoopbackWorld::new(2, ShuffleConfig::default());
        let result = ShuffleEngine::new(
            ShuffleConfig::default(),
            5,
            2,
            world.transport(0),
            world.group(0),
            world.store(0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn single_rank_write_is_local() {
        let world = LoopbackWorld::new(1, ShuffleConfig::default());
        let engine = world.engine(0);
        engine.epoch_start(0).unwrap();
        let payload = payload_for_prop(&ShuffleConfig::default(), 0.5);
        engine.write(b"p0000001", &payload, 0).unwrap();
        engine.epoch_end().unwrap();
        assert_eq!(engine.stats().local_writes, 1);
        assert_eq!(engine.stats().remote_writes, 0);
        assert_eq!(world.store_records(0).len(), 1);
    }

    #[test]
    fn malformed_write_is_rejected_before_classification() {
        let world = LoopbackWorld::new(1, ShuffleConfig::default());
        let engine = world.engine(0);
        assert!(engine.write(b"bad", &[0u8; 40], 0).is_err());
        assert_eq!(engine.stats().writes, 0);
    }
}
