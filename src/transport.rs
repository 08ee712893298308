//! # External Seams
//!
//! The shuffle core never talks to a network, a file store, or a launcher
//! directly. It consumes three capability traits: a byte transport between
//! ranks, the bulk-synchronous group runtime, and the downstream indexed
//! store on the receive side. Any implementation of these seams works; the
//! in-process mesh used by the test suite lives in `test_support`.

use anyhow::Result;

/// Inbound delivery callback: `(src_rank, dst_rank, frame_bytes)`.
pub type DeliverFn = dyn Fn(u32, u32, &[u8]) -> Result<()> + Send + Sync;

/// Best-effort byte transport between ranks. Implementations may batch;
/// frames between one (source, destination) pair must arrive in the order
/// they were enqueued.
pub trait Transport: Send + Sync {
    /// Queue a frame for a destination rank. The epoch tags the frame for
    /// transports that segregate traffic per bulk-synchronous interval.
    fn enqueue(&self, dst: u32, bytes: &[u8], epoch: u32) -> Result<()>;

    /// Drain frames destined for this rank up to a barrier point.
    fn flush_local(&self) -> Result<()>;

    /// Drain frames queued for remote ranks up to a barrier point.
    fn flush_remote(&self) -> Result<()>;

    /// Install the inbound delivery callback. Called once at engine init;
    /// the transport invokes it from its delivery context for every frame.
    fn register_deliver(&self, deliver: Box<DeliverFn>);
}

/// The bulk-synchronous process group the simulation already runs under.
pub trait GroupRuntime: Send + Sync {
    /// Collective barrier across all ranks.
    fn barrier(&self) -> Result<()>;

    /// Sum a scalar across all ranks, returning the total to every rank.
    fn allreduce_sum(&self, value: u64) -> Result<u64>;

    /// Collectively abort the process group. Partitioning state is global:
    /// there is no partial-failure mode, either everyone continues or
    /// everyone stops.
    fn abort(&self, reason: &str);
}

/// The range-partitioned indexed store on the receive side.
pub trait ParticleStore: Send + Sync {
    /// Persist a delivered particle. A failure here is collective-fatal:
    /// stored-data integrity can no longer be verified.
    fn foreign_write(&self, id: &[u8], payload: &[u8], epoch: u32) -> Result<()>;
}
