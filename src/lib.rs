//! # Rangeshuffle
//!
//! An in-situ, range-partitioned particle shuffler for bulk-synchronous
//! simulations. Each of N worker ranks produces a stream of fixed-layout
//! particle records per epoch; the shuffler routes every record to the peer
//! that owns the value range containing the record's indexed property, so
//! the downstream store can serve point and range queries over it.
//!
//! The crate is the range-partitioning core only: sampling the per-rank
//! property distribution, electing global range boundaries mid-epoch while
//! writes continue, parking out-of-bounds particles in bounded buffers, and
//! routing in-range particles to the right peer. The RPC transport, the
//! process group runtime, and the indexed file store are consumed through
//! the capability traits in [`transport`].
//!
//! ```no_run
//! use rangeshuffle::{ShuffleConfig, ShuffleEngine};
//! # fn wire() -> (std::sync::Arc<dyn rangeshuffle::Transport>,
//! #               std::sync::Arc<dyn rangeshuffle::GroupRuntime>,
//! #               std::sync::Arc<dyn rangeshuffle::ParticleStore>) { unimplemented!() }
//! # fn main() -> anyhow::Result<()> {
//! let (transport, group, store) = wire();
//! let engine = ShuffleEngine::new(ShuffleConfig::default(), 0, 4, transport, group, store)?;
//! engine.epoch_start(0)?;
//! engine.write(b"p0000001", &[0u8; 40], 0)?;
//! engine.epoch_end()?;
//! engine.finalize()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod dispatch;
pub mod engine;
pub mod error;
pub mod frame;
pub mod oob;
pub mod pivots;
pub mod record;
pub mod reneg;
pub mod router;
pub mod stats;
pub mod test_support;
pub mod transport;

pub use config::ShuffleConfig;
pub use engine::{RangeState, ShuffleEngine};
pub use error::ShuffleError;
pub use record::ParticleRecord;
pub use router::BoundaryVector;
pub use stats::StatsSnapshot;
pub use transport::{GroupRuntime, ParticleStore, Transport};
