//! # Delivery Dispatcher
//!
//! Demultiplexes inbound frames: data goes straight to the downstream store,
//! renegotiation control goes to the negotiation task's inbox. Data delivery
//! never waits on negotiation progress; the two frame families only share
//! the decode step.

use crate::engine::EngineShared;
use crate::error::ShuffleError;
use crate::frame::{self, Frame};
use crate::reneg::NegMsg;
use crate::stats::ShuffleStats;
use anyhow::Result;
use crossbeam_channel::Sender;
use std::sync::Arc;
use tracing::warn;

/// Inbound frame handler registered with the transport.
pub(crate) struct Dispatcher {
    shared: Arc<EngineShared>,
    neg_tx: Sender<NegMsg>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<EngineShared>, neg_tx: Sender<NegMsg>) -> Self {
        Self { shared, neg_tx }
    }

    /// Handle one delivered frame. Malformed frames and store failures are
    /// collective-fatal; the error also propagates to the transport so its
    /// delivery context can stop.
    pub(crate) fn deliver(&self, src: u32, _dst: u32, bytes: &[u8]) -> Result<()> {
        ShuffleStats::incr(&self.shared.stats.frames_delivered);
        let frame = match frame::decode(&self.shared.cfg, bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(rank = self.shared.rank, src, error = %err, "undecodable frame");
                self.shared.fatal(&err.to_string());
                return Err(err);
            }
        };
        match frame {
            Frame::Data { id, payload } => {
                if let Err(err) =
                    self.shared
                        .store
                        .foreign_write(&id, &payload, self.shared.current_epoch())
                {
                    let err = ShuffleError::Store(err.to_string());
                    self.shared.fatal(&err.to_string());
                    return Err(err.into());
                }
                Ok(())
            }
            Frame::RenegBegin { round, sender } => self.forward(NegMsg::Begin { round, sender }),
            Frame::RenegPivots {
                round,
                width,
                pivots,
            } => self.forward(NegMsg::Pivots {
                src,
                round,
                width,
                pivots,
            }),
        }
    }

    fn forward(&self, msg: NegMsg) -> Result<()> {
        self.neg_tx
            .send(msg)
            .map_err(|_| ShuffleError::Shutdown("negotiation task stopped".to_string()).into())
    }
}
