//! # Renegotiation Protocol
//!
//! Multi-stage distributed election that turns per-rank pivot summaries into
//! a globally agreed boundary vector. Runs on its own task, fed exclusively
//! by messages: local triggers from the write path, `RENEG_BEGIN` and
//! `RENEG_PIVOTS` frames from the delivery dispatcher. The task owns round
//! bookkeeping and the coordinator merge; the foreground only ever observes
//! the outcome through the shared range state.
//!
//! Stages: a triggering rank broadcasts `RENEG_BEGIN(R)`; every rank freezes
//! routing, snapshots its samples, and uploads pivots to the coordinator
//! (rank 0); the coordinator merges all N pivot vectors into N+1 boundaries
//! and scatters them back; every rank installs the boundaries atomically,
//! wakes blocked writers, and flushes its out-of-bounds buffer.

use crate::engine::{EngineShared, RangeState};
use crate::frame;
use crate::pivots::{compute_pivots, PivotVector};
use crate::router::BoundaryVector;
use crate::stats::ShuffleStats;
use anyhow::Result;
use crossbeam_channel::Receiver;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Weight assigned to a zero-width (low-confidence or substituted) pivot
/// vector during the merge. A calibration choice: such ranks still pull the
/// global envelope but contribute almost no interior mass.
pub const WEIGHT_EPSILON: f64 = 1e-6;

/// Why the write path asked for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerReason {
    /// An out-of-bounds side reached capacity.
    OobSaturated,
    /// The count-based interval elapsed.
    Interval,
    /// Epoch end needs boundaries to drain the warm-up buffer.
    EpochEnd,
}

/// Inbox of the negotiation task.
#[derive(Debug)]
pub(crate) enum NegMsg {
    Trigger(TriggerReason),
    Begin {
        round: u32,
        sender: u32,
    },
    Pivots {
        src: u32,
        round: u32,
        width: f32,
        pivots: Vec<f32>,
    },
    Shutdown,
}

/// Pivot upload retained for one rank in an open round.
#[derive(Debug, Clone)]
struct RankPivots {
    width: f32,
    pivots: Vec<f32>,
}

/// The round this rank has frozen for and sent pivots under.
struct ActiveRound {
    round: u32,
    /// Our own summary, kept so a round-number upgrade can resend it.
    local: Option<PivotVector>,
}

pub(crate) struct Negotiator {
    shared: Arc<EngineShared>,
    rx: Receiver<NegMsg>,
    active: Option<ActiveRound>,
    /// Coordinator-only: pivot uploads per open round.
    collectors: FxHashMap<u32, FxHashMap<u32, RankPivots>>,
    /// Coordinator-only: highest round any upload or begin has named.
    max_round_seen: u32,
    /// Highest round this rank has installed boundaries for.
    last_installed: u32,
}

/// Rank that merges pivots, by convention.
pub(crate) const COORDINATOR: u32 = 0;

impl Negotiator {
    pub(crate) fn new(shared: Arc<EngineShared>, rx: Receiver<NegMsg>) -> Self {
        Self {
            shared,
            rx,
            active: None,
            collectors: FxHashMap::default(),
            max_round_seen: 0,
            last_installed: 0,
        }
    }

    /// Task body. Any error escaping a handler is a soundness failure of the
    /// protocol; the group is aborted and the task exits.
    pub(crate) fn run(mut self) {
        while let Ok(msg) = self.rx.recv() {
            let outcome = match msg {
                NegMsg::Trigger(reason) => self.handle_trigger(reason),
                NegMsg::Begin { round, sender } => self.handle_begin(round, sender),
                NegMsg::Pivots {
                    src,
                    round,
                    width,
                    pivots,
                } => self.handle_pivots(src, round, width, pivots),
                NegMsg::Shutdown => break,
            };
            if let Err(err) = outcome {
                warn!(rank = self.shared.rank, error = %err, "negotiation failed, aborting group");
                self.shared.fatal(&err.to_string());
                return;
            }
        }
        debug!(rank = self.shared.rank, "negotiation task stopped");
    }

    fn handle_trigger(&mut self, reason: TriggerReason) -> Result<()> {
        if self.active.is_some() {
            debug!(rank = self.shared.rank, ?reason, "trigger ignored, round in progress");
            return Ok(());
        }
        let round = {
            let shared = self.shared.state_mu.lock();
            let wanted = match reason {
                TriggerReason::OobSaturated => {
                    shared.oob.any_side_full() || shared.state == RangeState::Blocked
                }
                TriggerReason::Interval => {
                    matches!(shared.state, RangeState::Init | RangeState::Ready)
                        && !(shared.samples.is_empty() && shared.oob.is_empty())
                }
                TriggerReason::EpochEnd => !shared.oob.is_empty(),
            };
            if !wanted {
                debug!(rank = self.shared.rank, ?reason, "trigger no longer applies");
                return Ok(());
            }
            shared.round_no + 1
        };
        info!(rank = self.shared.rank, round, ?reason, "initiating renegotiation");
        let begin = frame::encode_reneg_begin(round, self.shared.rank);
        let epoch = self.shared.current_epoch();
        for dst in 0..self.shared.nranks {
            if dst != self.shared.rank {
                self.shared.transport.enqueue(dst, &begin, epoch)?;
            }
        }
        self.handle_begin(round, self.shared.rank)
    }

    fn handle_begin(&mut self, round: u32, sender: u32) -> Result<()> {
        if let Some(active) = &mut self.active {
            if round <= active.round {
                debug!(rank = self.shared.rank, round, sender, "duplicate begin absorbed");
                return Ok(());
            }
            // a later round superseded the one we froze for: keep the frozen
            // snapshot, re-upload it under the higher round number
            info!(
                rank = self.shared.rank,
                old_round = active.round,
                round,
                "round upgraded mid-negotiation"
            );
            active.round = round;
            let local = active.local.clone();
            return self.send_pivots(round, local);
        }

        {
            let shared = self.shared.state_mu.lock();
            if round <= shared.round_no {
                warn!(rank = self.shared.rank, round, sender, "stale begin dropped");
                ShuffleStats::incr(&self.shared.stats.stale_frames_dropped);
                return Ok(());
            }
        }

        // freeze: in-range routing stops, new writes park out-of-bounds
        let snapshot = {
            let mut shared = self.shared.state_mu.lock();
            if matches!(shared.state, RangeState::Init | RangeState::Ready) {
                shared.state = RangeState::Reneg;
            }
            let mut samples = shared.samples.clone();
            samples.extend(shared.oob.props());
            samples
        };
        debug!(
            rank = self.shared.rank,
            round,
            samples = snapshot.len(),
            "frozen for renegotiation"
        );
        let local = compute_pivots(snapshot, self.shared.cfg.pivot_count);
        self.active = Some(ActiveRound {
            round,
            local: local.clone(),
        });
        self.send_pivots(round, local)
    }

    fn send_pivots(&mut self, round: u32, local: Option<PivotVector>) -> Result<()> {
        let (width, pivots): (f32, &[f32]) = match &local {
            Some(pv) => (pv.width, pv.pivots.as_slice()),
            None => (0.0, &[]),
        };
        if self.shared.rank == COORDINATOR {
            return self.collect_pivots(self.shared.rank, round, width, pivots.to_vec());
        }
        let wire = frame::encode_reneg_pivots(round, width, pivots);
        self.shared
            .transport
            .enqueue(COORDINATOR, &wire, self.shared.current_epoch())
    }

    fn handle_pivots(&mut self, src: u32, round: u32, width: f32, pivots: Vec<f32>) -> Result<()> {
        if self.shared.rank == COORDINATOR {
            self.collect_pivots(src, round, width, pivots)
        } else {
            self.handle_install(round, pivots)
        }
    }

    /// Coordinator side: accumulate one rank's upload, merge when the round
    /// is complete.
    fn collect_pivots(&mut self, src: u32, round: u32, width: f32, pivots: Vec<f32>) -> Result<()> {
        if round <= self.last_installed {
            warn!(round, src, "pivots for closed round dropped");
            ShuffleStats::incr(&self.shared.stats.stale_frames_dropped);
            return Ok(());
        }
        if round > self.max_round_seen {
            self.collectors.retain(|&r, _| {
                if r < round {
                    warn!(dropped_round = r, round, "lower-round pivots dropped");
                }
                r >= round
            });
            self.max_round_seen = round;
        } else if round < self.max_round_seen {
            warn!(round, src, max_round = self.max_round_seen, "pivots below active round dropped");
            ShuffleStats::incr(&self.shared.stats.stale_frames_dropped);
            return Ok(());
        }

        let collector = self.collectors.entry(round).or_default();
        if collector.contains_key(&src) {
            warn!(round, src, "duplicate pivot upload ignored");
            return Ok(());
        }
        collector.insert(src, RankPivots { width, pivots });
        debug!(
            round,
            src,
            have = collector.len(),
            want = self.shared.nranks,
            "pivot upload collected"
        );
        if collector.len() < self.shared.nranks as usize {
            return Ok(());
        }

        let uploads = self.collectors.remove(&round).unwrap_or_default();
        let bounds = merge_boundaries(&uploads, self.shared.nranks as usize)?;
        info!(round, ?bounds, "boundaries merged");
        let wire = frame::encode_reneg_pivots(round, 0.0, &bounds);
        let epoch = self.shared.current_epoch();
        for dst in 0..self.shared.nranks {
            if dst != self.shared.rank {
                self.shared.transport.enqueue(dst, &wire, epoch)?;
            }
        }
        self.install(round, bounds)
    }

    /// Non-coordinator side: a pivots frame from the coordinator is the
    /// boundary scatter for our active round.
    fn handle_install(&mut self, round: u32, bounds: Vec<f32>) -> Result<()> {
        let is_active = matches!(&self.active, Some(active) if active.round == round);
        if !is_active {
            warn!(
                rank = self.shared.rank,
                round, "boundary install for inactive round dropped"
            );
            ShuffleStats::incr(&self.shared.stats.stale_frames_dropped);
            return Ok(());
        }
        self.install(round, bounds)
    }

    fn install(&mut self, round: u32, bounds: Vec<f32>) -> Result<()> {
        let vector = Arc::new(BoundaryVector::from_bounds(bounds)?);
        if vector.nranks() != self.shared.nranks as usize {
            return Err(crate::error::ShuffleError::protocol(format!(
                "boundary vector partitions {} ranks, group has {}",
                vector.nranks(),
                self.shared.nranks
            ))
            .into());
        }
        info!(rank = self.shared.rank, round, "installing boundaries");
        {
            let mut shared = self.shared.state_mu.lock();
            let (min, max) = vector.envelope();
            shared.boundaries = Some(vector.clone());
            shared.round_no = round;
            shared.oob.set_range(min, max);
            shared.state = RangeState::Ready;
            shared.writes_since_reneg = 0;
            ShuffleStats::incr(&self.shared.stats.reneg_rounds);
            // flush before releasing the lock so no foreground write can
            // classify against the new vector ahead of the parked backlog
            let preserved = self.shared.flush_oob_round(&mut shared, &vector)?;
            if preserved > 0 {
                warn!(
                    rank = self.shared.rank,
                    round, preserved, "entries outside the merged envelope preserved"
                );
            }
            self.shared.state_cv.notify_all();
        }
        self.last_installed = round;
        self.active = None;
        Ok(())
    }
}

/// Ordered weighted merge of per-rank pivot vectors into N+1 global
/// boundaries. Each rank's K intervals carry equal mass `1/width` (epsilon
/// for zero-width vectors); boundaries sit at equi-mass quantiles of the
/// summed piecewise distribution. Ranks that reported no samples are
/// substituted with the global envelope at epsilon weight.
fn merge_boundaries(uploads: &FxHashMap<u32, RankPivots>, nranks: usize) -> Result<Vec<f32>> {
    let populated: Vec<&RankPivots> = uploads.iter().filter(|(_, p)| !p.pivots.is_empty()).map(|(_, p)| p).collect();
    if populated.is_empty() {
        return Err(
            crate::error::ShuffleError::protocol("renegotiation round with no samples").into(),
        );
    }
    let global_min = populated
        .iter()
        .map(|p| p.pivots[0] as f64)
        .fold(f64::INFINITY, f64::min);
    let global_max = populated
        .iter()
        .map(|p| *p.pivots.last().unwrap() as f64)
        .fold(f64::NEG_INFINITY, f64::max);

    let substituted = uploads.len() - populated.len();
    if substituted > 0 {
        warn!(
            substituted,
            "ranks with no samples substituted with the global envelope"
        );
    }

    // spans: (lo, hi, mass); zero-length spans are point masses
    let mut spans: Vec<(f64, f64, f64)> = Vec::new();
    for pivots in &populated {
        let weight = if pivots.width > 0.0 {
            1.0 / pivots.width as f64
        } else {
            WEIGHT_EPSILON
        };
        for pair in pivots.pivots.windows(2) {
            spans.push((pair[0] as f64, pair[1] as f64, weight));
        }
    }
    for _ in 0..substituted {
        spans.push((global_min, global_max, WEIGHT_EPSILON));
    }

    let mut knots: Vec<f64> = spans.iter().flat_map(|&(lo, hi, _)| [lo, hi]).collect();
    knots.sort_by(f64::total_cmp);
    knots.dedup();

    // mass strictly inside each knot segment, plus point masses on knots
    let mut seg_mass = vec![0.0f64; knots.len().saturating_sub(1)];
    let mut point_mass = vec![0.0f64; knots.len()];
    for &(lo, hi, mass) in &spans {
        if hi > lo {
            let start = knots.partition_point(|&k| k < lo);
            let end = knots.partition_point(|&k| k < hi);
            for j in start..end {
                let seg_len = knots[j + 1] - knots[j];
                seg_mass[j] += mass * (seg_len / (hi - lo));
            }
        } else {
            let at = knots.partition_point(|&k| k < lo);
            point_mass[at] += mass;
        }
    }

    // cumulative mass up to and including each knot
    let mut cum = vec![0.0f64; knots.len()];
    let mut running = 0.0f64;
    for j in 0..knots.len() {
        if j > 0 {
            running += seg_mass[j - 1];
        }
        running += point_mass[j];
        cum[j] = running;
    }
    let total = running;
    if !(total > 0.0) {
        return Err(
            crate::error::ShuffleError::protocol("merged pivot distribution has no mass").into(),
        );
    }

    let mut bounds = vec![0.0f32; nranks + 1];
    bounds[0] = global_min as f32;
    bounds[nranks] = global_max as f32;
    for r in 1..nranks {
        let target = total * r as f64 / nranks as f64;
        bounds[r] = quantile(&knots, &cum, &seg_mass, &point_mass, target) as f32;
    }

    // interior entries must be strictly increasing; sparse data gets nudged
    // by the smallest representable step
    for r in 2..nranks {
        if bounds[r] <= bounds[r - 1] {
            bounds[r] = bounds[r - 1].next_up();
        }
    }
    Ok(bounds)
}

/// Position of the `target` mass quantile on the knotted cumulative curve.
/// The curve rises linearly by `seg_mass[j]` between knots j and j+1 and
/// jumps by `point_mass[j]` at knot j. Plateaus (zero-density gaps) resolve
/// to their midpoint, so a boundary falling in the gap between two clusters
/// splits the gap instead of hugging one side.
fn quantile(knots: &[f64], cum: &[f64], seg_mass: &[f64], point_mass: &[f64], target: f64) -> f64 {
    // first knot whose cumulative mass reaches the target
    let j = cum.partition_point(|&c| c < target);
    if j >= knots.len() {
        return *knots.last().unwrap();
    }
    if j == 0 {
        return knots[0];
    }
    let jump_base = cum[j] - point_mass[j];
    if target > jump_base {
        // inside the jump of a point mass
        return knots[j];
    }
    if target < jump_base {
        // strictly inside the rising segment before knot j
        let frac = (target - cum[j - 1]) / seg_mass[j - 1];
        return knots[j - 1] + frac * (knots[j] - knots[j - 1]);
    }
    // exactly at knot j: extend across any zero-mass plateau and take the
    // midpoint
    let mut k = j;
    while k + 1 < knots.len() && seg_mass[k] == 0.0 && point_mass[k + 1] == 0.0 {
        k += 1;
    }
    (knots[j] + knots[k]) / 2.0
}
