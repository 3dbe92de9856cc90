//! Burst manager: aggregates a timed acquisition into either a sequence of
//! BLOCKS blocks (`DampTrg`/`DampCd`) or a single `SUMMARY` line (`Weight`).
//! Ported from `burst_mgr.c`; buffer sizing matches `SAMPLES_PER_BURST`
//! (8000), the fixed cap named in spec.md §9's no-dynamic-allocation rule.

use core::fmt::Write as _;

use crate::context::OpMode;
use crate::proto::schema::{PROTO_BLOCK_LINES_DEFAULT, PROTO_MAX_LINE, SAMPLES_PER_BURST};
use crate::sample::Sample;
use crate::sensor::convert_to_mps2;
use crate::telemetry;
use crate::transport::blocks::{AbortCode, BlocksTransport, LineSource};

/// Stall threshold during a burst collection: no new sample for this many
/// ms (while time budget remains) is a fatal stall.
pub const STALL_MS: u32 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BurstKind {
    Weight,
    DampTrg,
    DampCd,
}

impl BurstKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            BurstKind::Weight => "WEIGHT",
            BurstKind::DampTrg => "DAMP_TRG",
            BurstKind::DampCd => "DAMP_CD",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Collecting,
    Sending,
    AwaitingAckComplete,
}

/// Owns the raw per-axis sample buffers for one in-flight burst. Storage
/// for `DATA` line generation; exclusively owned by the [`BurstManager`],
/// as spec.md's BurstSession ownership note requires (the transport only
/// ever gets a borrow via [`BurstManager::line_source`]).
struct SampleBuf {
    xs: [i16; SAMPLES_PER_BURST],
    ys: [i16; SAMPLES_PER_BURST],
    zs: [i16; SAMPLES_PER_BURST],
    ts_us: [u32; SAMPLES_PER_BURST],
}

impl SampleBuf {
    fn new() -> Self {
        Self {
            xs: [0; SAMPLES_PER_BURST],
            ys: [0; SAMPLES_PER_BURST],
            zs: [0; SAMPLES_PER_BURST],
            ts_us: [0; SAMPLES_PER_BURST],
        }
    }
}

pub struct BurstSession {
    pub id: u32,
    pub kind: BurstKind,
    pub ts0_us: u32,
    pub planned_samples: u16,
    pub collected: u16,
    pub odr_hz: u32,
    pub started_ms: u32,
    pub last_sample_ms: u32,
    pub mode_before: OpMode,
    /// Collection window, `u32::MAX` for count-only (`Weight`) sessions
    /// that have no duration to elapse against.
    budget_ms: u32,
    buf: SampleBuf,
}

/// Outcome of pumping or feeding the burst manager, for the caller (the
/// main pump) to act on: which lines to emit, whether sampling should
/// stop, and which mode to transition to.
#[derive(Debug, PartialEq)]
pub enum BurstEvent {
    None,
    /// Collection finished; blocks have been enqueued and are sending.
    CollectionDone,
    /// Weight-kind finished; caller should emit the given `SUMMARY` stats.
    WeightSummary {
        mean_ax_raw: f32,
        median_ax_raw: f32,
        mean_ms2: f32,
        std_ms2: f32,
    },
    /// `COMPLETE` should be emitted with these fields.
    Complete { burst_id: u32, samples: u32, time_ms: u32 },
    /// The burst was aborted; `COMPLETE,...,reason=aborted,code=<c>` and a
    /// return to `mode_before` (or `WaitArm` for `DampTrg`) should follow
    /// once the TX ring is idle.
    Aborted { burst_id: u32, code: u32, mode_before: OpMode, was_trg: bool },
    /// The session fully completed (`ACK_COMPLETE` observed); the caller
    /// should transition mode.
    Finalized { mode_before: OpMode, was_trg: bool },
}

/// A burst request parked during its lead-in [`crate::countdown::Countdown`]
/// (`START_BURST_DAMPING`'s fixed 5 s countdown). Stashed on
/// [`crate::context::AppContext`] between the command handler and the
/// countdown-expiry pump step that actually calls [`BurstManager::start`].
#[derive(Clone, Copy, Debug)]
pub struct PendingBurst {
    pub id: u32,
    pub kind: BurstKind,
    pub budget_ms: u32,
    pub odr_hz: u32,
    pub mode_before: OpMode,
}

pub struct BurstManager {
    phase: Phase,
    session: Option<BurstSession>,
    transport: BlocksTransport,
}

impl Default for BurstManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BurstManager {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            session: None,
            transport: BlocksTransport::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn is_collecting(&self) -> bool {
        self.phase == Phase::Collecting
    }

    pub fn is_waiting_ack_complete(&self) -> bool {
        self.phase == Phase::AwaitingAckComplete
    }

    pub fn current_kind(&self) -> Option<BurstKind> {
        self.session.as_ref().map(|s| s.kind)
    }

    /// Begin collecting. `budget_ms` bounds the capture in time;
    /// `target_samples` additionally bounds it in sample count (whichever
    /// comes first), per `target_samples = min(burst_ms*odr/1000, 8000)`.
    pub fn start(
        &mut self,
        id: u32,
        kind: BurstKind,
        budget_ms: u32,
        odr_hz: u32,
        mode_before: OpMode,
        ts0_us: u32,
        now_ms: u32,
    ) {
        let target = ((budget_ms as u64 * odr_hz as u64) / 1000).min(SAMPLES_PER_BURST as u64) as u16;
        self.begin(id, kind, target, budget_ms, odr_hz, mode_before, ts0_us, now_ms);
    }

    /// Begin collecting exactly `count` samples, bypassing the
    /// time-budget-to-sample-count conversion `start` performs. Used by
    /// `START_BURST_WEIGHT`, whose `cycles=<u32>` argument names a sample
    /// count directly rather than a duration; the session never closes on
    /// elapsed time.
    pub fn start_with_count(
        &mut self,
        id: u32,
        kind: BurstKind,
        count: u16,
        odr_hz: u32,
        mode_before: OpMode,
        ts0_us: u32,
        now_ms: u32,
    ) {
        let target = (count as usize).min(SAMPLES_PER_BURST) as u16;
        self.begin(id, kind, target, u32::MAX, odr_hz, mode_before, ts0_us, now_ms);
    }

    #[allow(clippy::too_many_arguments)]
    fn begin(
        &mut self,
        id: u32,
        kind: BurstKind,
        target: u16,
        budget_ms: u32,
        odr_hz: u32,
        mode_before: OpMode,
        ts0_us: u32,
        now_ms: u32,
    ) {
        self.session = Some(BurstSession {
            id,
            kind,
            ts0_us,
            planned_samples: target,
            collected: 0,
            odr_hz,
            started_ms: now_ms,
            last_sample_ms: now_ms,
            mode_before,
            budget_ms,
            buf: SampleBuf::new(),
        });
        self.phase = Phase::Collecting;
    }

    /// Whether the active session's collection window has elapsed (always
    /// `false` for count-only `Weight` sessions, whose `budget_ms` is
    /// `u32::MAX`).
    pub fn budget_elapsed(&self, now_ms: u32) -> bool {
        match &self.session {
            Some(s) => now_ms.wrapping_sub(s.started_ms) >= s.budget_ms,
            None => false,
        }
    }

    /// `true` only while actively `Collecting`: the sensor is stopped
    /// during `Sending`/`AwaitingAckComplete`, so `last_sample_ms` is
    /// frozen and would otherwise look stalled for the whole transmission.
    pub fn is_stalled(&self, now_ms: u32) -> bool {
        if self.phase != Phase::Collecting {
            return false;
        }
        match &self.session {
            Some(s) => s.collected > 0 && now_ms.wrapping_sub(s.last_sample_ms) > STALL_MS,
            None => false,
        }
    }

    /// Feed one sample during `Collecting`. Returns `true` if the planned
    /// sample count has now been reached.
    pub fn feed(&mut self, sample: Sample, ts_us: u32, now_ms: u32) -> bool {
        let Some(s) = self.session.as_mut() else {
            return false;
        };
        if s.collected as usize >= SAMPLES_PER_BURST || s.collected >= s.planned_samples {
            return true;
        }
        let i = s.collected as usize;
        s.buf.xs[i] = sample.x;
        s.buf.ys[i] = sample.y;
        s.buf.zs[i] = sample.z;
        s.buf.ts_us[i] = ts_us;
        s.collected += 1;
        s.last_sample_ms = now_ms;
        s.collected >= s.planned_samples
    }

    /// Collection window closed (either target reached or time budget
    /// elapsed). For `Weight`, compute and return the summary statistics
    /// directly. For `DampTrg`/`DampCd`, partition into blocks and hand off
    /// to the BLOCKS transport.
    pub fn finish_collection(&mut self) -> BurstEvent {
        let Some(session) = self.session.as_ref() else {
            return BurstEvent::None;
        };
        if session.kind == BurstKind::Weight {
            let n = session.collected as usize;
            let mean_ax_raw = session.buf.xs[..n].iter().map(|&v| v as f64).sum::<f64>() / n as f64;
            let mut scratch = [0i32; SAMPLES_PER_BURST];
            for i in 0..n {
                scratch[i] = session.buf.xs[i] as i32;
            }
            let median_ax_raw = quickselect_median(&mut scratch[..n]) as f32;

            let mut mag_sum = 0f64;
            let mut mags = [0f32; SAMPLES_PER_BURST];
            for i in 0..n {
                let (ax, ay, az) = convert_to_mps2((session.buf.xs[i], session.buf.ys[i], session.buf.zs[i]));
                let mag = libm::sqrtf(ax * ax + ay * ay + az * az);
                mags[i] = mag;
                mag_sum += mag as f64;
            }
            let mean_ms2 = (mag_sum / n as f64) as f32;
            let var = mags[..n]
                .iter()
                .map(|&m| {
                    let d = m - mean_ms2;
                    (d * d) as f64
                })
                .sum::<f64>()
                / n as f64;
            let std_ms2 = libm::sqrtf(var as f32);

            self.phase = Phase::Idle;
            let id = session.id;
            self.session = None;
            let _ = id;
            return BurstEvent::WeightSummary {
                mean_ax_raw: mean_ax_raw as f32,
                median_ax_raw,
                mean_ms2,
                std_ms2,
            };
        }

        let n = session.collected;
        let lines_per_block = PROTO_BLOCK_LINES_DEFAULT;
        self.transport.begin_burst(
            crate::proto::schema::PROTO_BLOCK_TIMEOUT_MS,
            crate::proto::schema::PROTO_MAX_RETRIES,
        );
        let mut base = 0u16;
        while base < n {
            let lines = lines_per_block.min(n - base);
            if self.transport.enqueue_block(base, lines).is_err() {
                break;
            }
            base += lines;
        }
        self.phase = Phase::Sending;
        BurstEvent::CollectionDone
    }

    /// Samples, mode, and burst-id for the `DATA_HEADER`/`COMPLETE` lines.
    pub fn header_info(&self) -> Option<(BurstKind, u32, u32, u16)> {
        self.session
            .as_ref()
            .map(|s| (s.kind, s.id, s.ts0_us, s.collected))
    }

    /// Wall-clock the active session started collecting, for `COMPLETE`'s
    /// `time_ms` elapsed-duration field.
    pub fn started_ms(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.started_ms)
    }

    /// A view over this burst's samples for the BLOCKS transport to pull
    /// `DATA` lines from.
    pub fn line_source(&self) -> Option<BurstLineSource<'_>> {
        self.session.as_ref().map(|s| BurstLineSource { session: s })
    }

    pub fn pump_transport(
        &mut self,
        sink: &mut dyn crate::hal::ByteSink,
        now_ms: u32,
    ) -> Option<AbortCode> {
        if self.phase != Phase::Sending {
            return None;
        }
        let Some(session) = &self.session else {
            return None;
        };
        let burst_id = session.id;
        let window = 4u8;
        let src = BurstLineSource { session };
        if self.transport.pump_send(burst_id, window, &src, sink, now_ms).is_err() {
            return Some(AbortCode(999));
        }
        self.transport.pump_timeouts(burst_id, &src, sink, now_ms)
    }

    pub fn on_ack_blk(&mut self, blk: u16) {
        self.transport.on_ack_blk(blk);
    }

    pub fn on_nack_blk(
        &mut self,
        blk: u16,
        code: u32,
        sink: &mut dyn crate::hal::ByteSink,
        now_ms: u32,
    ) -> Option<AbortCode> {
        let session = self.session.as_ref()?;
        let burst_id = session.id;
        let src = BurstLineSource { session };
        self.transport.on_nack_blk(burst_id, blk, code, &src, sink, now_ms)
    }

    /// Transport finished sending every block; mark awaiting `ACK_COMPLETE`.
    pub fn transport_idle(&self) -> bool {
        self.phase == Phase::Sending && self.transport.is_idle()
    }

    pub fn mark_awaiting_ack_complete(&mut self) {
        self.phase = Phase::AwaitingAckComplete;
    }

    /// `ACK_COMPLETE,burst_id=B`: finalize if a burst is active and its id
    /// matches (or none given).
    pub fn on_ack_complete(&mut self, burst_id: Option<u32>) -> Option<BurstEvent> {
        let session = self.session.as_ref()?;
        if let Some(b) = burst_id {
            if b != session.id {
                return None;
            }
        }
        let was_trg = session.kind == BurstKind::DampTrg;
        let mode_before = session.mode_before;
        self.phase = Phase::Idle;
        self.session = None;
        Some(BurstEvent::Finalized { mode_before, was_trg })
    }

    /// Abort the active burst (transport failure or `STOP`). Returns the
    /// event describing the abort, or `None` if nothing was active.
    pub fn abort(&mut self, code: u32) -> Option<BurstEvent> {
        let session = self.session.take()?;
        self.transport.abort_all();
        self.phase = Phase::Idle;
        Some(BurstEvent::Aborted {
            burst_id: session.id,
            code,
            mode_before: session.mode_before,
            was_trg: session.kind == BurstKind::DampTrg,
        })
    }
}

pub struct BurstLineSource<'a> {
    session: &'a BurstSession,
}

impl<'a> LineSource for BurstLineSource<'a> {
    fn emit_line(&self, index: u16, out: &mut [u8]) -> Option<usize> {
        let i = index as usize;
        if i >= self.session.collected as usize {
            return None;
        }
        let (ax, ay, az) = convert_to_mps2((self.session.buf.xs[i], self.session.buf.ys[i], self.session.buf.zs[i]));
        let theta = telemetry::theta_deg_from_ms2(ax, ay);
        let mut line = heapless::String::<PROTO_MAX_LINE>::new();
        telemetry::data_line(&mut line, self.session.buf.ts_us[i], ax, ay, az, theta).ok()?;
        let bytes = line.as_bytes();
        out[..bytes.len()].copy_from_slice(bytes);
        Some(bytes.len())
    }
}

/// In-place quickselect for the median of raw axis counts, on a scratch
/// copy the caller owns (never mutates the accumulation buffer in place
/// ahead of the mean calculation).
fn quickselect_median(data: &mut [i32]) -> i32 {
    let n = data.len();
    let k = n / 2;
    let kth = quickselect(data, k);
    if n % 2 == 1 {
        kth
    } else {
        // Even count: average the two middle elements. `quickselect`
        // partially orders around `k`; the element at `k-1` is now the
        // max of the lower partition.
        let lower_max = data[..k].iter().copied().max().unwrap_or(kth);
        (kth + lower_max) / 2
    }
}

fn quickselect(data: &mut [i32], k: usize) -> i32 {
    let mut lo = 0usize;
    let mut hi = data.len() - 1;
    loop {
        if lo == hi {
            return data[lo];
        }
        let pivot = data[(lo + hi) / 2];
        let mut i = lo;
        let mut j = hi;
        while i <= j {
            while data[i] < pivot {
                i += 1;
            }
            while data[j] > pivot {
                j -= 1;
            }
            if i <= j {
                data.swap(i, j);
                i += 1;
                if j == 0 {
                    break;
                }
                j -= 1;
            }
        }
        if k <= j {
            hi = j;
        } else if k >= i {
            lo = i;
        } else {
            return data[k];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(v: i16) -> Sample {
        Sample {
            x: v,
            y: v,
            z: v,
            ts_ticks: v as u32,
        }
    }

    #[test]
    fn target_samples_capped_by_burst_ms_and_odr() {
        let mut bm = BurstManager::new();
        bm.start(1, BurstKind::DampCd, 100, 100, OpMode::Idle, 0, 0);
        assert_eq!(bm.session.as_ref().unwrap().planned_samples, 10);
    }

    #[test]
    fn feed_reaches_target_and_moves_to_sending() {
        let mut bm = BurstManager::new();
        bm.start(1, BurstKind::DampCd, 100, 100, OpMode::Idle, 0, 0);
        for i in 0..9 {
            assert!(!bm.feed(sample(i), i as u32, i as u32));
        }
        assert!(bm.feed(sample(9), 9, 9));
        let ev = bm.finish_collection();
        assert_eq!(ev, BurstEvent::CollectionDone);
    }

    #[test]
    fn weight_kind_computes_summary() {
        let mut bm = BurstManager::new();
        bm.start(1, BurstKind::Weight, 10_000, 800, OpMode::Idle, 0, 0);
        for v in [10i16, 20, 30, 40, 50] {
            bm.feed(sample(v), 0, 0);
        }
        match bm.finish_collection() {
            BurstEvent::WeightSummary { median_ax_raw, .. } => {
                assert_eq!(median_ax_raw, 30.0);
            }
            _ => panic!("expected weight summary"),
        }
    }

    #[test]
    fn stall_only_detected_while_collecting() {
        let mut bm = BurstManager::new();
        bm.start(1, BurstKind::DampCd, 100, 100, OpMode::Idle, 0, 0);
        bm.feed(sample(1), 0, 0);
        assert!(!bm.is_stalled(400));
        assert!(bm.is_stalled(600));

        let mut bm2 = BurstManager::new();
        bm2.start(1, BurstKind::DampCd, 10, 100, OpMode::Idle, 0, 0);
        for i in 0..bm2.session.as_ref().unwrap().planned_samples {
            bm2.feed(sample(i as i16), 0, 0);
        }
        bm2.finish_collection();
        assert!(!bm2.is_stalled(10_000));
    }

    #[test]
    fn budget_elapsed_closes_a_short_collection() {
        let mut bm = BurstManager::new();
        bm.start(1, BurstKind::DampCd, 500, 100, OpMode::Idle, 0, 0);
        bm.feed(sample(1), 0, 0);
        assert!(!bm.budget_elapsed(400));
        assert!(bm.budget_elapsed(500));
    }

    #[test]
    fn weight_sessions_never_budget_elapse() {
        let mut bm = BurstManager::new();
        bm.start_with_count(1, BurstKind::Weight, 5, 800, OpMode::Idle, 0, 0);
        assert!(!bm.budget_elapsed(u32::MAX));
    }

    #[test]
    fn abort_clears_session_and_transport() {
        let mut bm = BurstManager::new();
        bm.start(1, BurstKind::DampTrg, 100, 100, OpMode::Idle, 0, 0);
        bm.feed(sample(1), 0, 0);
        let ev = bm.abort(400);
        assert!(matches!(ev, Some(BurstEvent::Aborted { code: 400, was_trg: true, .. })));
        assert!(!bm.is_active());
    }

    #[test]
    fn quickselect_median_matches_sorted_reference() {
        let mut data = [5, 1, 4, 2, 3];
        assert_eq!(quickselect_median(&mut data), 3);
        let mut even = [1, 2, 3, 4];
        assert_eq!(quickselect_median(&mut even), 2);
    }
}
