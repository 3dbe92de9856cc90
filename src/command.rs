//! Command dispatch and the cooperative main pump: the FSM that ties every
//! other module together. Ported from `cmd_handler.c`'s verb switch and
//! `main_pump.c`'s per-tick sequencing; this is the one module allowed to
//! know about every other subsystem at once (burst manager, trigger engine,
//! live streamer, countdown, telemetry), the way `dual-iir.rs`'s top-level
//! task is the one place that wires DSP, network, and hardware together.

use crate::burst::{BurstEvent, BurstKind, BurstManager, PendingBurst};
use crate::context::{AppContext, CapturePhase, OpMode};
use crate::error::Error;
use crate::hal::{AccelSensor, ByteSink};
use crate::proto::fields::{find_field, has_flag};
use crate::proto::line::cmd_exact;
use crate::proto::parse::{parse_float_fixed3, parse_u16, parse_u32, parse_u64};
use crate::proto::schema::*;
use crate::sample::{Sample, SampleRing};
use crate::streaming::LiveStreamer;
use crate::telemetry;
use crate::trigger::{self, Capture, TrgState};

/// Largest formatted message this module emits (`ADXL_ST_RAW` and
/// `DATA_HEADER` are the widest lines).
const MSG_BUF: usize = 160;

/// Abort reason for a user-initiated `STOP` during an active burst. Distinct
/// from the protocol's documented 400 (retries exhausted)/500 (stall)/999
/// (fatal) codes so a host can tell "you told me to stop" apart from a
/// transport failure.
const ABORT_CODE_USER_STOP: u32 = 600;

// --- small formatting helpers -------------------------------------------

fn emit_ack(sink: &mut dyn ByteSink, subject: &str) {
    let mut s = heapless::String::<MSG_BUF>::new();
    telemetry::ack(&mut s, subject).ok();
    sink.write_atomic(s.as_bytes());
}

fn emit_nack(sink: &mut dyn ByteSink, subject: &str, err: Error) {
    let mut s = heapless::String::<MSG_BUF>::new();
    telemetry::nack(&mut s, subject, err.reason(), err.code()).ok();
    sink.write_atomic(s.as_bytes());
}

fn emit_error_msg(sink: &mut dyn ByteSink, src: &str, code: u32, msg: &str) {
    let mut s = heapless::String::<MSG_BUF>::new();
    telemetry::error(&mut s, src, code, msg).ok();
    sink.write_atomic(s.as_bytes());
}

/// Always emits, regardless of whether `mode_dirty` was set; callers only
/// invoke this right after a transition they already know happened, so
/// there's no risk of duplicate `STATUS` lines for the same transition.
fn emit_status(ctx: &mut AppContext, sink: &mut dyn ByteSink) {
    ctx.take_mode_dirty();
    let mut s = heapless::String::<MSG_BUF>::new();
    telemetry::status(&mut s, ctx.op_mode, ctx.trg_state).ok();
    sink.write_atomic(s.as_bytes());
}

fn emit_cal_info(sink: &mut dyn ByteSink, status: &str) {
    let mut s = heapless::String::<MSG_BUF>::new();
    telemetry::cal_info(&mut s, status).ok();
    sink.write_atomic(s.as_bytes());
}

fn emit_countdown_id(sink: &mut dyn ByteSink, id: u32) {
    let mut s = heapless::String::<48>::new();
    telemetry::countdown_id(&mut s, id).ok();
    sink.write_atomic(s.as_bytes());
}

/// `LineAssembler::take_line` strips the CR/LF terminator, but
/// [`crate::proto::parse`]'s value parsers require a terminator byte
/// immediately after the last field on a line. Copy the command's argument
/// remainder into a local buffer and append a NUL (itself a valid
/// terminator per `is_term_or_eol`), mirroring the original firmware's
/// NUL-terminated command buffer convention.
fn pad<'b>(rest: &[u8], buf: &'b mut [u8; PROTO_MAX_LINE_PAYLOAD + 1]) -> &'b [u8] {
    let n = rest.len().min(PROTO_MAX_LINE_PAYLOAD);
    buf[..n].copy_from_slice(&rest[..n]);
    buf[n] = 0;
    &buf[..=n]
}

#[cfg(feature = "test-hooks")]
fn take_test_trigger_flag(ctx: &mut AppContext) -> bool {
    core::mem::replace(&mut ctx.test_trigger_flag, false)
}

#[cfg(not(feature = "test-hooks"))]
fn take_test_trigger_flag(_ctx: &mut AppContext) -> bool {
    false
}

/// A line that overran `PROTO_MAX_LINE_PAYLOAD` before its terminator
/// arrived. The caller (RTIC binary or test harness) detects this from
/// [`crate::proto::line::Feed::TooLong`] and calls this directly instead of
/// [`dispatch_line`], since no verb could be identified.
pub fn handle_too_long(sink: &mut dyn ByteSink) {
    emit_nack(sink, "UNKNOWN", Error::LineTooLong);
}

// --- BLOCKS transport hook ------------------------------------------------

/// Every incoming line is offered to the BLOCKS transport first
/// (`ACK_BLK`/`NACK_BLK`/`ACK_COMPLETE`); only if none match does normal
/// command dispatch run. Returns `true` if the line was consumed here.
fn try_blocks_hook(
    line: &[u8],
    ctx: &mut AppContext,
    burst: &mut BurstManager,
    sensor: &mut dyn AccelSensor,
    sink: &mut dyn ByteSink,
    now_ms: u32,
) -> bool {
    let mut buf = [0u8; PROTO_MAX_LINE_PAYLOAD + 1];

    if let Some(rest) = cmd_exact(line, CMD_ACK_BLK) {
        let args = pad(rest, &mut buf);
        if let Some((blk, _)) = find_field(args, "blk").and_then(parse_u16) {
            burst.on_ack_blk(blk);
        }
        return true;
    }

    if let Some(rest) = cmd_exact(line, CMD_NACK_BLK) {
        let args = pad(rest, &mut buf);
        let blk = find_field(args, "blk").and_then(parse_u16).map(|(v, _)| v);
        let code = find_field(args, "code")
            .and_then(parse_u32)
            .map(|(v, _)| v)
            .unwrap_or(0);
        if let Some(blk) = blk {
            if let Some(abort) = burst.on_nack_blk(blk, code, sink, now_ms) {
                if let Some(ev) = burst.abort(abort.0) {
                    apply_burst_abort(ctx, sensor, sink, ev);
                }
            }
        }
        return true;
    }

    if let Some(rest) = cmd_exact(line, CMD_ACK_COMPLETE) {
        let args = pad(rest, &mut buf);
        let burst_id = find_field(args, "burst_id").and_then(parse_u32).map(|(v, _)| v);
        if let Some(ev) = burst.on_ack_complete(burst_id) {
            apply_burst_finalized(ctx, sink, ev);
        }
        return true;
    }

    false
}

fn apply_burst_abort(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, ev: BurstEvent) {
    if let BurstEvent::Aborted {
        burst_id,
        code,
        mode_before,
        was_trg,
    } = ev
    {
        if ctx.sampling_active {
            sensor.stop();
            ctx.sampling_active = false;
        }
        let mut s = heapless::String::<MSG_BUF>::new();
        telemetry::complete_aborted(&mut s, burst_id, code).ok();
        sink.write_atomic(s.as_bytes());

        if code == 999 {
            ctx.set_op_mode(OpMode::Error);
        } else if was_trg {
            ctx.trg_state = TrgState::Idle;
            ctx.set_op_mode(OpMode::WaitArm);
        } else {
            ctx.set_op_mode(mode_before);
        }
        emit_status(ctx, sink);
    }
}

fn apply_burst_finalized(ctx: &mut AppContext, sink: &mut dyn ByteSink, ev: BurstEvent) {
    if let BurstEvent::Finalized { mode_before, was_trg } = ev {
        if was_trg {
            ctx.trg_state = TrgState::Idle;
            ctx.set_op_mode(OpMode::WaitArm);
        } else {
            ctx.set_op_mode(mode_before);
        }
        emit_status(ctx, sink);
    }
}

// --- dispatch --------------------------------------------------------------

/// Handle one complete, CRLF-stripped line: the BLOCKS hook first, then
/// normal verb dispatch. `ring_len` is the sample ring's current occupancy,
/// needed only by `DIAG_HW_TEST`.
#[allow(clippy::too_many_arguments)]
pub fn dispatch_line(
    line: &[u8],
    ctx: &mut AppContext,
    burst: &mut BurstManager,
    live: &mut LiveStreamer,
    sensor: &mut dyn AccelSensor,
    sink: &mut dyn ByteSink,
    ring_len: usize,
    now_ms: u32,
) {
    if try_blocks_hook(line, ctx, burst, sensor, sink, now_ms) {
        return;
    }
    dispatch_command(line, ctx, burst, live, sensor, sink, ring_len, now_ms);
}

#[allow(clippy::too_many_arguments)]
fn dispatch_command(
    line: &[u8],
    ctx: &mut AppContext,
    burst: &mut BurstManager,
    live: &mut LiveStreamer,
    sensor: &mut dyn AccelSensor,
    sink: &mut dyn ByteSink,
    ring_len: usize,
    now_ms: u32,
) {
    let mut buf = [0u8; PROTO_MAX_LINE_PAYLOAD + 1];

    if cmd_exact(line, CMD_HELLO).is_some() {
        cmd_hello(ctx, burst, sensor, sink);
        return;
    }
    if cmd_exact(line, CMD_GET_STATUS).is_some() {
        emit_status(ctx, sink);
        return;
    }
    if cmd_exact(line, CMD_GET_CFG).is_some() {
        let mut s = heapless::String::<MSG_BUF>::new();
        telemetry::cfg(&mut s, ctx.cfg.odr_hz, ctx.cfg.burst_ms, ctx.cfg.hb_ms, ctx.cfg.stream_rate_hz).ok();
        sink.write_atomic(s.as_bytes());
        return;
    }
    if let Some(rest) = cmd_exact(line, CMD_SET_CFG) {
        let args = pad(rest, &mut buf);
        cmd_set_cfg(ctx, sensor, live, sink, args);
        return;
    }
    if let Some(rest) = cmd_exact(line, CMD_HB) {
        let args = pad(rest, &mut buf);
        cmd_hb(ctx, sink, args);
        return;
    }
    if let Some(rest) = cmd_exact(line, CMD_TIME_SYNC) {
        let args = pad(rest, &mut buf);
        cmd_time_sync(ctx, sink, args, now_ms);
        return;
    }
    if cmd_exact(line, CMD_STREAM_START).is_some() {
        cmd_stream_start(ctx, sensor, live, sink);
        return;
    }
    if cmd_exact(line, CMD_STREAM_STOP).is_some() {
        cmd_stream_stop(ctx, sensor, sink);
        return;
    }
    if cmd_exact(line, CMD_GET_TRG).is_some() {
        let mut s = heapless::String::<MSG_BUF>::new();
        telemetry::trg_settings(
            &mut s,
            ctx.trigger_settings.k_mult,
            ctx.trigger_settings.win_ms,
            ctx.trigger_settings.hold_ms,
        )
        .ok();
        sink.write_atomic(s.as_bytes());
        return;
    }
    if let Some(rest) = cmd_exact(line, CMD_SET_TRG) {
        let args = pad(rest, &mut buf);
        cmd_set_trg(ctx, sink, args);
        return;
    }
    if let Some(rest) = cmd_exact(line, CMD_MODE) {
        let args = pad(rest, &mut buf);
        cmd_mode(ctx, sensor, sink, args, now_ms);
        return;
    }
    if let Some(rest) = cmd_exact(line, CMD_CAL_READY) {
        let args = pad(rest, &mut buf);
        cmd_cal_ready(ctx, sensor, sink, args, now_ms);
        return;
    }
    if cmd_exact(line, CMD_ARM).is_some() {
        cmd_arm(ctx, sensor, sink, now_ms);
        return;
    }
    if let Some(rest) = cmd_exact(line, CMD_START_BURST_WEIGHT) {
        let args = pad(rest, &mut buf);
        cmd_start_burst_weight(ctx, burst, sensor, sink, args, now_ms);
        return;
    }
    if let Some(rest) = cmd_exact(line, CMD_START_BURST_DAMPING) {
        let args = pad(rest, &mut buf);
        cmd_start_burst_damping(ctx, sink, args, now_ms);
        return;
    }
    if cmd_exact(line, CMD_GET_PREVIEW).is_some() {
        cmd_get_preview(ctx, sensor, sink);
        return;
    }
    if cmd_exact(line, CMD_GET_DIAG).is_some() {
        cmd_get_diag(ctx, sink);
        return;
    }
    if cmd_exact(line, CMD_REBOOT).is_some() {
        ctx.reboot_requested = true;
        emit_ack(sink, CMD_REBOOT);
        return;
    }
    if let Some(rest) = cmd_exact(line, CMD_STOP) {
        let args = pad(rest, &mut buf);
        cmd_stop(ctx, burst, sensor, sink, args);
        return;
    }
    if cmd_exact(line, CMD_ZERO).is_some() {
        cmd_zero(ctx, sensor, sink, now_ms);
        return;
    }
    if let Some(rest) = cmd_exact(line, CMD_ADXL_ST) {
        let args = pad(rest, &mut buf);
        cmd_adxl_st(ctx, sensor, sink, args);
        return;
    }
    if cmd_exact(line, CMD_DIAG_HW_TEST).is_some() {
        cmd_diag_hw_test(ctx, sink, ring_len);
        return;
    }
    if cfg!(feature = "test-hooks") && cmd_exact(line, CMD_TEST_FORCE_TRIGGER).is_some() {
        cmd_test_force_trigger(ctx, sink);
        return;
    }

    emit_nack(sink, "UNKNOWN", Error::UnknownCommand);
}

// --- command handlers --------------------------------------------------

fn cmd_hello(ctx: &mut AppContext, burst: &mut BurstManager, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink) {
    if ctx.sampling_active {
        sensor.stop();
        ctx.sampling_active = false;
    }
    burst.abort(999);
    ctx.trg_state = TrgState::Idle;
    ctx.calibration.reset();
    if let Some(id) = ctx.countdown.stop() {
        emit_countdown_id(sink, id);
    }
    ctx.pending_burst = None;
    ctx.on_hello();

    let mut s = heapless::String::<MSG_BUF>::new();
    telemetry::hello_ack(&mut s, ctx.blocks_cfg.window, ctx.blocks_cfg.lines).ok();
    sink.write_atomic(s.as_bytes());
    emit_status(ctx, sink);
}

fn cmd_set_cfg(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, live: &mut LiveStreamer, sink: &mut dyn ByteSink, args: &[u8]) {
    let odr_hz = find_field(args, "odr_hz").and_then(parse_u32).map(|(v, _)| v);
    let burst_ms = find_field(args, "burst_ms").and_then(parse_u32).map(|(v, _)| v);
    let hb_ms = find_field(args, "hb_ms").and_then(parse_u32).map(|(v, _)| v);
    let stream_rate_hz = find_field(args, "stream_rate_hz").and_then(parse_u32).map(|(v, _)| v);

    match ctx.cfg.apply(odr_hz, burst_ms, hb_ms, stream_rate_hz) {
        Ok(()) => {
            let snapped = sensor.snap_odr(ctx.cfg.odr_hz);
            sensor.set_odr(snapped);
            if ctx.cfg.stream_rate_hz != 0 {
                live.set_divider(ctx.cfg.odr_hz / ctx.cfg.stream_rate_hz);
            }
            emit_ack(sink, CMD_SET_CFG);
        }
        Err(e) => emit_nack(sink, CMD_SET_CFG, e),
    }
}

fn cmd_hb(ctx: &mut AppContext, sink: &mut dyn ByteSink, args: &[u8]) {
    if has_flag(args, "OFF") {
        let _ = ctx.cfg.apply(None, None, Some(0), None);
        emit_ack(sink, CMD_HB);
        return;
    }
    if has_flag(args, "ON") {
        let _ = ctx.cfg.apply(None, None, Some(DEFAULT_HB_MS), None);
        emit_ack(sink, CMD_HB);
        return;
    }
    if let Some((ms, _)) = find_field(args, "ms").and_then(parse_u32) {
        match ctx.cfg.apply(None, None, Some(ms), None) {
            Ok(()) => emit_ack(sink, CMD_HB),
            Err(e) => emit_nack(sink, CMD_HB, e),
        }
        return;
    }
    emit_nack(sink, CMD_HB, Error::BadArg);
}

fn cmd_time_sync(ctx: &mut AppContext, sink: &mut dyn ByteSink, args: &[u8], now_ms: u32) {
    match find_field(args, "host_ms").and_then(parse_u64) {
        Some((host_ms, _)) => {
            ctx.time_sync.set(host_ms, now_ms.wrapping_mul(1000));
            emit_ack(sink, CMD_TIME_SYNC);
        }
        None => emit_nack(sink, CMD_TIME_SYNC, Error::BadArg),
    }
}

fn cmd_stream_start(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, live: &mut LiveStreamer, sink: &mut dyn ByteSink) {
    if ctx.op_mode != OpMode::Idle {
        emit_nack(sink, CMD_STREAM_START, Error::BadState);
        return;
    }
    if ctx.cfg.stream_rate_hz == 0 || ctx.cfg.odr_hz % ctx.cfg.stream_rate_hz != 0 {
        emit_nack(sink, CMD_STREAM_START, Error::ParamRange);
        return;
    }
    let div = ctx.cfg.odr_hz / ctx.cfg.stream_rate_hz;
    live.set_divider(div);
    sensor.start();
    ctx.sampling_active = true;
    ctx.set_op_mode(OpMode::Streaming);

    let mut s = heapless::String::<MSG_BUF>::new();
    telemetry::stream_start_ack(&mut s, ctx.cfg.stream_rate_hz, div).ok();
    sink.write_atomic(s.as_bytes());
    emit_status(ctx, sink);
}

fn cmd_stream_stop(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink) {
    if ctx.op_mode == OpMode::Streaming {
        sensor.stop();
        ctx.sampling_active = false;
        ctx.set_op_mode(OpMode::Idle);
        emit_ack(sink, CMD_STREAM_STOP);
        emit_status(ctx, sink);
    } else {
        emit_ack(sink, CMD_STREAM_STOP);
    }
}

fn cmd_set_trg(ctx: &mut AppContext, sink: &mut dyn ByteSink, args: &[u8]) {
    let k_mult = find_field(args, "k_mult").and_then(parse_float_fixed3).map(|(v, _)| v);
    let win_ms = find_field(args, "win_ms").and_then(parse_u32).map(|(v, _)| v);
    let hold_ms = find_field(args, "hold_ms").and_then(parse_u32).map(|(v, _)| v);

    match ctx.trigger_settings.apply(k_mult, win_ms, hold_ms) {
        Ok(()) => emit_ack(sink, CMD_SET_TRG),
        Err(e) => emit_nack(sink, CMD_SET_TRG, e),
    }
}

fn cmd_mode(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, args: &[u8], now_ms: u32) {
    if has_flag(args, "TRIGGER_ON") {
        if ctx.op_mode != OpMode::Idle {
            emit_nack(sink, CMD_MODE, Error::BadState);
            return;
        }
        if let Some((cd, _)) = find_field(args, "cd_s").and_then(parse_u32) {
            if !(5..=10).contains(&cd) {
                emit_nack(sink, CMD_MODE, Error::ParamRange);
                return;
            }
        }
        ctx.set_op_mode(OpMode::WaitCalZero);
        emit_ack(sink, CMD_MODE);
        let mut s = heapless::String::<MSG_BUF>::new();
        telemetry::cal_info_hold_zero(&mut s, REF_CAPTURE_DURATION_MS).ok();
        sink.write_atomic(s.as_bytes());
        emit_status(ctx, sink);
        return;
    }
    if has_flag(args, "TRIGGER_OFF") {
        cmd_trigger_off(ctx, sensor, sink);
        return;
    }
    emit_nack(sink, CMD_MODE, Error::BadArg);
}

fn cmd_trigger_off(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink) {
    match ctx.op_mode {
        OpMode::WaitCalZero | OpMode::TrgCalZero | OpMode::WaitArm | OpMode::Armed => {
            if ctx.sampling_active {
                sensor.stop();
                ctx.sampling_active = false;
            }
            ctx.capture = None;
            ctx.capture_phase = None;
            if let Some(id) = ctx.countdown.stop() {
                emit_countdown_id(sink, id);
            }
            ctx.pending_burst = None;
            ctx.trg_state = TrgState::Idle;
            ctx.set_op_mode(OpMode::Idle);
            emit_ack(sink, CMD_MODE);
            emit_status(ctx, sink);
        }
        _ => emit_ack(sink, CMD_MODE),
    }
}

fn cmd_cal_ready(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, args: &[u8], now_ms: u32) {
    if ctx.op_mode != OpMode::WaitCalZero {
        emit_nack(sink, CMD_CAL_READY, Error::BadState);
        return;
    }
    let phase_ok = find_field(args, "phase")
        .map(|rest| rest.starts_with(b"hold_zero") && matches!(rest.get(b"hold_zero".len()), None | Some(0) | Some(b',')))
        .unwrap_or(false);
    if !phase_ok {
        emit_nack(sink, CMD_CAL_READY, Error::BadArg);
        return;
    }

    ctx.set_op_mode(OpMode::TrgCalZero);
    sensor.start();
    ctx.sampling_active = true;
    let id = ctx.countdown.start(5, now_ms);

    emit_ack(sink, CMD_CAL_READY);
    emit_status(ctx, sink);
    emit_countdown_id(sink, id);
}

fn cmd_arm(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, now_ms: u32) {
    if ctx.op_mode == OpMode::Armed {
        emit_ack(sink, CMD_ARM);
        return;
    }
    if ctx.op_mode != OpMode::WaitArm {
        emit_nack(sink, CMD_ARM, Error::BadState);
        return;
    }
    if !ctx.calibration.is_calibrated() {
        emit_nack(sink, CMD_ARM, Error::ZeroNotCalibrated);
        return;
    }
    sensor.start();
    ctx.sampling_active = true;
    ctx.capture = Some(Capture::new(now_ms, REF_CAPTURE_DURATION_MS));
    ctx.capture_phase = Some(CapturePhase::Arm);
    emit_ack(sink, CMD_ARM);
}

fn cmd_start_burst_weight(
    ctx: &mut AppContext,
    burst: &mut BurstManager,
    sensor: &mut dyn AccelSensor,
    sink: &mut dyn ByteSink,
    args: &[u8],
    now_ms: u32,
) {
    if ctx.op_mode != OpMode::Idle {
        emit_nack(sink, CMD_START_BURST_WEIGHT, Error::BadState);
        return;
    }
    let cycles = match find_field(args, "cycles").and_then(parse_u32) {
        Some((v, _)) if (1..=1024).contains(&v) => v,
        Some(_) => {
            emit_nack(sink, CMD_START_BURST_WEIGHT, Error::ParamRange);
            return;
        }
        None => {
            emit_nack(sink, CMD_START_BURST_WEIGHT, Error::BadArg);
            return;
        }
    };

    let id = ctx.next_burst_id();
    sensor.start();
    ctx.sampling_active = true;
    let ts0 = sensor.ticks_to_us(0);
    burst.start_with_count(id, BurstKind::Weight, cycles as u16, ctx.cfg.odr_hz, OpMode::Idle, ts0, now_ms);
    ctx.set_op_mode(OpMode::Burst);

    emit_ack(sink, CMD_START_BURST_WEIGHT);
    emit_status(ctx, sink);
}

fn cmd_start_burst_damping(ctx: &mut AppContext, sink: &mut dyn ByteSink, args: &[u8], now_ms: u32) {
    if ctx.op_mode != OpMode::Idle {
        emit_nack(sink, CMD_START_BURST_DAMPING, Error::BadState);
        return;
    }
    let seconds = match find_field(args, "seconds").and_then(parse_u32) {
        Some((v, _)) if (1..=600).contains(&v) => v,
        Some(_) => {
            emit_nack(sink, CMD_START_BURST_DAMPING, Error::ParamRange);
            return;
        }
        None => {
            emit_nack(sink, CMD_START_BURST_DAMPING, Error::BadArg);
            return;
        }
    };

    let id = ctx.next_burst_id();
    ctx.pending_burst = Some(PendingBurst {
        id,
        kind: BurstKind::DampCd,
        budget_ms: seconds * 1000,
        odr_hz: ctx.cfg.odr_hz,
        mode_before: OpMode::Idle,
    });
    ctx.set_op_mode(OpMode::Countdown);
    let cid = ctx.countdown.start(5, now_ms);

    emit_ack(sink, CMD_START_BURST_DAMPING);
    emit_status(ctx, sink);
    emit_countdown_id(sink, cid);
}

fn cmd_get_preview(ctx: &AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink) {
    if ctx.op_mode != OpMode::Idle {
        emit_nack(sink, CMD_GET_PREVIEW, Error::BadState);
        return;
    }
    let mut samples = [Sample::default(); PREVIEW_MAX_SAMPLES];
    let n = sensor.preview_snapshot(&mut samples);

    let mut hdr = heapless::String::<MSG_BUF>::new();
    telemetry::preview_header(&mut hdr, n).ok();
    sink.write_atomic(hdr.as_bytes());

    for sample in &samples[..n] {
        let ts_us = sensor.ticks_to_us(sample.ts_ticks);
        let mut line = heapless::String::<MSG_BUF>::new();
        telemetry::preview_line(&mut line, ts_us, sample.x, sample.y, sample.z).ok();
        sink.write_atomic(line.as_bytes());
    }

    let mut end = heapless::String::<32>::new();
    telemetry::preview_end(&mut end).ok();
    sink.write_atomic(end.as_bytes());
}

fn cmd_get_diag(ctx: &AppContext, sink: &mut dyn ByteSink) {
    if cfg!(feature = "rxtx-debug") {
        let mut s = heapless::String::<MSG_BUF>::new();
        telemetry::diag(&mut s, &ctx.diag).ok();
        sink.write_atomic(s.as_bytes());
    } else {
        emit_nack(sink, CMD_GET_DIAG, Error::NotSupported);
    }
}

fn cmd_diag_hw_test(ctx: &AppContext, sink: &mut dyn ByteSink, ring_len: usize) {
    if !matches!(ctx.op_mode, OpMode::Idle | OpMode::WaitArm) {
        emit_nack(sink, CMD_DIAG_HW_TEST, Error::BadState);
        return;
    }
    let results = crate::diag::run_all(&ctx.hw_diag, ring_len, SampleRing::CAPACITY);
    for r in &results {
        let mut s = heapless::String::<MSG_BUF>::new();
        telemetry::diag_res(&mut s, r.test, r.desc, r.val, r.pass).ok();
        sink.write_atomic(s.as_bytes());
    }
}

fn cmd_stop(ctx: &mut AppContext, burst: &mut BurstManager, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, args: &[u8]) {
    let force = has_flag(args, "FORCE");
    if ctx.op_mode == OpMode::Armed && !force {
        emit_nack(sink, CMD_STOP, Error::BlockedWhileArmed);
        return;
    }
    emit_ack(sink, CMD_STOP);

    let was_armed = ctx.op_mode == OpMode::Armed;
    let burst_was_active = burst.is_active();
    if burst_was_active {
        if let Some(ev) = burst.abort(ABORT_CODE_USER_STOP) {
            apply_burst_abort(ctx, sensor, sink, ev);
        }
    }
    if ctx.sampling_active {
        sensor.stop();
        ctx.sampling_active = false;
    }
    ctx.trg_state = TrgState::Idle;
    ctx.capture = None;
    ctx.capture_phase = None;
    if let Some(id) = ctx.countdown.stop() {
        emit_countdown_id(sink, id);
    }
    ctx.pending_burst = None;

    if !burst_was_active {
        let target = if was_armed { OpMode::WaitArm } else { OpMode::Idle };
        ctx.set_op_mode(target);
        emit_status(ctx, sink);
    }
}

fn cmd_zero(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, now_ms: u32) {
    if ctx.op_mode != OpMode::Idle {
        emit_nack(sink, CMD_ZERO, Error::BadState);
        return;
    }
    sensor.start();
    ctx.sampling_active = true;
    ctx.capture = Some(Capture::new(now_ms, REF_CAPTURE_DURATION_MS));
    ctx.capture_phase = Some(CapturePhase::QuickZero);
    emit_ack(sink, CMD_ZERO);
}

fn cmd_adxl_st(ctx: &AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, args: &[u8]) {
    if ctx.op_mode != OpMode::Idle {
        emit_nack(sink, CMD_ADXL_ST, Error::BadState);
        return;
    }
    let avg = find_field(args, "avg").and_then(parse_u32).map(|(v, _)| v).unwrap_or(ADXL_ST_DEFAULT_AVG);
    let settle = find_field(args, "settle")
        .and_then(parse_u32)
        .map(|(v, _)| v)
        .unwrap_or(ADXL_ST_DEFAULT_SETTLE);
    let force_odr_hz = find_field(args, "force_odr_hz").and_then(parse_u32).map(|(v, _)| v);

    if !(1..=ADXL_ST_MAX_AVG).contains(&avg) || settle > ADXL_ST_MAX_SETTLE {
        emit_nack(sink, CMD_ADXL_ST, Error::ParamRange);
        return;
    }

    let effective_odr = force_odr_hz.unwrap_or(ADXL_ST_DEFAULT_ODR_HZ);
    let result = sensor.self_test(avg, settle, force_odr_hz);

    let mut cfg_line = heapless::String::<MSG_BUF>::new();
    telemetry::adxl_st_cfg(&mut cfg_line, ADXL345_DEVID, effective_odr, avg, settle).ok();
    sink.write_atomic(cfg_line.as_bytes());

    let mut raw_line = heapless::String::<MSG_BUF>::new();
    telemetry::adxl_st_raw(&mut raw_line, &result).ok();
    sink.write_atomic(raw_line.as_bytes());
}

#[cfg(feature = "test-hooks")]
fn cmd_test_force_trigger(ctx: &mut AppContext, sink: &mut dyn ByteSink) {
    if ctx.op_mode != OpMode::Armed {
        emit_nack(sink, CMD_TEST_FORCE_TRIGGER, Error::BadState);
        return;
    }
    ctx.test_trigger_flag = true;
    emit_ack(sink, CMD_TEST_FORCE_TRIGGER);
}

// --- the cooperative pump ------------------------------------------------

/// Drive every subsystem forward by one tick: drain the sample ring, pace
/// `HB`, service the BLOCKS transport and burst manager, advance any
/// in-progress ZERO/ARM capture, tick the countdown, and hand off any
/// pending `LIVE` frame. Called once per main-loop iteration, after the
/// dispatcher has processed its budgeted share of queued lines.
#[allow(clippy::too_many_arguments)]
pub fn pump(
    ctx: &mut AppContext,
    burst: &mut BurstManager,
    live: &mut LiveStreamer,
    ring: &mut SampleRing,
    sensor: &mut dyn AccelSensor,
    sink: &mut dyn ByteSink,
    now_ms: u32,
) {
    while let Some(sample) = ring.pop() {
        route_sample(ctx, burst, live, sensor, sink, sample, now_ms);
    }

    pump_heartbeat(ctx, burst, sink, now_ms);
    pump_burst(ctx, burst, sensor, sink, now_ms);
    pump_capture(ctx, sensor, sink, now_ms);
    pump_trigger_holdoff(ctx, now_ms);
    pump_countdown(ctx, burst, sensor, sink, now_ms);
    pump_live(ctx, live, sink);
}

fn route_sample(
    ctx: &mut AppContext,
    burst: &mut BurstManager,
    live: &mut LiveStreamer,
    sensor: &mut dyn AccelSensor,
    sink: &mut dyn ByteSink,
    sample: Sample,
    now_ms: u32,
) {
    if let Some(cap) = ctx.capture.as_mut() {
        cap.observe(sample.x, sample.y, sample.z, now_ms);
        return;
    }

    match ctx.op_mode {
        OpMode::Armed => {
            let forced = take_test_trigger_flag(ctx);
            let hit = if forced {
                Some(trigger::Exceeds {
                    diff_counts: 0,
                    th_counts: 0,
                })
            } else {
                trigger::exceeds(&ctx.calibration, &ctx.trigger_settings, sample.x, sample.y, sample.z)
            };
            if let Some(e) = hit {
                let ts_us = sensor.ticks_to_us(sample.ts_ticks);
                fire_trigger(ctx, burst, sink, e, ts_us, now_ms);
            }
        }
        OpMode::Burst => {
            let ts_us = sensor.ticks_to_us(sample.ts_ticks);
            if burst.feed(sample, ts_us, now_ms) {
                finish_collection(ctx, burst, sensor, sink);
            }
        }
        OpMode::Streaming => {
            live.observe(sample, |t| sensor.ticks_to_us(t), sink.tx_free());
        }
        _ => {}
    }
}

fn fire_trigger(ctx: &mut AppContext, burst: &mut BurstManager, sink: &mut dyn ByteSink, e: trigger::Exceeds, ts_us: u32, now_ms: u32) {
    ctx.trg_state = TrgState::Holdoff;
    ctx.last_trigger_event_ms = now_ms;
    let id = ctx.next_burst_id();

    let mut s = heapless::String::<MSG_BUF>::new();
    telemetry::trigger_edge(&mut s, id, ts_us, e.diff_counts, e.th_counts).ok();
    sink.write_atomic(s.as_bytes());

    burst.start(id, BurstKind::DampTrg, ctx.cfg.burst_ms, ctx.cfg.odr_hz, OpMode::WaitArm, ts_us, now_ms);
    ctx.set_op_mode(OpMode::Burst);
    emit_status(ctx, sink);
}

fn finish_collection(ctx: &mut AppContext, burst: &mut BurstManager, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink) {
    match burst.finish_collection() {
        BurstEvent::CollectionDone => {
            if let Some((kind, id, ts0, collected)) = burst.header_info() {
                let mut s = heapless::String::<MSG_BUF>::new();
                telemetry::data_header(&mut s, kind.wire_name(), id, ts0, collected as u32).ok();
                sink.write_atomic(s.as_bytes());
            }
            sensor.stop();
            ctx.sampling_active = false;
            ctx.set_op_mode(OpMode::BurstSending);
            emit_status(ctx, sink);
        }
        BurstEvent::WeightSummary {
            mean_ax_raw,
            median_ax_raw,
            mean_ms2,
            std_ms2,
        } => {
            let mut s = heapless::String::<MSG_BUF>::new();
            telemetry::summary(&mut s, mean_ax_raw, median_ax_raw, mean_ms2, std_ms2).ok();
            sink.write_atomic(s.as_bytes());
            sensor.stop();
            ctx.sampling_active = false;
            ctx.set_op_mode(OpMode::Idle);
            emit_status(ctx, sink);
        }
        _ => {}
    }
}

fn pump_heartbeat(ctx: &mut AppContext, burst: &BurstManager, sink: &mut dyn ByteSink, now_ms: u32) {
    if ctx.cfg.hb_ms == 0 {
        return;
    }
    if now_ms.wrapping_sub(ctx.last_hb_ms) < ctx.cfg.hb_ms {
        return;
    }
    ctx.last_hb_ms = now_ms;
    if burst.is_active() {
        ctx.diag.hb_pauses = ctx.diag.hb_pauses.wrapping_add(1);
        return;
    }
    let host = ctx.time_sync.host_time_ms(now_ms.wrapping_mul(1000));
    let mut s = heapless::String::<MSG_BUF>::new();
    telemetry::hb(&mut s, now_ms, host, sink.tx_free(), ctx.diag.tx_drops).ok();
    sink.write_atomic(s.as_bytes());
}

fn pump_burst(ctx: &mut AppContext, burst: &mut BurstManager, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, now_ms: u32) {
    if !burst.is_active() {
        return;
    }
    if burst.is_stalled(now_ms) {
        if let Some(ev) = burst.abort(500) {
            apply_burst_abort(ctx, sensor, sink, ev);
        }
        return;
    }
    if burst.is_collecting() {
        if burst.budget_elapsed(now_ms) {
            finish_collection(ctx, burst, sensor, sink);
        }
        return;
    }
    if let Some(abort) = burst.pump_transport(sink, now_ms) {
        if let Some(ev) = burst.abort(abort.0) {
            apply_burst_abort(ctx, sensor, sink, ev);
        }
        return;
    }
    if burst.transport_idle() {
        if let Some((_, id, _, collected)) = burst.header_info() {
            let started = burst.started_ms().unwrap_or(now_ms);
            let mut s = heapless::String::<MSG_BUF>::new();
            telemetry::complete(&mut s, id, collected as u32, 0, now_ms.wrapping_sub(started)).ok();
            sink.write_atomic(s.as_bytes());
        }
        burst.mark_awaiting_ack_complete();
    }
}

enum CaptureOutcome {
    TimeUp,
    Stalled,
}

fn pump_capture(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, now_ms: u32) {
    let Some(cap) = ctx.capture.as_ref() else {
        return;
    };
    if cap.is_stalled(now_ms) {
        finish_capture(ctx, sensor, sink, CaptureOutcome::Stalled);
    } else if cap.is_time_up(now_ms) {
        finish_capture(ctx, sensor, sink, CaptureOutcome::TimeUp);
    }
}

fn finish_capture(ctx: &mut AppContext, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, outcome: CaptureOutcome) {
    let cap = ctx.capture.take().expect("pump_capture only calls this with a capture present");
    let phase = ctx.capture_phase.take().expect("capture_phase mirrors capture");

    if let CaptureOutcome::Stalled = outcome {
        sensor.stop();
        ctx.sampling_active = false;
        let src = if phase == CapturePhase::Arm { "ARM" } else { "ZERO" };
        emit_error_msg(sink, src, 500, "sampling_stalled");
        match phase {
            CapturePhase::Zero => ctx.set_op_mode(OpMode::WaitCalZero),
            CapturePhase::Arm => ctx.set_op_mode(OpMode::WaitArm),
            CapturePhase::QuickZero => {}
        }
        emit_status(ctx, sink);
        return;
    }

    match phase {
        CapturePhase::Zero => match cap.finish_zero() {
            Some((mu, noise)) => {
                ctx.calibration.mu_zero = mu;
                ctx.calibration.noise_max = noise;
                sensor.stop();
                ctx.sampling_active = false;
                emit_cal_info(sink, "hold_zero_done");
                ctx.set_op_mode(OpMode::WaitArm);
                emit_status(ctx, sink);
            }
            None => {
                sensor.stop();
                ctx.sampling_active = false;
                emit_error_msg(sink, "ZERO", 500, "insufficient_samples");
                ctx.set_op_mode(OpMode::WaitCalZero);
                emit_status(ctx, sink);
            }
        },
        CapturePhase::QuickZero => match cap.finish_zero() {
            Some((mu, noise)) => {
                ctx.calibration.mu_zero = mu;
                ctx.calibration.noise_max = noise;
                sensor.stop();
                ctx.sampling_active = false;
                emit_cal_info(sink, "zero_done");
            }
            None => {
                sensor.stop();
                ctx.sampling_active = false;
                emit_error_msg(sink, "ZERO", 500, "insufficient_samples");
            }
        },
        CapturePhase::Arm => match cap.finish_arm() {
            Some(mu) => {
                ctx.calibration.mu_arm = mu;
                ctx.trg_state = TrgState::Armed;
                ctx.set_op_mode(OpMode::Armed);
                emit_status(ctx, sink);
            }
            None => {
                sensor.stop();
                ctx.sampling_active = false;
                emit_error_msg(sink, "ARM", 500, "insufficient_samples");
                ctx.set_op_mode(OpMode::WaitArm);
                emit_status(ctx, sink);
            }
        },
    }
}

/// `TrgState`'s independent holdoff timer: returns to `Armed` once
/// `hold_ms` has elapsed since the last fired edge, regardless of what
/// `op_mode` is doing concurrently (see DESIGN.md on this Open Question).
fn pump_trigger_holdoff(ctx: &mut AppContext, now_ms: u32) {
    if ctx.trg_state == TrgState::Holdoff && now_ms.wrapping_sub(ctx.last_trigger_event_ms) >= ctx.trigger_settings.hold_ms {
        ctx.trg_state = TrgState::Armed;
    }
}

fn pump_countdown(ctx: &mut AppContext, burst: &mut BurstManager, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, now_ms: u32) {
    let was_active = ctx.countdown.is_active();
    if let Some(id) = ctx.countdown.tick(now_ms) {
        emit_countdown_id(sink, id);
        return;
    }
    if was_active && !ctx.countdown.is_active() {
        handle_countdown_finished(ctx, burst, sensor, sink, now_ms);
    }
}

fn handle_countdown_finished(ctx: &mut AppContext, burst: &mut BurstManager, sensor: &mut dyn AccelSensor, sink: &mut dyn ByteSink, now_ms: u32) {
    match ctx.op_mode {
        OpMode::TrgCalZero => {
            ctx.capture = Some(Capture::new(now_ms, REF_CAPTURE_DURATION_MS));
            ctx.capture_phase = Some(CapturePhase::Zero);
        }
        OpMode::Countdown => {
            if let Some(p) = ctx.pending_burst.take() {
                sensor.start();
                ctx.sampling_active = true;
                let ts0 = sensor.ticks_to_us(0);
                burst.start(p.id, p.kind, p.budget_ms, p.odr_hz, p.mode_before, ts0, now_ms);
                ctx.set_op_mode(OpMode::Burst);
                emit_status(ctx, sink);
            }
        }
        _ => {}
    }
}

fn pump_live(ctx: &AppContext, live: &mut LiveStreamer, sink: &mut dyn ByteSink) {
    if ctx.op_mode != OpMode::Streaming {
        return;
    }
    if let Some(frame) = live.take() {
        let mut s = heapless::String::<MSG_BUF>::new();
        telemetry::live(&mut s, frame.seq, frame.x, frame.y, frame.z, frame.ts_us).ok();
        sink.write_atomic(s.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::string::String as StdString;
    use std::vec::Vec as StdVec;

    struct FakeSink {
        sent: RefCell<StdVec<StdString>>,
    }

    impl FakeSink {
        fn new() -> Self {
            Self {
                sent: RefCell::new(StdVec::new()),
            }
        }

        fn last(&self) -> StdString {
            self.sent.borrow().last().cloned().unwrap_or_default()
        }

        fn all(&self) -> StdVec<StdString> {
            self.sent.borrow().clone()
        }
    }

    impl ByteSink for FakeSink {
        fn write_atomic(&mut self, bytes: &[u8]) -> usize {
            self.sent.borrow_mut().push(StdString::from_utf8_lossy(bytes).into_owned());
            bytes.len()
        }
        fn write_blocking(&mut self, bytes: &[u8]) {
            self.write_atomic(bytes);
        }
        fn tx_is_idle(&self) -> bool {
            true
        }
        fn tx_free(&self) -> u16 {
            4096
        }
        fn tx_usage(&self) -> u16 {
            0
        }
    }

    struct FakeSensor {
        samples: VecDeque<Sample>,
    }

    impl FakeSensor {
        fn new() -> Self {
            Self { samples: VecDeque::new() }
        }
    }

    impl AccelSensor for FakeSensor {
        fn snap_odr(&mut self, req: u32) -> u32 {
            req
        }
        fn set_odr(&mut self, _hz: u32) {}
        fn start(&mut self) {}
        fn stop(&mut self) {}
        fn get_sample(&mut self) -> Option<Sample> {
            self.samples.pop_front()
        }
        fn ticks_to_us(&self, ticks: u32) -> u32 {
            ticks
        }
        fn preview_snapshot(&self, _out: &mut [Sample]) -> usize {
            0
        }
        fn offset_calibrate(&mut self) {}
        fn self_test(&mut self, _avg: u32, _settle: u32, _force_odr_hz: Option<u32>) -> crate::hal::SelfTestResult {
            crate::hal::SelfTestResult::default()
        }
        fn convert_to_mps2(&self, raw: (i16, i16, i16)) -> (f32, f32, f32) {
            crate::sensor::convert_to_mps2(raw)
        }
    }

    fn dispatch(line: &[u8], ctx: &mut AppContext, burst: &mut BurstManager, live: &mut LiveStreamer, sensor: &mut FakeSensor, sink: &mut FakeSink) {
        dispatch_line(line, ctx, burst, live, sensor, sink, 0, 0);
    }

    #[test]
    fn hello_then_status_reports_idle() {
        let mut ctx = AppContext::new();
        let mut burst = BurstManager::new();
        let mut live = LiveStreamer::new(1);
        let mut sensor = FakeSensor::new();
        let mut sink = FakeSink::new();

        dispatch(b"HELLO", &mut ctx, &mut burst, &mut live, &mut sensor, &mut sink);
        let lines = sink.all();
        assert!(lines[0].starts_with("HELLO_ACK"));
        assert!(lines[1].starts_with("STATUS,op=IDLE"));
    }

    #[test]
    fn unknown_command_is_nacked() {
        let mut ctx = AppContext::new();
        let mut burst = BurstManager::new();
        let mut live = LiveStreamer::new(1);
        let mut sensor = FakeSensor::new();
        let mut sink = FakeSink::new();

        dispatch(b"BOGUS_VERB", &mut ctx, &mut burst, &mut live, &mut sensor, &mut sink);
        assert_eq!(sink.last(), "NACK,SUBJECT=UNKNOWN,reason=unknown_command,code=100\r\n");
    }

    #[test]
    fn set_cfg_rejects_bad_stream_divisor_and_keeps_prior_value() {
        let mut ctx = AppContext::new();
        let mut burst = BurstManager::new();
        let mut live = LiveStreamer::new(1);
        let mut sensor = FakeSensor::new();
        let mut sink = FakeSink::new();

        dispatch(b"SET_CFG,stream_rate_hz=300", &mut ctx, &mut burst, &mut live, &mut sensor, &mut sink);
        assert!(sink.last().starts_with("NACK,SUBJECT=SET_CFG,reason=param_range"));
        assert_ne!(ctx.cfg.stream_rate_hz, 300);
    }

    #[test]
    fn set_cfg_applies_multiple_fields_in_any_order() {
        let mut ctx = AppContext::new();
        let mut burst = BurstManager::new();
        let mut live = LiveStreamer::new(1);
        let mut sensor = FakeSensor::new();
        let mut sink = FakeSink::new();

        dispatch(b"SET_CFG,hb_ms=500,odr_hz=200", &mut ctx, &mut burst, &mut live, &mut sensor, &mut sink);
        assert_eq!(sink.last(), "ACK,SUBJECT=SET_CFG\r\n");
        assert_eq!(ctx.cfg.hb_ms, 500);
        assert_eq!(ctx.cfg.odr_hz, 200);
    }

    #[test]
    fn stop_while_armed_without_force_is_blocked() {
        let mut ctx = AppContext::new();
        ctx.set_op_mode(OpMode::Armed);
        ctx.take_mode_dirty();
        let mut burst = BurstManager::new();
        let mut live = LiveStreamer::new(1);
        let mut sensor = FakeSensor::new();
        let mut sink = FakeSink::new();

        dispatch(b"STOP", &mut ctx, &mut burst, &mut live, &mut sensor, &mut sink);
        assert_eq!(sink.last(), "NACK,SUBJECT=STOP,reason=blocked_while_armed,code=201\r\n");
        assert_eq!(ctx.op_mode, OpMode::Armed);

        dispatch(b"STOP,FORCE", &mut ctx, &mut burst, &mut live, &mut sensor, &mut sink);
        assert_eq!(ctx.op_mode, OpMode::WaitArm);
    }

    #[test]
    fn arm_requires_calibration() {
        let mut ctx = AppContext::new();
        ctx.set_op_mode(OpMode::WaitArm);
        ctx.take_mode_dirty();
        let mut sensor = FakeSensor::new();
        let mut sink = FakeSink::new();

        cmd_arm(&mut ctx, &mut sensor, &mut sink, 0);
        assert_eq!(sink.last(), "NACK,SUBJECT=ARM,reason=zero_not_calibrated,code=104\r\n");

        ctx.calibration.noise_max = [5, 5, 5];
        cmd_arm(&mut ctx, &mut sensor, &mut sink, 0);
        assert_eq!(sink.last(), "ACK,SUBJECT=ARM\r\n");
        assert!(ctx.capture.is_some());
    }

    #[test]
    fn blocks_hook_consumes_ack_blk_without_reaching_dispatch() {
        let mut ctx = AppContext::new();
        let mut burst = BurstManager::new();
        burst.start(1, BurstKind::DampCd, 1000, 100, OpMode::Idle, 0, 0);
        for i in 0..5u16 {
            burst.feed(
                Sample {
                    x: i as i16,
                    y: 0,
                    z: 0,
                    ts_ticks: i as u32,
                },
                i as u32,
                0,
            );
        }
        burst.finish_collection();

        let mut live = LiveStreamer::new(1);
        let mut sensor = FakeSensor::new();
        let mut sink = FakeSink::new();
        dispatch(b"ACK_BLK,blk=1", &mut ctx, &mut burst, &mut live, &mut sensor, &mut sink);
        // Consumed by the BLOCKS hook: no NACK/ACK line was produced at all.
        assert!(sink.all().is_empty());
    }

    #[test]
    fn weight_burst_runs_to_summary_via_pump() {
        let mut ctx = AppContext::new();
        let mut burst = BurstManager::new();
        let mut live = LiveStreamer::new(1);
        let mut sensor = FakeSensor::new();
        let mut sink = FakeSink::new();
        let mut ring = SampleRing::new();

        dispatch(b"START_BURST_WEIGHT,cycles=4", &mut ctx, &mut burst, &mut live, &mut sensor, &mut sink);
        assert_eq!(ctx.op_mode, OpMode::Burst);

        for v in [10i16, 20, 30, 40] {
            ring.push(Sample {
                x: v,
                y: 0,
                z: 0,
                ts_ticks: 0,
            });
        }
        pump(&mut ctx, &mut burst, &mut live, &mut ring, &mut sensor, &mut sink, 0);

        assert!(sink.all().iter().any(|l| l.starts_with("SUMMARY,")));
        assert_eq!(ctx.op_mode, OpMode::Idle);
    }

    #[test]
    fn stop_during_countdown_emits_cancel_id() {
        let mut ctx = AppContext::new();
        ctx.set_op_mode(OpMode::Idle);
        ctx.take_mode_dirty();
        let mut burst = BurstManager::new();
        let mut live = LiveStreamer::new(1);
        let mut sensor = FakeSensor::new();
        let mut sink = FakeSink::new();

        dispatch(b"START_BURST_DAMPING,seconds=5", &mut ctx, &mut burst, &mut live, &mut sensor, &mut sink);
        assert_eq!(ctx.op_mode, OpMode::Countdown);
        assert!(sink.all().iter().any(|l| l.starts_with("COUNTDOWN_ID,id=5")));

        dispatch(b"STOP", &mut ctx, &mut burst, &mut live, &mut sensor, &mut sink);
        assert!(sink.all().iter().any(|l| l.starts_with("COUNTDOWN_ID,id=0")));
        assert!(!ctx.countdown.is_active());
    }

    #[test]
    fn damping_burst_closes_on_budget_elapsed_short_of_target() {
        let mut ctx = AppContext::new();
        let mut burst = BurstManager::new();
        let mut live = LiveStreamer::new(1);
        let mut sensor = FakeSensor::new();
        let mut sink = FakeSink::new();
        let mut ring = SampleRing::new();

        burst.start(1, BurstKind::DampCd, 100, 100, OpMode::Idle, 0, 0);
        ctx.set_op_mode(OpMode::Burst);
        ctx.sampling_active = true;
        ring.push(Sample { x: 1, y: 0, z: 0, ts_ticks: 0 });

        pump(&mut ctx, &mut burst, &mut live, &mut ring, &mut sensor, &mut sink, 100);

        assert!(sink.all().iter().any(|l| l.starts_with("DATA_HEADER,")));
        assert_eq!(ctx.op_mode, OpMode::BurstSending);
    }

    #[test]
    fn diag_hw_test_rejected_while_streaming() {
        let mut ctx = AppContext::new();
        ctx.set_op_mode(OpMode::Streaming);
        let mut sink = FakeSink::new();
        cmd_diag_hw_test(&ctx, &mut sink, 0);
        assert!(sink.last().starts_with("NACK,SUBJECT=DIAG_HW_TEST,reason=bad_state"));
    }

    #[test]
    fn line_too_long_reports_unknown_subject() {
        let mut sink = FakeSink::new();
        handle_too_long(&mut sink);
        assert_eq!(sink.last(), "NACK,SUBJECT=UNKNOWN,reason=line_too_long,code=300\r\n");
    }
}
