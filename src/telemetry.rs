//! Message formatting for every device-to-host line, plus the LED display
//! policy. Every format string is normative wire content (spec.md §6);
//! ported verbatim from `telemetry.c`.

use core::fmt::{self, Write};

use crate::context::OpMode;
use crate::proto::schema::{FW_VERSION, PROTO_EOL, PROTO_VERSION};
use crate::trigger::TrgState;

fn trg_state_str(s: TrgState) -> &'static str {
    match s {
        TrgState::Idle => "idle",
        TrgState::Armed => "armed",
        TrgState::Holdoff => "holdoff",
    }
}

pub fn op_mode_str(m: OpMode) -> &'static str {
    match m {
        OpMode::Init => "INIT",
        OpMode::Idle => "IDLE",
        OpMode::WaitCalZero => "WAIT_CAL_ZERO",
        OpMode::TrgCalZero => "TRG_CAL_ZERO",
        OpMode::WaitArm => "WAIT_ARM",
        OpMode::Armed => "ARMED",
        OpMode::Countdown => "COUNTDOWN",
        OpMode::Burst => "BURST",
        OpMode::BurstSending => "BURST_SENDING",
        OpMode::StaticRun => "STATIC_RUN",
        OpMode::Streaming => "STREAMING",
        OpMode::Error => "ERROR",
    }
}

/// `atan2(ay, ax)` in degrees, absolute value, used for the preview/weight
/// summary angle. No sign information is preserved, matching the original
/// `theta_deg_from_ms2`.
pub fn theta_deg_from_ms2(ax: f32, ay: f32) -> f32 {
    const RAD2DEG: f32 = 180.0 / core::f32::consts::PI;
    libm::atan2f(ay, ax).abs() * RAD2DEG
}

pub fn hello_ack(w: &mut impl Write, win: u8, blk_lines: u16) -> fmt::Result {
    write!(
        w,
        "HELLO_ACK,fw=\"{FW_VERSION}\",proto={PROTO_VERSION},win={win},blk_lines={blk_lines}{PROTO_EOL}"
    )
}

pub fn ack(w: &mut impl Write, subject: &str) -> fmt::Result {
    write!(w, "ACK,SUBJECT={subject}{PROTO_EOL}")
}

pub fn ack_extra(w: &mut impl Write, subject: &str, extra: fmt::Arguments) -> fmt::Result {
    write!(w, "ACK,SUBJECT={subject},")?;
    w.write_fmt(extra)?;
    write!(w, "{PROTO_EOL}")
}

pub fn nack(w: &mut impl Write, subject: &str, reason: &str, code: u32) -> fmt::Result {
    write!(w, "NACK,SUBJECT={subject},reason={reason},code={code}{PROTO_EOL}")
}

pub fn error(w: &mut impl Write, src: &str, code: u32, msg: &str) -> fmt::Result {
    write!(w, "ERROR,src={src},code={code},msg=\"{msg}\"{PROTO_EOL}")
}

pub fn status(w: &mut impl Write, mode: OpMode, trg: TrgState) -> fmt::Result {
    write!(
        w,
        "STATUS,op={},trg={},axis=MAG{PROTO_EOL}",
        op_mode_str(mode),
        trg_state_str(trg)
    )
}

pub fn cfg(
    w: &mut impl Write,
    odr_hz: u32,
    burst_ms: u32,
    hb_ms: u32,
    stream_rate_hz: u32,
) -> fmt::Result {
    write!(
        w,
        "CFG,odr_hz={odr_hz},burst_ms={burst_ms},hb_ms={hb_ms},stream_rate_hz={stream_rate_hz}{PROTO_EOL}"
    )
}

pub fn trg_settings(w: &mut impl Write, k_mult: f32, win_ms: u32, hold_ms: u32) -> fmt::Result {
    write!(
        w,
        "TRG_SETTINGS,k_mult={k_mult:.3},win_ms={win_ms},hold_ms={hold_ms}{PROTO_EOL}"
    )
}

#[allow(clippy::too_many_arguments)]
pub fn hb(
    w: &mut impl Write,
    tick_ms: u32,
    host_time: Option<u64>,
    tx_free: u16,
    tx_drop: u32,
) -> fmt::Result {
    write!(w, "HB,tick={tick_ms}")?;
    if let Some(host) = host_time {
        write!(w, ",host_hi={},host_lo={}", (host >> 32) as u32, host as u32)?;
    }
    write!(w, ",tx_free={tx_free},tx_drop={tx_drop}{PROTO_EOL}")
}

pub fn trigger_edge(
    w: &mut impl Write,
    burst_id: u32,
    ts_us: u32,
    val_raw: i32,
    th_raw: i32,
) -> fmt::Result {
    write!(
        w,
        "TRIGGER_EDGE,burst_id={burst_id},edge=RISING,ts_us={ts_us},val_raw={val_raw},th_raw={th_raw}{PROTO_EOL}"
    )
}

pub fn data_header(
    w: &mut impl Write,
    kind: &str,
    burst_id: u32,
    ts0_us: u32,
    samples: u32,
) -> fmt::Result {
    write!(
        w,
        "DATA_HEADER,type={kind},burst_id={burst_id},ts0_us={ts0_us},samples={samples},mode=CSV{PROTO_EOL}"
    )
}

pub fn complete(w: &mut impl Write, burst_id: u32, samples: u32, dropped: u32, time_ms: u32) -> fmt::Result {
    write!(
        w,
        "COMPLETE,burst_id={burst_id},samples={samples},dropped={dropped},time_ms={time_ms}{PROTO_EOL}"
    )
}

pub fn complete_aborted(w: &mut impl Write, burst_id: u32, code: u32) -> fmt::Result {
    write!(w, "COMPLETE,burst_id={burst_id},reason=aborted,code={code}{PROTO_EOL}")
}

pub fn countdown_id(w: &mut impl Write, id: u32) -> fmt::Result {
    write!(w, "COUNTDOWN_ID,id={id}{PROTO_EOL}")
}

pub fn cal_info(w: &mut impl Write, status: &str) -> fmt::Result {
    write!(w, "CAL_INFO,status={status}{PROTO_EOL}")
}

pub fn cal_info_hold_zero(w: &mut impl Write, duration_ms: u32) -> fmt::Result {
    write!(
        w,
        "CAL_INFO,status=hold_zero,duration_ms={duration_ms},instr_id=HOLD_ZERO{PROTO_EOL}"
    )
}

pub fn live(w: &mut impl Write, seq: u32, ax: i16, ay: i16, az: i16, ts_us: u32) -> fmt::Result {
    write!(w, "LIVE,seq={seq},ax={ax},ay={ay},az={az},ts_us={ts_us}{PROTO_EOL}")
}

#[allow(clippy::too_many_arguments)]
pub fn summary(
    w: &mut impl Write,
    mean_ax_raw: f32,
    median_ax_raw: f32,
    mean_ms2: f32,
    std_ms2: f32,
) -> fmt::Result {
    write!(
        w,
        "SUMMARY,mean_ax_raw={mean_ax_raw:.3},median_ax_raw={median_ax_raw:.3},mean_ms2={mean_ms2:.3},std_ms2={std_ms2:.3},delta_vinkel_deg=0.000{PROTO_EOL}"
    )
}

pub fn data_line(
    w: &mut impl Write,
    ts_us: u32,
    ax: f32,
    ay: f32,
    az: f32,
    theta_deg: f32,
) -> fmt::Result {
    write!(w, "DATA,{ts_us},{ax:.3},{ay:.3},{az:.3},{theta_deg:.3}{PROTO_EOL}")
}

pub fn stream_start_ack(w: &mut impl Write, rate_hz: u32, div: u32) -> fmt::Result {
    write!(w, "ACK,SUBJECT=STREAM_START,rate_hz={rate_hz},div={div}{PROTO_EOL}")
}

pub fn preview_header(w: &mut impl Write, samples: usize) -> fmt::Result {
    write!(w, "PREVIEW_HEADER,samples={samples}{PROTO_EOL}")
}

pub fn preview_line(w: &mut impl Write, ts_us: u32, x: i16, y: i16, z: i16) -> fmt::Result {
    write!(w, "PREVIEW,ts_us={ts_us},x={x},y={y},z={z}{PROTO_EOL}")
}

pub fn preview_end(w: &mut impl Write) -> fmt::Result {
    write!(w, "PREVIEW_END{PROTO_EOL}")
}

#[allow(clippy::too_many_arguments)]
pub fn adxl_st_cfg(w: &mut impl Write, devid: u8, odr_hz: u32, avg: u32, settle: u32) -> fmt::Result {
    write!(w, "ADXL_ST_CFG,devid=0x{devid:02X},odr_hz={odr_hz},avg={avg},settle={settle}{PROTO_EOL}")
}

#[allow(clippy::too_many_arguments)]
pub fn adxl_st_raw(
    w: &mut impl Write,
    r: &crate::hal::SelfTestResult,
) -> fmt::Result {
    write!(
        w,
        "ADXL_ST_RAW,x_off={},y_off={},z_off={},x_on={},y_on={},z_on={},x_st={},y_st={},z_st={},health={}{PROTO_EOL}",
        r.x_off, r.y_off, r.z_off, r.x_on, r.y_on, r.z_on, r.x_st, r.y_st, r.z_st,
        if r.health_pass { "PASS" } else { "FAIL" }
    )
}

pub fn adxl_st_raw_failed(w: &mut impl Write, reason: &str) -> fmt::Result {
    write!(w, "ADXL_ST_RAW,health={reason}{PROTO_EOL}")
}

#[allow(clippy::too_many_arguments)]
pub fn diag(
    w: &mut impl Write,
    d: &crate::diag::DiagCounters,
) -> fmt::Result {
    write!(
        w,
        "DIAG,i2c_fail={},ring_ovf={},live_drops={},hb_pauses={},tx_drops={},rx_overflow={}{PROTO_EOL}",
        d.i2c_fail, d.ring_ovf, d.live_drops, d.hb_pauses, d.tx_drops, d.rx_overflow
    )
}

pub fn diag_res(w: &mut impl Write, test: &str, desc: &str, val: i64, pass: bool) -> fmt::Result {
    write!(
        w,
        "DIAG_RES,test={test},desc=\"{desc}\",val={val},pass={}{PROTO_EOL}",
        if pass { "PASS" } else { "FAIL" }
    )
}

/// LED on/off for the current mode and elapsed time, ported line for line
/// from `Telemetry_UpdateLED`. The caller (RTIC binary) writes the
/// returned state to the physical pin.
pub fn led_pattern(mode: OpMode, tick_ms: u32) -> bool {
    match mode {
        OpMode::Init => true,
        OpMode::Idle => false,
        OpMode::TrgCalZero => (tick_ms / 250) % 2 == 0, // 2 Hz blink
        OpMode::Burst | OpMode::BurstSending | OpMode::Countdown => (tick_ms / 50) % 2 == 0, // 10 Hz
        OpMode::Armed => (tick_ms % 1000) < 100, // slow heartbeat
        OpMode::WaitCalZero | OpMode::WaitArm => (tick_ms % 2000) < 100, // short flash every 2s
        OpMode::StaticRun | OpMode::Streaming | OpMode::Error => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_ack_matches_banner() {
        let mut s = heapless::String::<128>::new();
        hello_ack(&mut s, 4, 128).unwrap();
        assert_eq!(s.as_str(), "HELLO_ACK,fw=\"3.3.7\",proto=3.3.3,win=4,blk_lines=128\r\n");
    }

    #[test]
    fn status_line_format() {
        let mut s = heapless::String::<64>::new();
        status(&mut s, OpMode::Idle, TrgState::Idle).unwrap();
        assert_eq!(s.as_str(), "STATUS,op=IDLE,trg=idle,axis=MAG\r\n");
    }

    #[test]
    fn summary_always_zero_angle_delta() {
        let mut s = heapless::String::<128>::new();
        summary(&mut s, 1.0, 2.0, 3.0, 0.5).unwrap();
        assert!(s.ends_with("delta_vinkel_deg=0.000\r\n"));
    }

    #[test]
    fn led_pattern_solid_in_init_off_in_idle() {
        assert!(led_pattern(OpMode::Init, 0));
        assert!(!led_pattern(OpMode::Idle, 12345));
    }

    #[test]
    fn stream_start_ack_carries_rate_and_divider() {
        let mut s = heapless::String::<64>::new();
        stream_start_ack(&mut s, 100, 8).unwrap();
        assert_eq!(s.as_str(), "ACK,SUBJECT=STREAM_START,rate_hz=100,div=8\r\n");
    }

    #[test]
    fn adxl_st_raw_reports_health_verdict() {
        let mut s = heapless::String::<160>::new();
        let r = crate::hal::SelfTestResult {
            health_pass: true,
            ..Default::default()
        };
        adxl_st_raw(&mut s, &r).unwrap();
        assert!(s.ends_with("health=PASS\r\n"));
    }
}
