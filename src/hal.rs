//! Interfaces to the external collaborators that stay out of scope: chip
//! register programming, DMA/UART driver internals, clock configuration,
//! and GPIO. The core library only ever talks to these traits; the RTIC
//! binary (`src/bin/vibra-node.rs`) is the only place a concrete HAL type
//! is named, the same separation `stabilizer::hardware` draws between
//! `stabilizer::hardware::hal` and the DSP applications.

use crate::sample::Sample;

/// A millisecond-resolution monotonic clock.
pub trait Clock {
    /// Milliseconds since an arbitrary epoch, wrapping is not expected
    /// within a device's uptime but callers must use wrapping arithmetic.
    fn now_ms(&self) -> u32;
}

/// Byte sink with introspection, as required by §4.3 of the protocol design:
/// the free-space check and the copy for [`ByteSink::write_atomic`] must be
/// performed under a single interrupt-mask critical section by the
/// implementer.
pub trait ByteSink {
    /// Enqueue `bytes` atomically: either the entire slice is enqueued or
    /// nothing is. Returns the number of bytes enqueued (`0` or
    /// `bytes.len()`).
    fn write_atomic(&mut self, bytes: &[u8]) -> usize;

    /// Spin-release-retry until the full block fits, then enqueue it in one
    /// step. Implementers must yield the critical section between attempts.
    fn write_blocking(&mut self, bytes: &[u8]);

    /// Transmitter idle: not busy, ring empty, no staged DMA length.
    fn tx_is_idle(&self) -> bool;

    /// Free space in the TX ring, in bytes.
    fn tx_free(&self) -> u16;

    /// Bytes currently queued in the TX ring.
    fn tx_usage(&self) -> u16;
}

/// Byte source introspection (RX ring occupancy), used by diagnostics.
pub trait ByteSource {
    fn rx_usage(&self) -> u16;
}

/// Accelerometer driven over I²C with FIFO-watermark interrupts.
///
/// Register programming, DMA pacing and interrupt wiring are external to
/// this core and live in the RTIC binary; this trait is the seam the core
/// uses to drive acquisition and self-test.
pub trait AccelSensor {
    /// Round `req` up to the nearest supported ODR and report it.
    fn snap_odr(&mut self, req: u32) -> u32;

    /// Program the output data rate (already snapped).
    fn set_odr(&mut self, hz: u32);

    /// Begin FIFO-watermark driven acquisition.
    fn start(&mut self);

    /// Stop acquisition.
    fn stop(&mut self);

    /// Pop the oldest sample produced by the ISR chain, if any.
    fn get_sample(&mut self) -> Option<Sample>;

    /// Convert a raw tick timestamp to microseconds, saturating at `u32::MAX`.
    fn ticks_to_us(&self, ticks: u32) -> u32;

    /// Snapshot of the most recently buffered samples, for `GET_PREVIEW`.
    fn preview_snapshot(&self, out: &mut [Sample]) -> usize;

    /// Offset calibration run at init time.
    fn offset_calibrate(&mut self);

    /// Blocking on-chip self-test. Must bypass the FIFO, poll raw samples
    /// directly, and restore every touched register on all exit paths.
    fn self_test(&mut self, avg: u32, settle: u32, force_odr_hz: Option<u32>) -> SelfTestResult;

    /// Convert a raw sample to physical acceleration in m/s^2.
    fn convert_to_mps2(&self, raw: (i16, i16, i16)) -> (f32, f32, f32);
}

/// Outcome of [`AccelSensor::self_test`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SelfTestResult {
    pub x_off: i16,
    pub y_off: i16,
    pub z_off: i16,
    pub x_on: i16,
    pub y_on: i16,
    pub z_on: i16,
    pub x_st: i16,
    pub y_st: i16,
    pub z_st: i16,
    pub health_pass: bool,
}

impl SelfTestResult {
    /// Per-axis delta windows from the sensor datasheet.
    const X_WINDOW: (i16, i16) = (50, 540);
    const Y_WINDOW: (i16, i16) = (-540, -50);
    const Z_WINDOW: (i16, i16) = (75, 875);

    pub fn evaluate(x_st: i16, y_st: i16, z_st: i16) -> bool {
        Self::in_window(x_st, Self::X_WINDOW)
            && Self::in_window(y_st, Self::Y_WINDOW)
            && Self::in_window(z_st, Self::Z_WINDOW)
    }

    fn in_window(v: i16, (lo, hi): (i16, i16)) -> bool {
        v >= lo && v <= hi
    }
}

/// GPIO/interrupt primitives the core needs: none of the register-level
/// detail, just the ability to ask for the LED on/off state to be applied.
/// Computing the pattern is in scope (see [`crate::telemetry::led_pattern`]);
/// writing the physical pin is the external collaborator.
pub trait Led {
    fn set(&mut self, on: bool);
}
