//! Variance-based trigger engine: zero-phase noise calibration, armed-phase
//! mean capture, threshold comparison, and holdoff. Ported from
//! `trigger_logic.c`'s RAW-counts comparison (the engine compares raw LSB
//! counts, not physical units, exactly as the original does).

use crate::config::TriggerSettings;

/// Minimum per-axis noise envelope, in raw counts.
const MIN_NOISE_ABS: u16 = 2;
/// Minimum samples required for a ZERO/ARM capture to be considered valid.
const MIN_SAMPLES: u32 = 100;
/// Stall threshold during a capture: no new sample for this many ms aborts it.
pub const STALL_MS: u32 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrgState {
    Idle,
    Armed,
    Holdoff,
}

/// Accumulates per-axis sum/min/max over a timed capture window.
#[derive(Clone, Copy, Debug, Default)]
struct AxisAccum {
    sum: i64,
    min: i16,
    max: i16,
}

impl AxisAccum {
    fn new() -> Self {
        Self {
            sum: 0,
            min: i16::MAX,
            max: i16::MIN,
        }
    }

    fn observe(&mut self, v: i16) {
        self.sum += v as i64;
        if v < self.min {
            self.min = v;
        }
        if v > self.max {
            self.max = v;
        }
    }
}

/// A capture in progress (ZERO or ARM phase). The caller (the main pump)
/// feeds it samples and polls `is_done`/`is_stalled`; this type performs no
/// I/O and knows nothing about sampling start/stop.
pub struct Capture {
    axes: [AxisAccum; 3],
    n: u32,
    started_ms: u32,
    last_sample_ms: u32,
    duration_ms: u32,
}

impl Capture {
    pub fn new(now_ms: u32, duration_ms: u32) -> Self {
        Self {
            axes: [AxisAccum::new(); 3],
            n: 0,
            started_ms: now_ms,
            last_sample_ms: now_ms,
            duration_ms,
        }
    }

    pub fn observe(&mut self, x: i16, y: i16, z: i16, now_ms: u32) {
        self.axes[0].observe(x);
        self.axes[1].observe(y);
        self.axes[2].observe(z);
        self.n += 1;
        self.last_sample_ms = now_ms;
    }

    pub fn is_time_up(&self, now_ms: u32) -> bool {
        now_ms.wrapping_sub(self.started_ms) >= self.duration_ms
    }

    pub fn is_stalled(&self, now_ms: u32) -> bool {
        self.n > 0 && now_ms.wrapping_sub(self.last_sample_ms) > STALL_MS
    }

    pub fn sample_count(&self) -> u32 {
        self.n
    }

    /// Finalize a ZERO capture: per-axis mean and noise envelope floored to
    /// `MIN_NOISE_ABS`. `None` if too few samples were collected.
    pub fn finish_zero(&self) -> Option<([i16; 3], [u16; 3])> {
        if self.n < MIN_SAMPLES {
            return None;
        }
        let mut mu = [0i16; 3];
        let mut noise = [0u16; 3];
        for a in 0..3 {
            let m = (self.axes[a].sum / self.n as i64) as i16;
            let d1 = (self.axes[a].max - m).unsigned_abs();
            let d2 = (m - self.axes[a].min).unsigned_abs();
            let mut dmax = d1.max(d2);
            if dmax < MIN_NOISE_ABS {
                dmax = MIN_NOISE_ABS;
            }
            mu[a] = m;
            noise[a] = dmax;
        }
        Some((mu, noise))
    }

    /// Finalize an ARM capture: per-axis mean only. `None` if too few
    /// samples were collected.
    pub fn finish_arm(&self) -> Option<[i16; 3]> {
        if self.n < MIN_SAMPLES {
            return None;
        }
        let mut mu = [0i16; 3];
        for a in 0..3 {
            mu[a] = (self.axes[a].sum / self.n as i64) as i16;
        }
        Some(mu)
    }
}

/// The engine's calibration state, owned for the lifetime of one guided
/// trigger session (reset on `Trigger_Reset`-equivalent calls).
#[derive(Clone, Copy, Debug, Default)]
pub struct Calibration {
    pub mu_zero: [i16; 3],
    pub noise_max: [u16; 3],
    pub mu_arm: [i16; 3],
}

impl Calibration {
    pub fn is_calibrated(&self) -> bool {
        self.noise_max.iter().any(|&n| n != 0)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Result of an armed-phase threshold comparison.
pub struct Exceeds {
    pub diff_counts: i32,
    pub th_counts: i32,
}

/// Per-sample armed comparison: for each axis `diff = |v - mu_arm|`,
/// `th = k_mult * noise_max`. Fires on the first axis that exceeds its
/// threshold (axis order x, y, z, matching the original's early-return
/// behavior).
pub fn exceeds(
    cal: &Calibration,
    settings: &TriggerSettings,
    x: i16,
    y: i16,
    z: i16,
) -> Option<Exceeds> {
    let v = [x, y, z];
    for a in 0..3 {
        let diff = (v[a] as i32 - cal.mu_arm[a] as i32).abs();
        let th = (settings.k_mult * cal.noise_max[a] as f32) as i32;
        if diff > th {
            return Some(Exceeds {
                diff_counts: diff,
                th_counts: th,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capture_floors_noise_and_requires_min_samples() {
        let mut c = Capture::new(0, 2000);
        for i in 0..50 {
            c.observe(0, 0, 0, i);
        }
        assert!(c.finish_zero().is_none());
        for i in 50..150 {
            c.observe(1, -1, 0, i);
        }
        let (mu, noise) = c.finish_zero().unwrap();
        assert_eq!(mu[2], 0);
        // noise floored to MIN_NOISE_ABS since observed spread is tiny.
        assert_eq!(noise[2], 2);
    }

    #[test]
    fn stall_detection_after_500ms_gap() {
        let mut c = Capture::new(0, 2000);
        c.observe(0, 0, 0, 0);
        assert!(!c.is_stalled(400));
        assert!(c.is_stalled(600));
    }

    #[test]
    fn armed_comparison_fires_on_first_exceeding_axis() {
        let cal = Calibration {
            mu_zero: [0; 3],
            noise_max: [10, 10, 10],
            mu_arm: [0, 0, 0],
        };
        let settings = TriggerSettings {
            k_mult: 4.0,
            win_ms: 100,
            hold_ms: 2000,
        };
        assert!(exceeds(&cal, &settings, 5, 5, 5).is_none());
        let fired = exceeds(&cal, &settings, 50, 0, 0).unwrap();
        assert_eq!(fired.th_counts, 40);
        assert_eq!(fired.diff_counts, 50);
    }

    #[test]
    fn is_calibrated_requires_nonzero_noise() {
        let mut cal = Calibration::default();
        assert!(!cal.is_calibrated());
        cal.noise_max[1] = 5;
        assert!(cal.is_calibrated());
    }
}
