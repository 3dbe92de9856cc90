//! Cooperative 1-second-cadence countdown used both by the guided zero
//! calibration (`MODE,TRIGGER_ON`) and the burst lifecycle. Ported from
//! `countdown.c`.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Running { id: u32, last_tick_ms: u32 },
}

pub struct Countdown {
    state: State,
}

impl Default for Countdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Countdown {
    pub const fn new() -> Self {
        Self { state: State::Idle }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Start a countdown of `seconds`, clamped to `[5, 10]`. Returns the
    /// initial `id` to emit immediately as `COUNTDOWN_ID,id=<id>`.
    pub fn start(&mut self, seconds: u32, now_ms: u32) -> u32 {
        let id = seconds.clamp(5, 10);
        self.state = State::Running {
            id,
            last_tick_ms: now_ms,
        };
        id
    }

    /// Drive the countdown forward. Returns `Some(id)` when a new
    /// `COUNTDOWN_ID` should be emitted (every 1000 ms), or `None` on no
    /// event. Completion at `id=1 -> 0` is silent: no id=0 is emitted on
    /// normal expiry, and the countdown becomes inactive.
    pub fn tick(&mut self, now_ms: u32) -> Option<u32> {
        match self.state {
            State::Running { id, last_tick_ms } if now_ms.wrapping_sub(last_tick_ms) >= 1000 => {
                if id <= 1 {
                    self.state = State::Idle;
                    None
                } else {
                    let next_id = id - 1;
                    self.state = State::Running {
                        id: next_id,
                        last_tick_ms: now_ms,
                    };
                    Some(next_id)
                }
            }
            _ => None,
        }
    }

    /// Cancel an active countdown. Emits `id=0` exactly once, only if the
    /// countdown was active.
    pub fn stop(&mut self) -> Option<u32> {
        if self.is_active() {
            self.state = State::Idle;
            Some(0)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_range() {
        let mut c = Countdown::new();
        assert_eq!(c.start(2, 0), 5);
        assert_eq!(c.start(100, 0), 10);
    }

    #[test]
    fn ticks_down_without_emitting_zero() {
        let mut c = Countdown::new();
        c.start(5, 0);
        assert_eq!(c.tick(1000), Some(4));
        assert_eq!(c.tick(2000), Some(3));
        assert_eq!(c.tick(3000), Some(2));
        assert_eq!(c.tick(4000), Some(1));
        // Expiry from id=1 is silent: no id=0, countdown becomes inactive.
        assert_eq!(c.tick(5000), None);
        assert!(!c.is_active());
    }

    #[test]
    fn stop_emits_zero_only_if_active() {
        let mut c = Countdown::new();
        assert_eq!(c.stop(), None);
        c.start(5, 0);
        assert_eq!(c.stop(), Some(0));
        assert_eq!(c.stop(), None);
    }

    #[test]
    fn sub_second_ticks_produce_no_event() {
        let mut c = Countdown::new();
        c.start(5, 0);
        assert_eq!(c.tick(500), None);
        assert!(c.is_active());
    }
}
