//! The central context: configuration, diagnostics, time-sync, and mode —
//! the single owned value every module operates on, in place of hidden
//! globals (see SPEC_FULL.md's design notes on the "global-state-as-
//! context-carrier" pattern). The sensor ISR chain is the one exception
//! that needs a static borrow; that borrow is installed by the RTIC binary
//! during `init`, not by this module.

use crate::burst::PendingBurst;
use crate::config::{BlocksCfg, RuntimeCfg, TimeSync, TriggerSettings};
use crate::countdown::Countdown;
use crate::diag::{DiagCounters, HwDiagCounters};
use crate::trigger::{Calibration, Capture, TrgState};

/// Which calibration phase an in-progress [`Capture`] belongs to, so the
/// dispatcher knows what to do when it finishes or stalls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapturePhase {
    /// Guided calibration's hold-zero capture (`MODE,TRIGGER_ON` ->
    /// `CAL_READY` -> countdown). Completion always moves to `WaitArm`.
    Zero,
    /// Standalone `ZERO` command's capture. Stays in `Idle` throughout and
    /// emits a different `CAL_INFO` status on completion.
    QuickZero,
    Arm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpMode {
    Init,
    Idle,
    WaitCalZero,
    TrgCalZero,
    WaitArm,
    Armed,
    Countdown,
    Burst,
    BurstSending,
    StaticRun,
    Streaming,
    Error,
}

/// Bundles every piece of long-lived device state that isn't owned by a
/// more specific subsystem (burst manager, BLOCKS transport).
pub struct AppContext {
    pub op_mode: OpMode,
    pub trg_state: TrgState,
    pub state_timer_start_ms: u32,
    pub cfg: RuntimeCfg,
    pub trigger_settings: TriggerSettings,
    pub blocks_cfg: BlocksCfg,
    pub time_sync: TimeSync,
    pub diag: DiagCounters,
    /// Hardware-facing counters the RTIC binary copies in from the sensor
    /// ISR chain before a `DIAG_HW_TEST`; this core never writes them.
    pub hw_diag: HwDiagCounters,
    /// Wall-clock of the last `HB` emission, for the dispatcher's pacing.
    pub last_hb_ms: u32,
    /// A `START_BURST_DAMPING` request parked during its lead-in countdown.
    pub pending_burst: Option<PendingBurst>,
    pub stop_flag: bool,
    pub is_dumping: bool,
    pub burst_abort_pending: bool,
    #[cfg(feature = "test-hooks")]
    pub test_trigger_flag: bool,
    pub calibration: Calibration,
    pub countdown: Countdown,
    pub next_burst_id: u32,
    /// Set whenever `op_mode` changes, so the pump knows to emit `STATUS`.
    pub mode_dirty: bool,
    /// The in-progress ZERO/ARM capture, if any. `None` whenever neither
    /// phase is actively accumulating samples.
    pub capture: Option<Capture>,
    pub capture_phase: Option<CapturePhase>,
    pub last_trigger_event_ms: u32,
    /// Mirrors whether the dispatcher last told the sensor to start
    /// acquiring, so `SET_CFG`'s ODR change knows whether to bounce
    /// sampling and `DIAG_HW_TEST`'s EXTI probe knows what to expect.
    pub sampling_active: bool,
    /// Set by `REBOOT` once its `ACK` has been queued; the RTIC binary
    /// polls this after flushing the TX ring and performs the actual
    /// `SCB::sys_reset()`, which this hardware-agnostic core cannot do.
    pub reboot_requested: bool,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext {
    pub fn new() -> Self {
        Self {
            op_mode: OpMode::Init,
            trg_state: TrgState::Idle,
            state_timer_start_ms: 0,
            cfg: RuntimeCfg::default(),
            trigger_settings: TriggerSettings::default(),
            blocks_cfg: BlocksCfg::default(),
            time_sync: TimeSync::default(),
            diag: DiagCounters::default(),
            hw_diag: HwDiagCounters::default(),
            last_hb_ms: 0,
            pending_burst: None,
            stop_flag: false,
            is_dumping: false,
            burst_abort_pending: false,
            #[cfg(feature = "test-hooks")]
            test_trigger_flag: false,
            calibration: Calibration::default(),
            countdown: Countdown::new(),
            next_burst_id: 1,
            mode_dirty: false,
            capture: None,
            capture_phase: None,
            last_trigger_event_ms: 0,
            sampling_active: false,
            reboot_requested: false,
        }
    }

    /// Centralizes `STATUS` emission on mode change: sets `mode_dirty` only
    /// when the mode actually changes, so repeated sets are idempotent.
    pub fn set_op_mode(&mut self, mode: OpMode) {
        if self.op_mode != mode {
            self.op_mode = mode;
            self.mode_dirty = true;
        }
    }

    pub fn take_mode_dirty(&mut self) -> bool {
        core::mem::replace(&mut self.mode_dirty, false)
    }

    pub fn next_burst_id(&mut self) -> u32 {
        let id = self.next_burst_id;
        self.next_burst_id = self.next_burst_id.wrapping_add(1);
        id
    }

    /// `HELLO` resets diagnostics, time sync, and the stop flag, and forces
    /// `Idle` regardless of prior mode.
    pub fn on_hello(&mut self) {
        self.diag.reset();
        self.time_sync.clear();
        self.stop_flag = false;
        self.capture = None;
        self.capture_phase = None;
        self.set_op_mode(OpMode::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_op_mode_is_idempotent() {
        let mut ctx = AppContext::new();
        ctx.set_op_mode(OpMode::Idle);
        assert!(ctx.take_mode_dirty());
        ctx.set_op_mode(OpMode::Idle);
        assert!(!ctx.take_mode_dirty());
    }

    #[test]
    fn hello_resets_and_forces_idle() {
        let mut ctx = AppContext::new();
        ctx.diag.i2c_fail = 3;
        ctx.stop_flag = true;
        ctx.time_sync.set(10, 0);
        ctx.set_op_mode(OpMode::Armed);
        ctx.take_mode_dirty();

        ctx.on_hello();
        assert_eq!(ctx.op_mode, OpMode::Idle);
        assert_eq!(ctx.diag.i2c_fail, 0);
        assert!(!ctx.stop_flag);
        assert!(!ctx.time_sync.has_sync);
        assert!(ctx.take_mode_dirty());
    }

    #[test]
    fn burst_ids_increase_monotonically() {
        let mut ctx = AppContext::new();
        let a = ctx.next_burst_id();
        let b = ctx.next_burst_id();
        assert_eq!(b, a + 1);
    }
}
