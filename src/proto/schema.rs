//! Protocol-wide constants: line framing limits, defaults, and the verb and
//! message-prefix string tables. Values are taken from the wire format
//! fixed by `spec.md` §6 (itself matching the original firmware's
//! `api_schema.h`).

pub const PROTO_VERSION: &str = "3.3.3";
pub const FW_VERSION: &str = "3.3.7";

pub const PROTO_EOL: &str = "\r\n";
/// Payload bytes, excluding the CRLF terminator.
pub const PROTO_MAX_LINE_PAYLOAD: usize = 254;
/// Full line including CRLF.
pub const PROTO_MAX_LINE: usize = 256;

pub const PROTO_BLOCK_TIMEOUT_MS: u32 = 1000;
pub const PROTO_MAX_RETRIES: u8 = 3;
pub const PROTO_WINDOW_DEFAULT: u8 = 4;
pub const PROTO_BLOCK_LINES_DEFAULT: u16 = 128;

pub const TB_MAX_INFLIGHT: usize = 8;
pub const TB_MAX_QUEUE: usize = 16;

pub const DEFAULT_ODR_HZ: u32 = 800;
pub const DEFAULT_BURST_MS: u32 = 5000;
pub const DEFAULT_HB_MS: u32 = 1000;
pub const DEFAULT_STREAM_HZ: u32 = 100;

pub const REF_CAPTURE_DURATION_MS: u32 = 2000;
pub const SAMPLES_PER_BURST: usize = 8000;
pub const SAMPLE_RING_CAPACITY: usize = 512;

/// Byte capacity of the UART RX/TX rings, sized so a full `BLOCKS` block
/// (`PROTO_BLOCK_LINES_DEFAULT` lines, each up to `PROTO_MAX_LINE` bytes)
/// never backs up the TX side, and a burst of `ACK_BLK`/`NACK_BLK` replies
/// never overruns RX.
pub const RX_RING_BYTES: usize = 2048;
pub const TX_RING_BYTES: usize = 4096;

/// Dispatcher throughput budget: at most this many lines, or this many
/// milliseconds of wall-clock, processed per `pump()` call, so a burst of
/// queued commands can't starve burst/trigger/telemetry servicing.
pub const DISPATCH_MAX_LINES_PER_PUMP: u32 = 8;
pub const DISPATCH_MAX_MS_PER_PUMP: u32 = 2;

/// `GET_PREVIEW` reports the most recently buffered samples, capped so a
/// reply never needs more than one block's worth of lines.
pub const PREVIEW_MAX_SAMPLES: usize = 64;

/// `ADXL_ST` defaults and range limits (`original_source`'s
/// `Parse_AdxlSt`/`Sensor_PerformSelfTest`).
pub const ADXL_ST_DEFAULT_AVG: u32 = 16;
pub const ADXL_ST_DEFAULT_SETTLE: u32 = 4;
pub const ADXL_ST_MAX_AVG: u32 = 128;
pub const ADXL_ST_MAX_SETTLE: u32 = 32;
pub const ADXL_ST_DEFAULT_ODR_HZ: u32 = 400;
/// Known ADXL345 `DEVID` register value.
pub const ADXL345_DEVID: u8 = 0xE5;

pub const SUPPORTED_ODR_HZ: [u32; 6] = [100, 200, 400, 800, 1600, 3200];

// --- Command verbs (host -> device) ---
pub const CMD_HELLO: &str = "HELLO";
pub const CMD_GET_STATUS: &str = "GET_STATUS";
pub const CMD_GET_CFG: &str = "GET_CFG";
pub const CMD_SET_CFG: &str = "SET_CFG";
pub const CMD_HB: &str = "HB";
pub const CMD_TIME_SYNC: &str = "TIME_SYNC";
pub const CMD_STREAM_START: &str = "STREAM_START";
pub const CMD_STREAM_STOP: &str = "STREAM_STOP";
pub const CMD_GET_TRG: &str = "GET_TRG";
pub const CMD_SET_TRG: &str = "SET_TRG";
pub const CMD_MODE: &str = "MODE";
pub const CMD_CAL_READY: &str = "CAL_READY";
pub const CMD_ARM: &str = "ARM";
pub const CMD_START_BURST_WEIGHT: &str = "START_BURST_WEIGHT";
pub const CMD_START_BURST_DAMPING: &str = "START_BURST_DAMPING";
pub const CMD_GET_PREVIEW: &str = "GET_PREVIEW";
pub const CMD_GET_DIAG: &str = "GET_DIAG";
pub const CMD_REBOOT: &str = "REBOOT";
pub const CMD_STOP: &str = "STOP";
pub const CMD_ZERO: &str = "ZERO";
pub const CMD_TEST_FORCE_TRIGGER: &str = "_TEST_FORCE_TRIGGER";
pub const CMD_ADXL_ST: &str = "ADXL_ST";
pub const CMD_DIAG_HW_TEST: &str = "DIAG_HW_TEST";

// --- BLOCKS host acknowledgements ---
pub const CMD_ACK_BLK: &str = "ACK_BLK";
pub const CMD_NACK_BLK: &str = "NACK_BLK";
pub const CMD_ACK_COMPLETE: &str = "ACK_COMPLETE";

// --- Message prefixes (device -> host) ---
pub const MSG_HELLO_ACK: &str = "HELLO_ACK";
pub const MSG_ACK: &str = "ACK";
pub const MSG_NACK: &str = "NACK";
pub const MSG_ERROR: &str = "ERROR";
pub const MSG_STATUS: &str = "STATUS";
pub const MSG_CFG: &str = "CFG";
pub const MSG_HB: &str = "HB";
pub const MSG_TRG_SETTINGS: &str = "TRG_SETTINGS";
pub const MSG_TRIGGER_EDGE: &str = "TRIGGER_EDGE";
pub const MSG_DATA_HEADER: &str = "DATA_HEADER";
pub const MSG_BLOCK_HEADER: &str = "BLOCK_HEADER";
pub const MSG_DATA: &str = "DATA";
pub const MSG_BLOCK_END: &str = "BLOCK_END";
pub const MSG_COMPLETE: &str = "COMPLETE";
pub const MSG_COUNTDOWN_ID: &str = "COUNTDOWN_ID";
pub const MSG_CAL_INFO: &str = "CAL_INFO";
pub const MSG_PREVIEW_HEADER: &str = "PREVIEW_HEADER";
pub const MSG_PREVIEW: &str = "PREVIEW";
pub const MSG_PREVIEW_END: &str = "PREVIEW_END";
pub const MSG_LIVE: &str = "LIVE";
pub const MSG_SUMMARY: &str = "SUMMARY";
pub const MSG_DIAG_RES: &str = "DIAG_RES";
pub const MSG_ADXL_ST_CFG: &str = "ADXL_ST_CFG";
pub const MSG_ADXL_ST_RAW: &str = "ADXL_ST_RAW";
pub const MSG_DIAG: &str = "DIAG";
