//! Wire protocol: line framing, numeric/string grammar, CRC-16, and the
//! verb/message constant tables.

pub mod crc16;
pub mod fields;
pub mod line;
pub mod parse;
pub mod schema;

pub use crc16::{crc16 as crc16_of, Crc16};
