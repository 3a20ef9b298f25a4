//! Sutter MP-285 binary wire protocol.
//!
//! Protocol Overview:
//! - Commands: single ASCII opcode byte, optionally followed by a payload
//! - Positions: three little-endian `i32` values (X, Y, Z) in microsteps
//! - Replies: fixed length, terminated by `\r`
//! - Timing: Half-duplex request-response
//!
//! | Command | Request | Reply |
//! |---|---|---|
//! | Get position | `C` | `D` + 3×i32 LE + `\r` |
//! | Set position | `M` + 3×i32 LE | `\r` once motion has completed |
//! | Get active manipulator | `K` | ID byte + `\r` |
//!
//! Everything here is pure. The public API works in micrometers; conversion to
//! and from microsteps uses the per-device `stepmult` factor
//! (`wire = round(microns * stepmult)`).
//!
//! Replies are read as exact-length frames rather than scanned for `\r`: a
//! little-endian payload may legitimately contain `0x0D`.

use std::fmt;

use crate::error::{Axis, StageError, StageResult};

/// Get current position.
pub const GET_POSITION: u8 = b'C';
/// Move to absolute position.
pub const SET_POSITION: u8 = b'M';
/// Get active manipulator.
pub const GET_ACTIVE_MANIPULATOR: u8 = b'K';
/// Trailing byte of every device reply.
pub const TERMINATOR: u8 = b'\r';

/// Microsteps per micron unless configured otherwise.
pub const DEFAULT_STEPMULT: u32 = 16;

/// Tag byte + 12 payload bytes + terminator.
pub const POSITION_REPLY_LEN: usize = 14;
/// Bytes needed to decode a position: tag + 3×i32.
pub const POSITION_PAYLOAD_LEN: usize = 13;
/// ID byte + terminator.
pub const MANIPULATOR_REPLY_LEN: usize = 2;
/// Acknowledgement sent after a move completes.
pub const MOVE_ACK_LEN: usize = 1;
/// Opcode + 3×i32.
pub const SET_POSITION_FRAME_LEN: usize = 13;

/// Stage position in micrometers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    /// X in µm
    pub x: f64,
    /// Y in µm
    pub y: f64,
    /// Z in µm
    pub z: f64,
}

impl Position {
    /// Create a position from micrometer values.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Axis values in wire order.
    pub fn axes(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// Convert to wire microsteps, rejecting values that overflow `i32`.
    pub fn to_microsteps(&self, stepmult: u32) -> StageResult<Microsteps> {
        let mut steps = [0i32; 3];
        for ((slot, microns), axis) in steps.iter_mut().zip(self.axes()).zip(Axis::ALL) {
            let scaled = (microns * f64::from(stepmult)).round();
            if !scaled.is_finite() || scaled < f64::from(i32::MIN) || scaled > f64::from(i32::MAX) {
                return Err(StageError::Range {
                    axis,
                    microns,
                    stepmult,
                });
            }
            *slot = scaled as i32;
        }
        Ok(Microsteps(steps))
    }
}

impl From<[f64; 3]> for Position {
    fn from([x, y, z]: [f64; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<(f64, f64, f64)> for Position {
    fn from((x, y, z): (f64, f64, f64)) -> Self {
        Self { x, y, z }
    }
}

impl From<(i32, i32, i32)> for Position {
    fn from((x, y, z): (i32, i32, i32)) -> Self {
        Self::new(f64::from(x), f64::from(y), f64::from(z))
    }
}

/// Renders as `[x y z]`, the form used in the event log.
impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {}]", self.x, self.y, self.z)
    }
}

/// Raw X, Y, Z position in motor microsteps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Microsteps(pub [i32; 3]);

impl Microsteps {
    /// Convert to micrometers.
    pub fn to_microns(self, stepmult: u32) -> Position {
        let div = f64::from(stepmult);
        let [x, y, z] = self.0;
        Position::new(f64::from(x) / div, f64::from(y) / div, f64::from(z) / div)
    }

    /// Little-endian wire encoding.
    pub fn to_le_bytes(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        for (chunk, value) in out.chunks_exact_mut(4).zip(self.0) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Decode from 12 little-endian bytes.
    pub fn from_le_bytes(bytes: &[u8; 12]) -> Self {
        let mut steps = [0i32; 3];
        for (slot, chunk) in steps.iter_mut().zip(bytes.chunks_exact(4)) {
            *slot = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self(steps)
    }
}

/// `C`
pub fn encode_get_position() -> [u8; 1] {
    [GET_POSITION]
}

/// `K`
pub fn encode_get_active_manipulator() -> [u8; 1] {
    [GET_ACTIVE_MANIPULATOR]
}

/// Build the `M` frame for an absolute move to `pos` (in µm).
///
/// # Errors
/// `StageError::Range` if any axis overflows the 32-bit wire integer after
/// scaling by `stepmult`. Nothing is truncated.
pub fn encode_set_position(pos: &Position, stepmult: u32) -> StageResult<[u8; SET_POSITION_FRAME_LEN]> {
    let steps = pos.to_microsteps(stepmult)?;
    let mut frame = [0u8; SET_POSITION_FRAME_LEN];
    frame[0] = SET_POSITION;
    frame[1..].copy_from_slice(&steps.to_le_bytes());
    Ok(frame)
}

/// Decode the raw microsteps from a get-position reply.
///
/// Byte 0 is the device tag and is discarded; bytes 1..13 hold X, Y, Z.
pub fn decode_position_steps(reply: &[u8]) -> StageResult<Microsteps> {
    if reply.len() < POSITION_PAYLOAD_LEN {
        return Err(StageError::Protocol(format!(
            "position reply too short: {} bytes, need {}",
            reply.len(),
            POSITION_PAYLOAD_LEN
        )));
    }
    let mut payload = [0u8; 12];
    payload.copy_from_slice(&reply[1..POSITION_PAYLOAD_LEN]);
    Ok(Microsteps::from_le_bytes(&payload))
}

/// Decode a get-position reply into micrometers.
pub fn decode_position_reply(reply: &[u8], stepmult: u32) -> StageResult<Position> {
    decode_position_steps(reply).map(|steps| steps.to_microns(stepmult))
}

/// The active manipulator is the unsigned value of the first reply byte.
pub fn decode_manipulator_reply(reply: &[u8]) -> StageResult<u8> {
    reply
        .first()
        .copied()
        .ok_or_else(|| StageError::Protocol("empty manipulator reply".to_string()))
}

/// Selecting the active manipulator is not implemented for this device.
pub fn encode_set_active_manipulator(_manipulator: u8) -> StageResult<Vec<u8>> {
    Err(StageError::Unsupported("set active manipulator"))
}

/// Check that a complete frame ends with `\r`.
pub fn check_terminator(frame: &[u8], what: &str) -> StageResult<()> {
    match frame.last() {
        Some(&TERMINATOR) => Ok(()),
        Some(other) => Err(StageError::Protocol(format!(
            "{} reply ended with 0x{:02X}, expected CR",
            what, other
        ))),
        None => Err(StageError::Protocol(format!("empty {} reply", what))),
    }
}
