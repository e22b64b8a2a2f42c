//! Decoder for PS02 data lines.
//!
//! One data line carries one frame:
//!
//! ```text
//! <seq_hex>:<108 hex chars>
//! ```
//!
//! The 108 hex characters are a 54-byte payload; every 3-byte group packs two
//! 12-bit ADC values (see [`unpack_group`] for the exact bit layout), so a
//! frame always decodes to 36 signed samples in [-2048, 2047].
//!
//! Decoding is pure and transport-oblivious: the BLE transport reassembles
//! its notification packets into this same line format before they reach the
//! decoder.

use regex::Regex;

use crate::error::SensorError;
use crate::types::Frame;

/// Offset-binary bias applied by the ADC. Raw 12-bit values are centred here.
const SAMPLE_BIAS: i16 = 2048;

/// Parses data lines into [`Frame`]s.
///
/// Holds the compiled line pattern; construct once per reader and reuse.
/// Anything that does not match the pattern (wrong payload length, missing
/// colon, non-hex characters) fails with [`SensorError::MalformedFrame`],
/// which callers treat as a droppable line rather than a session error.
#[derive(Debug)]
pub struct FrameDecoder {
    line_re: Regex,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            // Tolerates stray whitespace around both fields; the firmware
            // occasionally pads lines after a reset.
            line_re: Regex::new(r"^\s*([0-9A-Fa-f]+)\s*:\s*([0-9A-Fa-f]{108})\s*$")
                .expect("line pattern compiles"),
        }
    }

    /// Decode one line into a frame.
    ///
    /// The sequence field may be wider than one byte on the wire; the
    /// firmware counter wraps at 256, so only the low byte is meaningful and
    /// the rest is discarded.
    pub fn decode_line(&self, line: &str) -> Result<Frame, SensorError> {
        let caps = self
            .line_re
            .captures(line)
            .ok_or_else(|| SensorError::MalformedFrame(preview(line)))?;

        // The capture is all-hex, so taking the last two digits is the same
        // as parsing the full value and masking to 8 bits.
        let seq_hex = &caps[1];
        let tail = &seq_hex[seq_hex.len().saturating_sub(2)..];
        let seq = u8::from_str_radix(tail, 16)
            .map_err(|_| SensorError::MalformedFrame(preview(line)))?;

        let payload =
            hex::decode(&caps[2]).map_err(|_| SensorError::MalformedFrame(preview(line)))?;

        let mut samples = Vec::with_capacity(crate::protocol::SAMPLES_PER_FRAME);
        for group in payload.chunks_exact(3) {
            let (first, second) = unpack_group([group[0], group[1], group[2]]);
            samples.push(first);
            samples.push(second);
        }
        Ok(Frame { seq, samples })
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Unpack one 3-byte group into two signed samples.
///
/// The firmware packs two 12-bit offset-binary ADC values into three bytes:
/// `b0` and `b1` carry the low 8 bits of the first and second value, and the
/// two nibbles of `b2` supply the high bits:
///
/// ```text
/// v1 = ((b2 << 4) & 0x0F00) | b0      high nibble of b2 tops v1
/// v2 = ((b2 << 8) & 0x0F00) | b1      low  nibble of b2 tops v2
/// sample = v - 2048
/// ```
///
/// This function is the single place the bit layout lives; a revised vendor
/// layout only ever touches these few lines.
pub fn unpack_group(group: [u8; 3]) -> (i16, i16) {
    let b0 = group[0] as u16;
    let b1 = group[1] as u16;
    let b2 = group[2] as u16;
    let v1 = ((b2 << 4) & 0x0F00) | b0;
    let v2 = ((b2 << 8) & 0x0F00) | b1;
    (v1 as i16 - SAMPLE_BIAS, v2 as i16 - SAMPLE_BIAS)
}

/// Head of a rejected line for error messages. Device lines are short ASCII,
/// but a corrupted read can contain anything, so truncate on a char boundary.
fn preview(line: &str) -> String {
    const MAX_CHARS: usize = 48;
    if line.chars().count() <= MAX_CHARS {
        format!("{line:?}")
    } else {
        let head: String = line.chars().take(MAX_CHARS).collect();
        format!("{head:?}…")
    }
}
