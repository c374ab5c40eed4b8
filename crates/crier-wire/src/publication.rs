use std::{fmt, net::SocketAddr};

use thiserror::Error;

/// Topic field width in the datagram header; content is NUL-padded.
pub const MAX_TOPIC: usize = 50;
/// Longest STRING payload, excluding its terminator.
pub const MAX_STRING_PAYLOAD: usize = 1500;

const KIND_OFFSET: usize = MAX_TOPIC;
const PAYLOAD_OFFSET: usize = KIND_OFFSET + 1;

/// Upper bound on a well-formed publisher datagram.
pub const MAX_DATAGRAM: usize = PAYLOAD_OFFSET + MAX_STRING_PAYLOAD + 1;

/// Decimal exponents beyond this are clamped; the wire value is then
/// indistinguishable from `magnitude / 10^10`.
const MAX_FLOAT_EXPONENT: u8 = 10;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationError {
    #[error("datagram of {have} bytes is shorter than the {need} bytes its kind requires")]
    Truncated { need: usize, have: usize },
    #[error("unknown publication kind {0}")]
    UnknownKind(u8),
    #[error("topic of {0} bytes exceeds the {MAX_TOPIC}-byte field")]
    TopicTooLong(usize),
    #[error("string payload of {0} bytes exceeds the {MAX_STRING_PAYLOAD}-byte limit")]
    StringTooLong(usize),
}

/// Typed payload of a publication. The variant is the wire kind; no other
/// kind/payload combination is representable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadValue {
    Int(i32),
    /// Hundredths; rendered as a two-decimal fixed-point value.
    ShortReal(u16),
    /// `±magnitude / 10^exponent`, kept in wire form so rendering is exact.
    Float { negative: bool, magnitude: u32, exponent: u8 },
    Text(String),
}

impl PayloadValue {
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Int(_) => "INT",
            Self::ShortReal(_) => "SHORT_REAL",
            Self::Float { .. } => "FLOAT",
            Self::Text(_) => "STRING",
        }
    }

    fn wire_kind(&self) -> u8 {
        match self {
            Self::Int(_) => 0,
            Self::ShortReal(_) => 1,
            Self::Float { .. } => 2,
            Self::Text(_) => 3,
        }
    }
}

impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::ShortReal(v) => write!(f, "{}.{:02}", v / 100, v % 100),
            Self::Float { negative, magnitude, exponent } => {
                let divisor = 10u64.pow(u32::from((*exponent).min(MAX_FLOAT_EXPONENT)));
                let mut value = *magnitude as f64 / divisor as f64;
                if *negative {
                    value = -value;
                }
                write!(f, "{value:.6}")
            }
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// One message received from a datagram publisher. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub source: SocketAddr,
    pub value: PayloadValue,
}

impl Publication {
    /// Parses a publisher datagram.
    ///
    /// Layout: `MAX_TOPIC` NUL-padded topic bytes, one kind byte, then the
    /// kind-specific payload. Never yields a partially decoded record.
    pub fn parse(source: SocketAddr, buf: &[u8]) -> Result<Self, PublicationError> {
        if buf.len() < PAYLOAD_OFFSET {
            return Err(PublicationError::Truncated { need: PAYLOAD_OFFSET, have: buf.len() });
        }
        let topic = read_padded_str(&buf[..MAX_TOPIC]);
        let payload = &buf[PAYLOAD_OFFSET..];
        let value = match buf[KIND_OFFSET] {
            0 => {
                let raw = read_signed_magnitude(payload, buf.len())?;
                PayloadValue::Int(raw)
            }
            1 => {
                if payload.len() < 2 {
                    return Err(PublicationError::Truncated {
                        need: PAYLOAD_OFFSET + 2,
                        have: buf.len(),
                    });
                }
                PayloadValue::ShortReal(u16::from_be_bytes([payload[0], payload[1]]))
            }
            2 => {
                if payload.len() < 6 {
                    return Err(PublicationError::Truncated {
                        need: PAYLOAD_OFFSET + 6,
                        have: buf.len(),
                    });
                }
                PayloadValue::Float {
                    negative: payload[0] != 0,
                    magnitude: u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]),
                    exponent: payload[5],
                }
            }
            3 => {
                let text = &payload[..payload.len().min(MAX_STRING_PAYLOAD)];
                PayloadValue::Text(read_padded_str(text))
            }
            kind => return Err(PublicationError::UnknownKind(kind)),
        };
        Ok(Self { topic, source, value })
    }
}

/// The delivery line a subscriber receives:
/// `<ip>:<port> - <topic> - <TYPE> - <value>`.
impl fmt::Display for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {} - {}",
            self.source,
            self.topic,
            self.value.kind_label(),
            self.value
        )
    }
}

/// Decodes a NUL-padded field, stopping at the first NUL.
fn read_padded_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Sign byte plus big-endian unsigned magnitude, decoded as signed 32-bit.
/// A magnitude past `i32::MAX` wraps two's-complement.
fn read_signed_magnitude(payload: &[u8], datagram_len: usize) -> Result<i32, PublicationError> {
    if payload.len() < 5 {
        return Err(PublicationError::Truncated { need: PAYLOAD_OFFSET + 5, have: datagram_len });
    }
    let magnitude = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let value = magnitude as i32;
    Ok(if payload[0] != 0 { value.wrapping_neg() } else { value })
}

/// Encodes a publisher datagram. The publisher-side twin of
/// [`Publication::parse`].
pub fn encode_datagram(topic: &str, value: &PayloadValue) -> Result<Vec<u8>, PublicationError> {
    if topic.len() > MAX_TOPIC {
        return Err(PublicationError::TopicTooLong(topic.len()));
    }
    let mut buf = vec![0u8; PAYLOAD_OFFSET];
    buf[..topic.len()].copy_from_slice(topic.as_bytes());
    buf[KIND_OFFSET] = value.wire_kind();
    match value {
        PayloadValue::Int(v) => {
            buf.push(u8::from(*v < 0));
            buf.extend_from_slice(&v.unsigned_abs().to_be_bytes());
        }
        PayloadValue::ShortReal(v) => buf.extend_from_slice(&v.to_be_bytes()),
        PayloadValue::Float { negative, magnitude, exponent } => {
            buf.push(u8::from(*negative));
            buf.extend_from_slice(&magnitude.to_be_bytes());
            buf.push(*exponent);
        }
        PayloadValue::Text(s) => {
            if s.len() > MAX_STRING_PAYLOAD {
                return Err(PublicationError::StringTooLong(s.len()));
            }
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> SocketAddr {
        "1.2.3.4:5678".parse().unwrap()
    }

    fn roundtrip(topic: &str, value: PayloadValue) -> Publication {
        let datagram = encode_datagram(topic, &value).unwrap();
        let parsed = Publication::parse(src(), &datagram).unwrap();
        assert_eq!(parsed.topic, topic);
        assert_eq!(parsed.value, value);
        parsed
    }

    #[test]
    fn int_roundtrip_and_line() {
        let p = roundtrip("weather", PayloadValue::Int(-5));
        assert_eq!(p.to_string(), "1.2.3.4:5678 - weather - INT - -5");
        roundtrip("weather", PayloadValue::Int(0));
        roundtrip("weather", PayloadValue::Int(i32::MAX));
        roundtrip("weather", PayloadValue::Int(i32::MIN + 1));
    }

    #[test]
    fn short_real_two_decimals() {
        let p = roundtrip("stocks", PayloadValue::ShortReal(1234));
        assert_eq!(p.to_string(), "1.2.3.4:5678 - stocks - SHORT_REAL - 12.34");
        assert_eq!(PayloadValue::ShortReal(5).to_string(), "0.05");
        assert_eq!(PayloadValue::ShortReal(65535).to_string(), "655.35");
    }

    #[test]
    fn float_six_decimals() {
        let value = PayloadValue::Float { negative: true, magnitude: 1234, exponent: 2 };
        let p = roundtrip("sensors", value);
        assert_eq!(p.to_string(), "1.2.3.4:5678 - sensors - FLOAT - -12.340000");
    }

    #[test]
    fn float_zero_exponent_is_integral() {
        let value = PayloadValue::Float { negative: false, magnitude: 17, exponent: 0 };
        assert_eq!(value.to_string(), "17.000000");
    }

    #[test]
    fn float_exponent_is_clamped() {
        let value = PayloadValue::Float { negative: false, magnitude: 1, exponent: 255 };
        // Clamped to 10^10 rather than overflowing.
        assert_eq!(value.to_string(), "0.000000");
    }

    #[test]
    fn string_roundtrip_and_line() {
        let p = roundtrip("stocks", PayloadValue::Text("IBM up".into()));
        assert_eq!(p.to_string(), "1.2.3.4:5678 - stocks - STRING - IBM up");
    }

    #[test]
    fn string_stops_at_terminator() {
        let mut datagram = encode_datagram("t", &PayloadValue::Text("tail".into())).unwrap();
        datagram.extend_from_slice(b"junk after the terminator");
        let parsed = Publication::parse(src(), &datagram).unwrap();
        assert_eq!(parsed.value, PayloadValue::Text("tail".into()));
    }

    #[test]
    fn full_width_topic() {
        let topic = "t".repeat(MAX_TOPIC);
        roundtrip(&topic, PayloadValue::ShortReal(1));
        assert_eq!(
            encode_datagram(&"t".repeat(MAX_TOPIC + 1), &PayloadValue::ShortReal(1)),
            Err(PublicationError::TopicTooLong(51))
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut datagram = encode_datagram("x", &PayloadValue::Int(1)).unwrap();
        datagram[KIND_OFFSET] = 7;
        assert_eq!(Publication::parse(src(), &datagram), Err(PublicationError::UnknownKind(7)));
    }

    #[test]
    fn truncated_datagrams_are_rejected() {
        assert_eq!(
            Publication::parse(src(), &[0u8; 20]),
            Err(PublicationError::Truncated { need: PAYLOAD_OFFSET, have: 20 })
        );
        let datagram = encode_datagram("x", &PayloadValue::Int(1)).unwrap();
        assert_eq!(
            Publication::parse(src(), &datagram[..PAYLOAD_OFFSET + 2]),
            Err(PublicationError::Truncated { need: PAYLOAD_OFFSET + 5, have: 53 })
        );
    }
}
