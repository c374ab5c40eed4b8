use thiserror::Error;

/// Frame length prefix.
const LEN_HEADER_SIZE: usize = core::mem::size_of::<u16>();
/// Largest meaningful payload a stream frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = 2048;
/// Every frame occupies exactly this many bytes on the wire.
pub const FRAME_LEN: usize = LEN_HEADER_SIZE + MAX_FRAME_PAYLOAD;

/// Longest identity a subscriber may present, in content bytes.
const MAX_IDENTITY: usize = 9;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {MAX_FRAME_PAYLOAD}-byte frame capacity")]
    PayloadTooLong(usize),
    #[error("frame announces {0} payload bytes, more than the {MAX_FRAME_PAYLOAD}-byte capacity")]
    LengthOutOfRange(u16),
}

/// Fixed-size envelope exchanged over subscriber streams, in both directions.
///
/// Layout: 2-byte little-endian `length`, then a [`MAX_FRAME_PAYLOAD`]-byte
/// payload buffer of which only the first `length` bytes are meaningful. The
/// size never varies, so a peer always transfers exactly [`FRAME_LEN`] bytes
/// per message.
#[derive(Clone)]
pub struct Frame {
    buf: [u8; FRAME_LEN],
}

impl Frame {
    /// Builds a frame carrying `payload`, zero-padding the rest of the
    /// envelope.
    pub fn for_payload(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }
        let mut buf = [0u8; FRAME_LEN];
        buf[..LEN_HEADER_SIZE].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        buf[LEN_HEADER_SIZE..LEN_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        Ok(Self { buf })
    }

    /// Reinterprets a fully received envelope.
    pub fn from_wire(buf: [u8; FRAME_LEN]) -> Self {
        Self { buf }
    }

    /// The announced payload length.
    pub fn announced_len(&self) -> u16 {
        u16::from_le_bytes([self.buf[0], self.buf[1]])
    }

    /// The meaningful payload prefix. A length past the envelope capacity
    /// is a protocol fault.
    pub fn payload(&self) -> Result<&[u8], FrameError> {
        let len = self.announced_len();
        if len as usize > MAX_FRAME_PAYLOAD {
            return Err(FrameError::LengthOutOfRange(len));
        }
        Ok(&self.buf[LEN_HEADER_SIZE..LEN_HEADER_SIZE + len as usize])
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.buf
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frame").field("len", &self.announced_len()).finish_non_exhaustive()
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.buf[..] == other.buf[..]
    }
}

impl Eq for Frame {}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("control frame carries no command token")]
    MissingCommand,
    #[error("control frame carries no topic")]
    MissingTopic,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
}

/// A decoded subscriber control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Subscribe { topic: String, store_forward: bool },
    Unsubscribe { topic: String },
}

/// Splits the leading NUL-terminated token off `bytes`.
fn take_str(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let nul = bytes.iter().position(|&b| b == 0)?;
    Some((&bytes[..nul], &bytes[nul + 1..]))
}

/// Parses a control payload: a NUL-terminated command token, a
/// NUL-terminated topic, and, for `subscribe`, a flag byte in the last
/// meaningful position (zero disables store-and-forward, anything else
/// enables it).
pub fn parse_control(payload: &[u8]) -> Result<Control, ControlError> {
    let (command, rest) = take_str(payload).ok_or(ControlError::MissingCommand)?;
    match command {
        b"subscribe" => {
            let (topic, _) = take_str(rest).ok_or(ControlError::MissingTopic)?;
            if topic.is_empty() {
                return Err(ControlError::MissingTopic);
            }
            let store_forward = payload.last().copied().unwrap_or(0) != 0;
            Ok(Control::Subscribe {
                topic: String::from_utf8_lossy(topic).into_owned(),
                store_forward,
            })
        }
        b"unsubscribe" => {
            let (topic, _) = take_str(rest).ok_or(ControlError::MissingTopic)?;
            if topic.is_empty() {
                return Err(ControlError::MissingTopic);
            }
            Ok(Control::Unsubscribe { topic: String::from_utf8_lossy(topic).into_owned() })
        }
        other => Err(ControlError::UnknownCommand(String::from_utf8_lossy(other).into_owned())),
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,
    #[error("identity of {0} bytes exceeds the {MAX_IDENTITY}-byte limit")]
    TooLong(usize),
    #[error("identity contains non-printable byte {0:#04x}")]
    NotPrintable(u8),
}

/// Parses the identity a subscriber presents in its first frame: 1 to 9
/// printable bytes, NUL-terminated within the payload.
pub fn parse_identity(payload: &[u8]) -> Result<String, IdentityError> {
    let id = match take_str(payload) {
        Some((id, _)) => id,
        // No terminator: the whole payload is the identity.
        None => payload,
    };
    if id.is_empty() {
        return Err(IdentityError::Empty);
    }
    if id.len() > MAX_IDENTITY {
        return Err(IdentityError::TooLong(id.len()));
    }
    if let Some(&b) = id.iter().find(|b| !b.is_ascii_graphic()) {
        return Err(IdentityError::NotPrintable(b));
    }
    Ok(String::from_utf8_lossy(id).into_owned())
}
