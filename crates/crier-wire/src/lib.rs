mod frame;
mod publication;

pub use frame::{
    Control, ControlError, FRAME_LEN, Frame, FrameError, IdentityError, MAX_FRAME_PAYLOAD,
    parse_control, parse_identity,
};
pub use publication::{
    MAX_DATAGRAM, MAX_STRING_PAYLOAD, MAX_TOPIC, PayloadValue, Publication, PublicationError,
    encode_datagram,
};
