#![forbid(unsafe_code)]

pub mod framing;
pub mod message;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, LENGTH_PREFIX_LEN, decode_frame, encode_frame,
	encode_frame_default, encode_frame_into, frame_len_from_payload_len, try_decode_frame_from_buffer,
};
pub use message::{Document, Request, Response};
