#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

/// Size of the big-endian `u32` length prefix in front of every payload.
pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

fn encode_payload<M: Serialize>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload = serde_json::to_vec(msg).map_err(FramingError::Encode)?;
	let max = max_frame_size.min(u32::MAX as usize);
	if payload.len() > max {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}
	Ok(payload)
}

/// Encode a document into a length-prefixed frame.
pub fn encode_frame<M: Serialize>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload = encode_payload(msg, max_frame_size)?;

	let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(&payload);
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<M: Serialize>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded frame into the provided buffer.
///
/// The buffer is left untouched when encoding fails.
pub fn encode_frame_into<M: Serialize>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	let payload = encode_payload(msg, max_frame_size)?;

	buf.reserve(LENGTH_PREFIX_LEN + payload.len());
	buf.put_u32(payload.len() as u32);
	buf.put_slice(&payload);
	Ok(())
}

/// Compute total frame length (prefix + payload).
#[inline]
pub fn frame_len_from_payload_len(payload_len: usize) -> usize {
	LENGTH_PREFIX_LEN + payload_len
}

#[inline]
fn read_len_prefix(src: &[u8]) -> usize {
	u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize
}

/// Decode a single frame from the start of `src`.
///
/// Returns the decoded document and the number of bytes it occupied.
pub fn decode_frame<M: DeserializeOwned>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	if src.len() < LENGTH_PREFIX_LEN {
		return Err(FramingError::InsufficientData {
			need: LENGTH_PREFIX_LEN,
			have: src.len(),
		});
	}

	let len = read_len_prefix(src);
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = frame_len_from_payload_len(len);
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = serde_json::from_slice(&src[LENGTH_PREFIX_LEN..need]).map_err(FramingError::Decode)?;
	Ok((msg, need))
}

/// Try to decode a single frame from a growable buffer.
///
/// On success the frame is split off the front of `buf`. A malformed payload
/// is consumed as well so callers never see it twice.
pub fn try_decode_frame_from_buffer<M: DeserializeOwned>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	if buf.len() < LENGTH_PREFIX_LEN {
		return Ok(None);
	}

	let len = read_len_prefix(buf);
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = frame_len_from_payload_len(len);
	if buf.len() < need {
		buf.reserve(need - buf.len());
		return Ok(None);
	}

	let frame = buf.split_to(need);
	let msg = serde_json::from_slice(&frame[LENGTH_PREFIX_LEN..]).map_err(FramingError::Decode)?;
	Ok(Some(msg))
}

/// Per-connection accumulating decoder.
///
/// Reads are appended with [`FrameDecoder::extend`] (or directly into
/// [`FrameDecoder::buffer_mut`]); complete frames are pulled with
/// [`FrameDecoder::next_frame`] regardless of how the bytes were split.
#[derive(Debug)]
pub struct FrameDecoder {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameDecoder {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_size,
		}
	}

	pub fn max_frame_size(&self) -> usize {
		self.max_frame_size
	}

	pub fn extend(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Mutable access for `AsyncReadExt::read_buf`.
	pub fn buffer_mut(&mut self) -> &mut BytesMut {
		&mut self.buf
	}

	/// Bytes received but not yet consumed by a complete frame.
	pub fn buffered_len(&self) -> usize {
		self.buf.len()
	}

	pub fn next_frame<M: DeserializeOwned>(&mut self) -> Result<Option<M>, FramingError> {
		try_decode_frame_from_buffer(&mut self.buf, self.max_frame_size)
	}
}

impl Default for FrameDecoder {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_FRAME_SIZE)
	}
}
