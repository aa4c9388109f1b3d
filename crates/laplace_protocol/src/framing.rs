//! Length-prefixed framing for the engine request/reply socket.
//!
//! Each frame is a 4-byte big-endian payload length followed by the
//! payload (opaque JSON bytes owned by the engine).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

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
}

/// Encode a payload into a length-prefixed frame.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(4 + payload.len());
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(payload);
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
	encode_frame(payload, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a single frame from the start of `src`, returning the payload
/// and the number of bytes consumed.
pub fn decode_frame(src: &[u8], max_frame_size: usize) -> Result<(Vec<u8>, usize), FramingError> {
	if src.len() < 4 {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge { len, max: max_frame_size });
	}

	let need = 4 + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	Ok((src[4..need].to_vec(), need))
}

/// Try to decode a single frame from a growable buffer.
///
/// Returns `Ok(None)` until a full frame has accumulated.
pub fn try_decode_frame_from_buffer(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>, FramingError> {
	if buf.len() < 4 {
		return Ok(None);
	}

	let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge { len, max: max_frame_size });
	}

	let need = 4 + len;
	if buf.len() < need {
		return Ok(None);
	}

	let mut frame = buf.split_to(need);
	frame.advance(4);
	Ok(Some(frame.freeze()))
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into(buf: &mut BytesMut, payload: &[u8], max_frame_size: usize) -> Result<(), FramingError> {
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	buf.reserve(4 + payload.len());
	buf.put_u32(payload.len() as u32);
	buf.put_slice(payload);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_decode_roundtrip_slice() {
		let payload = br#"{"State":{},"Relay":{"move":"e4"}}"#;

		let frame = encode_frame_default(payload).expect("encode");
		let (decoded, consumed) = decode_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert_eq!(consumed, frame.len());
		assert_eq!(decoded, payload);
	}

	#[test]
	fn decode_requires_full_frame() {
		let frame = encode_frame_default(&[7u8; 32]).expect("encode");

		let err = decode_frame(&frame[..4], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		match err {
			FramingError::InsufficientData { need, have } => assert!(need > have),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn try_decode_from_buffer_incremental() {
		let frame = encode_frame_default(b"engine-reply").expect("encode");

		let mut buf = BytesMut::new();

		buf.extend_from_slice(&frame[..2]);
		assert!(
			try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
				.expect("ok")
				.is_none()
		);

		buf.extend_from_slice(&frame[2..7]);
		assert!(
			try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
				.expect("ok")
				.is_none()
		);

		buf.extend_from_slice(&frame[7..]);
		let decoded = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("some");
		assert_eq!(&decoded[..], b"engine-reply");
		assert!(buf.is_empty());
	}

	#[test]
	fn encode_rejects_too_large() {
		let err = encode_frame(&[0u8; 64], 32).unwrap_err();
		match err {
			FramingError::FrameTooLarge { len, max } => {
				assert_eq!(len, 64);
				assert_eq!(max, 32);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decode_rejects_too_large_prefix() {
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

		let err = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::FrameTooLarge { .. }));
	}
}
