//! Attachment and body decoding for the two wire formats.
//!
//! Every request body is preceded by a `{UserID, Sig}` attachment in the
//! format selected by the prefix byte. The attachment decoder reports the
//! exact byte offset where the attachment ends so the remaining bytes form
//! the body payload.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use laplace_domain::{ClientCmd, GetUserBody, RegisterBody, RelayBody, RequestAttachment, SelectRoomBody};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Structural encoding selected by the request prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
	Json,
	Der,
}

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("request truncated: need {need} bytes, have {have}")]
	Truncated { need: usize, have: usize },

	#[error("unknown command code: {0:#06x}")]
	UnknownCommand(u16),

	#[error("attachment decode: {0}")]
	Attachment(String),

	#[error("body decode: {0}")]
	Body(String),

	#[error("base64 decode: {0}")]
	Base64(#[from] base64::DecodeError),
}

/// Resolve the two big-endian command bytes against the closed table.
pub fn parse_command(most_significant: u8, least_significant: u8) -> Result<ClientCmd, CodecError> {
	let code = u16::from_be_bytes([most_significant, least_significant]);
	ClientCmd::from_code(code).ok_or(CodecError::UnknownCommand(code))
}

/// Decode the authentication attachment, returning it together with the
/// offset of the first body byte.
pub fn decode_attachment(format: WireFormat, data: &[u8]) -> Result<(RequestAttachment, usize), CodecError> {
	match format {
		WireFormat::Json => decode_json_attachment(data),
		WireFormat::Der => decode_der_attachment(data),
	}
}

fn decode_json_attachment(data: &[u8]) -> Result<(RequestAttachment, usize), CodecError> {
	let mut stream = serde_json::Deserializer::from_slice(data).into_iter::<RequestAttachment>();

	match stream.next() {
		Some(Ok(attachment)) => Ok((attachment, stream.byte_offset())),
		Some(Err(e)) => Err(CodecError::Attachment(e.to_string())),
		None => Err(CodecError::Attachment("missing attachment".to_string())),
	}
}

fn decode_der_attachment(data: &[u8]) -> Result<(RequestAttachment, usize), CodecError> {
	let end = der_value_len(data).map_err(|e| CodecError::Attachment(e.to_string()))?;

	let attachment = yasna::parse_der(&data[..end], |reader| {
		reader.read_sequence(|reader| {
			let user_id = reader.next().read_utf8string()?;
			let sig = reader.next().read_utf8string()?;
			Ok(RequestAttachment { user_id, sig })
		})
	})
	.map_err(|e| CodecError::Attachment(e.to_string()))?;

	Ok((attachment, end))
}

/// Encode an attachment as a DER sequence. Counterpart of
/// [`decode_attachment`] for cooperating clients and tests.
pub fn encode_attachment_der(attachment: &RequestAttachment) -> Vec<u8> {
	yasna::construct_der(|writer| {
		writer.write_sequence(|writer| {
			writer.next().write_utf8string(&attachment.user_id);
			writer.next().write_utf8string(&attachment.sig);
		})
	})
}

/// A command body decodable from either wire format.
pub trait BodyShape: DeserializeOwned {
	fn from_der(data: &[u8]) -> Result<Self, CodecError>;
}

/// Decode a command body, applying the base64 pre-decode when the prefix
/// asked for it.
pub fn decode_body<T: BodyShape>(format: WireFormat, base64_encoded: bool, data: &[u8]) -> Result<T, CodecError> {
	let decoded;
	let data = if base64_encoded {
		decoded = base64_decode(data)?;
		decoded.as_slice()
	} else {
		data
	};

	match format {
		WireFormat::Json => serde_json::from_slice(data).map_err(|e| CodecError::Body(e.to_string())),
		WireFormat::Der => T::from_der(data),
	}
}

/// Decode from the raw (unpadded) base64 alphabet.
pub fn base64_decode(data: &[u8]) -> Result<Vec<u8>, CodecError> {
	Ok(STANDARD_NO_PAD.decode(data)?)
}

/// Encode into the raw (unpadded) base64 alphabet.
pub fn base64_encode(data: &[u8]) -> String {
	STANDARD_NO_PAD.encode(data)
}

impl BodyShape for RegisterBody {
	fn from_der(data: &[u8]) -> Result<Self, CodecError> {
		parse_tolerant(data, |reader| {
			reader.read_sequence(|reader| {
				let username = reader.next().read_utf8string()?;
				let password = reader.next().read_utf8string()?;
				Ok(RegisterBody { username, password })
			})
		})
	}
}

impl BodyShape for GetUserBody {
	fn from_der(data: &[u8]) -> Result<Self, CodecError> {
		parse_tolerant(data, |reader| {
			reader.read_sequence(|reader| {
				let username = reader.next().read_utf8string()?;
				Ok(GetUserBody { username })
			})
		})
	}
}

impl BodyShape for SelectRoomBody {
	fn from_der(data: &[u8]) -> Result<Self, CodecError> {
		parse_tolerant(data, |reader| {
			reader.read_sequence(|reader| {
				let room_id = reader.next().read_utf8string()?;
				Ok(SelectRoomBody { room_id })
			})
		})
	}
}

impl BodyShape for RelayBody {
	/// The relay object travels as a UTF8String holding JSON; an empty
	/// string stands for the empty object.
	fn from_der(data: &[u8]) -> Result<Self, CodecError> {
		let (room_id, relay_text) = parse_tolerant(data, |reader| {
			reader.read_sequence(|reader| {
				let room_id = reader.next().read_utf8string()?;
				let relay = reader.next().read_utf8string()?;
				Ok((room_id, relay))
			})
		})?;

		let relay = if relay_text.is_empty() {
			serde_json::Value::Object(serde_json::Map::new())
		} else {
			serde_json::from_str(&relay_text).map_err(|e| CodecError::Body(e.to_string()))?
		};

		Ok(RelayBody { room_id, relay })
	}
}

/// Parse one DER value from the front of `data`, tolerating (and logging)
/// extraneous trailing bytes.
fn parse_tolerant<T, F>(data: &[u8], parse: F) -> Result<T, CodecError>
where
	F: FnOnce(yasna::BERReader<'_, '_>) -> Result<T, yasna::ASN1Error>,
{
	let end = der_value_len(data).map_err(|e| CodecError::Body(e.to_string()))?;
	if end < data.len() {
		debug!(extra = data.len() - end, "der body has extra trailing bytes, parsing anyway");
	}

	yasna::parse_der(&data[..end], parse).map_err(|e| CodecError::Body(e.to_string()))
}

/// Total length (header + contents) of the DER value starting at `data[0]`.
fn der_value_len(data: &[u8]) -> Result<usize, CodecError> {
	if data.len() < 2 {
		return Err(CodecError::Truncated { need: 2, have: data.len() });
	}

	let first_len_byte = data[1];
	let (header, content) = if first_len_byte < 0x80 {
		(2, first_len_byte as usize)
	} else {
		let len_octets = (first_len_byte & 0x7f) as usize;
		if len_octets == 0 || len_octets > 4 {
			return Err(CodecError::Body("unsupported der length form".to_string()));
		}
		if data.len() < 2 + len_octets {
			return Err(CodecError::Truncated {
				need: 2 + len_octets,
				have: data.len(),
			});
		}

		let mut content = 0usize;
		for &b in &data[2..2 + len_octets] {
			content = (content << 8) | b as usize;
		}
		(2 + len_octets, content)
	};

	let total = header + content;
	if data.len() < total {
		return Err(CodecError::Truncated {
			need: total,
			have: data.len(),
		});
	}

	Ok(total)
}
