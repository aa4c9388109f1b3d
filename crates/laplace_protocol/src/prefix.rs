//! The TCP request prefix byte.

use crate::codec::WireFormat;

const BIT_UPGRADE: u8 = 0b1000_0000;
const BIT_BASE64: u8 = 0b0100_0000;
const BIT_JSON: u8 = 0b0001_0000;

/// Structuring metadata carried by the first byte of every TCP request.
///
/// Bit 7 requests the transport upgrade, bit 6 marks the body as base64,
/// bit 4 selects tagged JSON over ASN.1 DER. Remaining bits are reserved
/// and ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestPrefix {
	pub needs_upgrade: bool,
	pub body_base64: bool,
	pub body_json: bool,
}

impl RequestPrefix {
	pub fn parse(byte: u8) -> Self {
		Self {
			needs_upgrade: byte & BIT_UPGRADE != 0,
			body_base64: byte & BIT_BASE64 != 0,
			body_json: byte & BIT_JSON != 0,
		}
	}

	pub fn to_byte(self) -> u8 {
		let mut byte = 0;
		if self.needs_upgrade {
			byte |= BIT_UPGRADE;
		}
		if self.body_base64 {
			byte |= BIT_BASE64;
		}
		if self.body_json {
			byte |= BIT_JSON;
		}
		byte
	}

	/// Selected codec for the attachment and body.
	pub fn wire_format(self) -> WireFormat {
		if self.body_json { WireFormat::Json } else { WireFormat::Der }
	}
}
