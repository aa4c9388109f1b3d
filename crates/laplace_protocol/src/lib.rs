#![forbid(unsafe_code)]

pub mod codec;
pub mod framing;
pub mod prefix;

pub use codec::{CodecError, WireFormat};
pub use prefix::RequestPrefix;

/// Sentinel written to the client when a request cannot be parsed.
pub const MALFORMED_DATA_JSON: &[u8] = br#"{"success": false, "error": "Data Was Malformed!"}"#;

/// JSON object with a single `error` field.
pub fn error_json(msg: &str) -> Vec<u8> {
	let mut out = Vec::with_capacity(msg.len() + 13);
	out.extend_from_slice(b"{\"error\": \"");
	out.extend_from_slice(msg.as_bytes());
	out.extend_from_slice(b"\"}");
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sentinel_is_valid_json() {
		let value: serde_json::Value = serde_json::from_slice(MALFORMED_DATA_JSON).unwrap();
		assert_eq!(value["success"], false);
		assert_eq!(value["error"], "Data Was Malformed!");
	}

	#[test]
	fn error_json_shape() {
		let value: serde_json::Value = serde_json::from_slice(&error_json("Unsecure Connection!")).unwrap();
		assert_eq!(value["error"], "Unsecure Connection!");
	}
}
