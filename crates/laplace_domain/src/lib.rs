#![forbid(unsafe_code)]

pub mod room_id;

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Log label used when an internal caller (scheduler, tests) invokes a
/// handler. Never accepted from the wire.
pub const SUPER_USER_ID: &str = "-1";

/// Commands addressable by clients, selected by a 16-bit code on TCP or a
/// URL path over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientCmd {
	Error,
	Empty,
	Register,
	Login,
	Action,
	Observe,
	GetUser,
	GameCreate,
	GameJoin,
	GameLeave,
	GameDelete,
}

/// The closed code table. `ClientCmd::Error` is reachable only via the
/// HTTP `/error/` path and carries no code.
pub const COMMAND_CODES: &[(u16, ClientCmd)] = &[
	(0x0000, ClientCmd::Empty),
	(0x0001, ClientCmd::Register),
	(0x0002, ClientCmd::Login),
	(0x0010, ClientCmd::Action),
	(0x0011, ClientCmd::Observe),
	(0x0100, ClientCmd::GetUser),
	(0x0200, ClientCmd::GameCreate),
	(0x0201, ClientCmd::GameJoin),
	(0x0202, ClientCmd::GameLeave),
	(0x0203, ClientCmd::GameDelete),
];

impl ClientCmd {
	/// Resolve a two-byte wire code against the closed table.
	pub fn from_code(code: u16) -> Option<Self> {
		COMMAND_CODES.iter().find(|(c, _)| *c == code).map(|(_, cmd)| *cmd)
	}

	/// Wire code for this command, if it has one.
	pub fn code(self) -> Option<u16> {
		COMMAND_CODES.iter().find(|(_, cmd)| *cmd == self).map(|(c, _)| *c)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			ClientCmd::Error => "error",
			ClientCmd::Empty => "empty",
			ClientCmd::Register => "register",
			ClientCmd::Login => "login",
			ClientCmd::Action => "action",
			ClientCmd::Observe => "observe",
			ClientCmd::GetUser => "getUser",
			ClientCmd::GameCreate => "gameCreate",
			ClientCmd::GameJoin => "gameJoin",
			ClientCmd::GameLeave => "gameLeave",
			ClientCmd::GameDelete => "gameDelete",
		}
	}

	/// Register and Login carry credentials and are refused on a
	/// cleartext transport.
	pub const fn requires_secure_transport(self) -> bool {
		matches!(self, ClientCmd::Register | ClientCmd::Login)
	}

	/// State-changing commands must arrive as POST over HTTP.
	pub const fn requires_post(self) -> bool {
		!matches!(self, ClientCmd::Error | ClientCmd::Empty)
	}
}

impl fmt::Display for ClientCmd {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Authentication attachment preceding every request body: who the request
/// is from and the content signature binding it to their token.
///
/// Field casing matches the wire (`UserID` / `Sig`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAttachment {
	#[serde(rename = "UserID", default)]
	pub user_id: String,

	#[serde(rename = "Sig", default)]
	pub sig: String,
}

/// Parsed request metadata shared by both transports.
#[derive(Debug, Clone)]
pub struct RequestHeader {
	pub command: ClientCmd,
	pub user_id: String,
	pub sig: String,
}

/// Who is invoking a handler.
///
/// Internal callers bypass signature verification by type; there is no
/// wire value that produces `Internal`. The signature is kept as raw
/// bytes: it is a digest, not text.
#[derive(Debug, Clone)]
pub enum AuthContext {
	External { user_id: String, sig: Vec<u8> },
	Internal,
}

impl AuthContext {
	/// Caller identity for logging and ownership checks.
	pub fn user_id(&self) -> &str {
		match self {
			AuthContext::External { user_id, .. } => user_id,
			AuthContext::Internal => SUPER_USER_ID,
		}
	}

	pub fn is_internal(&self) -> bool {
		matches!(self, AuthContext::Internal)
	}
}

/// Handler reply: either a JSON-digested value or pre-serialized bytes
/// written verbatim (token issuance, engine passthrough).
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
	Json(serde_json::Value),
	Raw(Vec<u8>),
}

impl Reply {
	/// `{"Successful": true, "Err": ""}`.
	pub fn successful() -> Self {
		Reply::json(&SuccessfulData {
			successful: true,
			err: String::new(),
		})
	}

	/// Application-level rejection naming the cause.
	pub fn unsuccessful(err: impl Into<String>) -> Self {
		Reply::json(&SuccessfulData {
			successful: false,
			err: err.into(),
		})
	}

	/// Raw text written back without digesting.
	pub fn raw_text(msg: impl Into<String>) -> Self {
		Reply::Raw(msg.into().into_bytes())
	}

	pub fn json<T: Serialize>(value: &T) -> Self {
		// Serialization of our own wire records cannot fail.
		Reply::Json(serde_json::to_value(value).expect("serializable reply"))
	}

	/// Serialize the reply for the transport layer.
	pub fn into_bytes(self) -> Result<Vec<u8>, serde_json::Error> {
		match self {
			Reply::Json(value) => serde_json::to_vec(&value),
			Reply::Raw(bytes) => Ok(bytes),
		}
	}
}

/// Success/error record digested to JSON for policy rejections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessfulData {
	#[serde(rename = "Successful")]
	pub successful: bool,

	#[serde(rename = "Err", default)]
	pub err: String,
}

/// Record returned by JoinRoom. A miss is a structurally valid empty
/// record, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomWelcome {
	#[serde(rename = "Id")]
	pub id: String,

	#[serde(rename = "NumPlayers")]
	pub num_players: u16,

	#[serde(rename = "Data")]
	pub data: String,
}

/// Static per-room details. The timestamps travel as decimal strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
	#[serde(rename = "Id")]
	pub id: String,

	#[serde(rename = "Owner")]
	pub owner: String,

	#[serde(rename = "CreatedAt", with = "string_i64")]
	pub created_at: i64,

	#[serde(rename = "LastUsed", with = "string_i64")]
	pub last_used: i64,
}

/// Record returned by GetUser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
	#[serde(rename = "AuthID")]
	pub auth_id: String,

	#[serde(rename = "Username")]
	pub username: String,
}

/// Body of Register.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBody {
	#[serde(rename = "Username", default)]
	pub username: String,

	#[serde(rename = "Password", default)]
	pub password: String,
}

/// Body of Login. Same shape as Register.
pub type LoginBody = RegisterBody;

/// Body of GetUser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUserBody {
	#[serde(rename = "Username", default)]
	pub username: String,
}

/// Body of RoomJoin / RoomLeave / RoomDelete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectRoomBody {
	#[serde(rename = "GameID", default)]
	pub room_id: String,
}

/// Body of ApplyAction: a room and an opaque relay object for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayBody {
	#[serde(rename = "GameID", default)]
	pub room_id: String,

	#[serde(rename = "Relay", default = "empty_relay")]
	pub relay: serde_json::Value,
}

impl Default for RelayBody {
	fn default() -> Self {
		Self {
			room_id: String::new(),
			relay: empty_relay(),
		}
	}
}

fn empty_relay() -> serde_json::Value {
	serde_json::Value::Object(serde_json::Map::new())
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid length: {0}")]
	InvalidLength(usize),
	#[error("invalid character: {0:?}")]
	InvalidCharacter(char),
	#[error("value exceeds the counter range")]
	OutOfRange,
}

/// i64 fields serialized as decimal strings on the wire.
mod string_i64 {
	use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

	pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&value.to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(D::Error::custom)
	}
}
