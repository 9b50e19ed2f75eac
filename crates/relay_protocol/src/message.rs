#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field-named, arbitrarily nested document carried by every frame.
pub type Document = Map<String, Value>;

/// Decoded client request.
///
/// `action` selects the handler; every other top-level field lands in
/// `fields` untouched. A payload that is not an object, or whose `action` is
/// missing or not a string, fails to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
	pub action: String,

	#[serde(flatten)]
	pub fields: Document,
}

impl Request {
	pub fn new(action: impl Into<String>) -> Self {
		Self {
			action: action.into(),
			fields: Document::new(),
		}
	}

	/// Builder-style field setter.
	pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.fields.insert(key.into(), value.into());
		self
	}

	pub fn field(&self, key: &str) -> Option<&Value> {
		self.fields.get(key)
	}

	/// Integer field; numeric strings are accepted as well.
	pub fn i64_field(&self, key: &str) -> Option<i64> {
		match self.fields.get(key)? {
			Value::Number(n) => n.as_i64(),
			Value::String(s) => s.trim().parse().ok(),
			_ => None,
		}
	}

	pub fn str_field(&self, key: &str) -> Option<&str> {
		self.fields.get(key).and_then(Value::as_str)
	}
}

/// Document written back to a client: a direct reply or a forwarded event.
///
/// Replies carry `success`; forwarded events usually omit it and describe
/// themselves through `action` and payload fields alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
	pub action: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub success: Option<bool>,

	#[serde(flatten)]
	pub fields: Document,
}

impl Response {
	/// Successful reply for `action`.
	pub fn ok(action: impl Into<String>) -> Self {
		Self {
			action: action.into(),
			success: Some(true),
			fields: Document::new(),
		}
	}

	/// Failed reply for `action` with a human-readable `message`.
	pub fn error(action: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			action: action.into(),
			success: Some(false),
			fields: Document::new(),
		}
		.with("message", message.into())
	}

	/// Forwarded document with no reply semantics.
	pub fn event(action: impl Into<String>) -> Self {
		Self {
			action: action.into(),
			success: None,
			fields: Document::new(),
		}
	}

	/// Builder-style field setter.
	///
	/// `action` and `success` are struct fields; setting them here is ignored
	/// so the wire form never carries duplicate keys.
	pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		let key = key.into();
		if key != "action" && key != "success" {
			self.fields.insert(key, value.into());
		}
		self
	}

	/// Merge every field of `doc` (minus `action`/`success`).
	pub fn with_document(mut self, doc: Document) -> Self {
		for (k, v) in doc {
			if k != "action" && k != "success" {
				self.fields.insert(k, v);
			}
		}
		self
	}

	pub fn is_success(&self) -> bool {
		self.success.unwrap_or(false)
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.fields.get(key)
	}

	pub fn message(&self) -> Option<&str> {
		self.fields.get("message").and_then(Value::as_str)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn request_flattens_action_specific_fields() {
		let req: Request = serde_json::from_value(json!({
			"action": "sendMessage",
			"senderID": 1,
			"receiverID": "2",
			"content": "hi",
		}))
		.expect("decode");

		assert_eq!(req.action, "sendMessage");
		assert_eq!(req.i64_field("senderID"), Some(1));
		assert_eq!(req.i64_field("receiverID"), Some(2));
		assert_eq!(req.str_field("content"), Some("hi"));
		assert!(req.field("action").is_none());
	}

	#[test]
	fn request_without_action_is_rejected() {
		assert!(serde_json::from_value::<Request>(json!({"userID": 1})).is_err());
		assert!(serde_json::from_value::<Request>(json!({"action": 5})).is_err());
		assert!(serde_json::from_value::<Request>(json!(["login"])).is_err());
	}

	#[test]
	fn error_response_shape() {
		let resp = Response::error("bogus", "unknown action");
		let v = serde_json::to_value(&resp).expect("encode");
		assert_eq!(
			v,
			json!({"action": "bogus", "success": false, "message": "unknown action"})
		);
	}

	#[test]
	fn event_omits_success_and_ignores_reserved_keys() {
		let ev = Response::event("receiveMessage")
			.with("content", "yo")
			.with("action", "spoofed")
			.with("success", true);
		let v = serde_json::to_value(&ev).expect("encode");
		assert_eq!(v, json!({"action": "receiveMessage", "content": "yo"}));
	}

	#[test]
	fn response_decodes_back_from_wire() {
		let wire = json!({"action": "loginResponse", "success": true, "userId": 3});
		let resp: Response = serde_json::from_value(wire).expect("decode");
		assert!(resp.is_success());
		assert_eq!(resp.get("userId"), Some(&json!(3)));
	}
}
