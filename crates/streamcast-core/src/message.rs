//! Wire protocol messages.
//!
//! One JSON object per line, discriminated by a required `command`
//! string. The full set of commands is closed; decoding distinguishes
//! a malformed body (recoverable, the sender gets INVALID_MESSAGE and
//! stays connected) from an unknown command (the connection is
//! dropped).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `activity` object carried by ACTIVITY_MESSAGE. Only `object` is
/// interpreted; anything else the client attaches travels along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub object: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Activity {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            extra: HashMap::new(),
        }
    }
}

/// Every message that can appear on the wire.
///
/// Credential-bearing fields on client commands are decoded as options
/// so handlers can answer absence with the protocol-level failure
/// (LOGIN_FAILED, AUTHENTICATION_FAIL) rather than a generic decode
/// error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Authenticate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    AuthenticationFail {
        info: String,
    },
    Login {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    LoginSuccess {
        info: String,
    },
    LoginFailed {
        info: String,
    },
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    RegisterSuccess {
        info: String,
    },
    RegisterFailed {
        info: String,
    },
    Logout {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    ClientAuthenticate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Redirect {
        host: String,
        port: u16,
        id: String,
    },
    ActivityMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        activity: Option<Activity>,
    },
    ActivityBroadcast {
        actor: String,
        object: String,
    },
    ServerAnnounce {
        id: String,
        hostname: String,
        port: u16,
        load: u32,
        #[serde(rename = "userList")]
        user_list: HashMap<String, String>,
        #[serde(rename = "allJSONMessage")]
        all_json_message: BTreeMap<String, String>,
    },
    LockRequest {
        username: String,
        secret: String,
        #[serde(rename = "originalServer")]
        original_server: String,
    },
    LockAllowed {
        username: String,
        secret: String,
        #[serde(rename = "originalServer")]
        original_server: String,
    },
    LockDenied {
        username: String,
        secret: String,
        #[serde(rename = "originalServer")]
        original_server: String,
    },
    RequestAll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        #[serde(
            rename = "allActivityMessage",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        all_activity_message: Option<BTreeMap<String, String>>,
    },
    InvalidMessage {
        info: String,
    },
}

const KNOWN_COMMANDS: &[&str] = &[
    "AUTHENTICATE",
    "AUTHENTICATION_FAIL",
    "LOGIN",
    "LOGIN_SUCCESS",
    "LOGIN_FAILED",
    "REGISTER",
    "REGISTER_SUCCESS",
    "REGISTER_FAILED",
    "LOGOUT",
    "CLIENT_AUTHENTICATE",
    "REDIRECT",
    "ACTIVITY_MESSAGE",
    "ACTIVITY_BROADCAST",
    "SERVER_ANNOUNCE",
    "LOCK_REQUEST",
    "LOCK_ALLOWED",
    "LOCK_DENIED",
    "REQUEST_ALL",
    "INVALID_MESSAGE",
];

impl Message {
    /// The wire command this message carries.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Authenticate { .. } => "AUTHENTICATE",
            Message::AuthenticationFail { .. } => "AUTHENTICATION_FAIL",
            Message::Login { .. } => "LOGIN",
            Message::LoginSuccess { .. } => "LOGIN_SUCCESS",
            Message::LoginFailed { .. } => "LOGIN_FAILED",
            Message::Register { .. } => "REGISTER",
            Message::RegisterSuccess { .. } => "REGISTER_SUCCESS",
            Message::RegisterFailed { .. } => "REGISTER_FAILED",
            Message::Logout { .. } => "LOGOUT",
            Message::ClientAuthenticate { .. } => "CLIENT_AUTHENTICATE",
            Message::Redirect { .. } => "REDIRECT",
            Message::ActivityMessage { .. } => "ACTIVITY_MESSAGE",
            Message::ActivityBroadcast { .. } => "ACTIVITY_BROADCAST",
            Message::ServerAnnounce { .. } => "SERVER_ANNOUNCE",
            Message::LockRequest { .. } => "LOCK_REQUEST",
            Message::LockAllowed { .. } => "LOCK_ALLOWED",
            Message::LockDenied { .. } => "LOCK_DENIED",
            Message::RequestAll { .. } => "REQUEST_ALL",
            Message::InvalidMessage { .. } => "INVALID_MESSAGE",
        }
    }

    /// Serialize to a single wire line (without the trailing newline).
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap()
    }

    pub fn invalid(info: impl Into<String>) -> Self {
        Message::InvalidMessage { info: info.into() }
    }
}

/// Why a wire line failed to decode.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    /// Not JSON at all.
    #[error("not valid json: {0}")]
    Syntax(String),
    /// JSON, but not an object.
    #[error("message must be a json object")]
    NotAnObject,
    /// Object without a string `command` field.
    #[error("message must contain field command")]
    MissingCommand,
    /// A command outside the protocol's closed set.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// A recognized command whose body fails validation.
    #[error("malformed {command} message: {detail}")]
    MalformedFields { command: String, detail: String },
}

impl DecodeError {
    /// An unknown command is the one decode failure that costs the
    /// sender its connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::UnknownCommand(_))
    }
}

/// Decode one wire line into a [`Message`].
pub fn decode(line: &str) -> Result<Message, DecodeError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| DecodeError::Syntax(e.to_string()))?;
    let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;
    let command = obj
        .get("command")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingCommand)?
        .to_owned();

    if !KNOWN_COMMANDS.contains(&command.as_str()) {
        return Err(DecodeError::UnknownCommand(command));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::MalformedFields {
        command,
        detail: e.to_string(),
    })
}
