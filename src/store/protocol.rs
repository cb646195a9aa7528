//! Wire format spoken between [`RemoteStore`](super::RemoteStore) and
//! [`StoreServer`](super::StoreServer).
//!
//! Every message is a single JSON object terminated by `\n`.

use serde::{Deserialize, Serialize};

use super::{BackingStore, StoreError};

/// A store operation sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    Get { key: String },
    Set { key: String, value: u64 },
    Lock { key: String },
    Unlock { key: String },
}

/// The server's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Value { value: Option<u64> },
    Ok,
    Locked { acquired: bool },
    Error { message: String },
}

impl Request {
    /// Operation name, for logging.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::Set { .. } => "set",
            Request::Lock { .. } => "lock",
            Request::Unlock { .. } => "unlock",
        }
    }

    /// Execute this request against a local store.
    ///
    /// Store failures are folded into [`Response::Error`] so the connection
    /// survives them.
    pub async fn apply<S: BackingStore + ?Sized>(self, store: &S) -> Response {
        let result = match self {
            Request::Get { key } => store.get(&key).await.map(|value| Response::Value { value }),
            Request::Set { key, value } => store.set(&key, value).await.map(|_| Response::Ok),
            Request::Lock { key } => store
                .lock(&key)
                .await
                .map(|acquired| Response::Locked { acquired }),
            Request::Unlock { key } => store.unlock(&key).await.map(|_| Response::Ok),
        };

        result.unwrap_or_else(|e| Response::Error {
            message: e.to_string(),
        })
    }
}

impl Response {
    /// Interpret as the reply to a `get`.
    pub fn into_value(self) -> Result<Option<u64>, StoreError> {
        match self {
            Response::Value { value } => Ok(value),
            other => Err(other.unexpected("value")),
        }
    }

    /// Interpret as the reply to a `set` or `unlock`.
    pub fn into_unit(self) -> Result<(), StoreError> {
        match self {
            Response::Ok => Ok(()),
            other => Err(other.unexpected("ok")),
        }
    }

    /// Interpret as the reply to a `lock`.
    pub fn into_acquired(self) -> Result<bool, StoreError> {
        match self {
            Response::Locked { acquired } => Ok(acquired),
            other => Err(other.unexpected("locked")),
        }
    }

    fn unexpected(self, expected: &str) -> StoreError {
        match self {
            Response::Error { message } => StoreError::Backend(message),
            other => StoreError::Protocol(format!("expected {} response, got {:?}", expected, other)),
        }
    }
}
