use std::fmt;
use std::io::Cursor;

use openraft::{BasicNode, declare_raft_types};
use serde::{Deserialize, Serialize};

use crate::store::LockError;

pub type NodeId = u64;

/// Commands replicated through the log.
///
/// The serialized form is `{"op":"acquire"|"release","key":...,"value":...}`;
/// the log order, not command commutativity, defines the outcome.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum LockCommand {
    Acquire { key: String, value: String },
    Release { key: String, value: String },
}

impl LockCommand {
    /// The object the command targets.
    pub fn object(&self) -> &str {
        match self {
            LockCommand::Acquire { key, .. } | LockCommand::Release { key, .. } => key,
        }
    }

    /// The owner the command claims.
    pub fn owner(&self) -> &str {
        match self {
            LockCommand::Acquire { value, .. } | LockCommand::Release { value, .. } => value,
        }
    }
}

impl fmt::Display for LockCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockCommand::Acquire { key, value } => write!(f, "acquire {key} by {value}"),
            LockCommand::Release { key, value } => write!(f, "release {key} by {value}"),
        }
    }
}

/// Outcome of applying a command, conveyed back to the proposer through the
/// consensus future.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LockResponse {
    pub error: Option<LockError>,
}

impl LockResponse {
    pub fn into_result(self) -> Result<(), LockError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl From<Result<(), LockError>> for LockResponse {
    fn from(result: Result<(), LockError>) -> Self {
        Self { error: result.err() }
    }
}

declare_raft_types!(
    /// Type config for the lock service's replicated log.
    pub TypeConfig:
        D = LockCommand,
        R = LockResponse,
        NodeId = NodeId,
        Node = BasicNode,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_encoding() {
        let cmd = LockCommand::Acquire {
            key: "file1".into(),
            value: "owner1".into(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"op": "acquire", "key": "file1", "value": "owner1"})
        );
    }

    #[test]
    fn unknown_op_is_rejected() {
        let err = serde_json::from_str::<LockCommand>(r#"{"op":"frobnicate","key":"a","value":"b"}"#);
        assert!(err.is_err());
    }
}
