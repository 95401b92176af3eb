//! Wire protocol.
//!
//! Clients send [Request] frames, each naming an [Op] together with its
//! arguments. Operation frames carry an id that the server echoes in the
//! [Ack] it sends back. The outcome of a lock request is delivered later as
//! a separate [LockResponse] event.
//!
//! Arguments are validated before an operation reaches the broker; an invalid
//! operation is refused with an [Ack] whose `error` field describes the problem.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::{error::Error, fmt};

mod msg;

pub use msg::{AbortArgs, Ack, AuthenticateArgs, Event, LockArgs, LockResponse, Op, Request, ResourcesArgs};

/// Arguments of an operation are invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for ValidationError {}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Validates operation arguments and converts them into their typed form.
///
/// Unknown arguments are ignored.
pub fn validate<T>(args: Map<String, Value>) -> Result<T, ValidationError>
where
    T: DeserializeOwned,
{
    Ok(serde_json::from_value(Value::Object(args))?)
}
