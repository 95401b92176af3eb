use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::engine::RequestId;

/// Operation of a client frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    /// Authenticate the session.
    Authenticate,
    /// Lock resources without waiting.
    TryLock,
    /// Request a lock on resources.
    Lock,
    /// Release locked resources.
    Release,
    /// Abort a pending lock request.
    Abort,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Authenticate => "authenticate",
            Self::TryLock => "tryLock",
            Self::Lock => "lock",
            Self::Release => "release",
            Self::Abort => "abort",
        };
        write!(f, "{}", name)
    }
}

/// Frame sent from a client to the server.
///
/// The arguments are validated separately depending on the operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Requested operation.
    pub op: Op,
    /// Frame id echoed in the acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Operation arguments.
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

impl Request {
    /// Creates a request frame with the specified arguments.
    pub fn new(op: Op, id: Option<u64>, args: &impl Serialize) -> Result<Self, serde_json::Error> {
        let args = match serde_json::to_value(args)? {
            Value::Object(args) => args,
            _ => Map::new(),
        };
        Ok(Self { op, id, args })
    }
}

/// Arguments of [Op::Authenticate].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateArgs {
    /// Name of the client, used for logging.
    #[serde(default)]
    pub name: Option<String>,
    /// Authentication token.
    #[serde(default)]
    pub token: Option<String>,
}

/// Arguments of [Op::TryLock] and [Op::Release].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesArgs {
    /// Namespace; [None] is the default namespace.
    #[serde(default, deserialize_with = "deserialize_namespace")]
    pub namespace: Option<String>,
    /// Resources, a single string or a non-empty list of strings, none of them empty.
    #[serde(deserialize_with = "deserialize_resources")]
    pub resources: Vec<String>,
}

/// Arguments of [Op::Lock].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockArgs {
    /// Namespace; [None] is the default namespace.
    #[serde(default, deserialize_with = "deserialize_namespace")]
    pub namespace: Option<String>,
    /// Resources, a single string or a non-empty list of strings, none of them empty.
    #[serde(deserialize_with = "deserialize_resources")]
    pub resources: Vec<String>,
    /// Timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Arguments of [Op::Abort].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortArgs {
    /// Namespace; [None] is the default namespace.
    #[serde(default, deserialize_with = "deserialize_namespace")]
    pub namespace: Option<String>,
    /// Id of the lock request to abort.
    #[serde(deserialize_with = "deserialize_non_empty")]
    pub request_id: String,
}

fn non_empty<E>(value: String) -> Result<String, E>
where
    E: de::Error,
{
    if value.is_empty() {
        return Err(E::invalid_value(de::Unexpected::Str(""), &"a non-empty string"));
    }
    Ok(value)
}

fn deserialize_non_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    non_empty(String::deserialize(deserializer)?)
}

/// Accepts `null` for the default namespace or a non-empty name.
fn deserialize_namespace<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?.map(non_empty::<D::Error>).transpose()
}

/// Accepts a single non-empty string or a non-empty sequence of them.
fn deserialize_resources<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ResourcesVisitor;

    impl<'de> de::Visitor<'de> for ResourcesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a non-empty string or a non-empty list of non-empty strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![non_empty(v.to_string())?])
        }

        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![non_empty(v)?])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut resources = Vec::with_capacity(seq.size_hint().unwrap_or_default());
            while let Some(resource) = seq.next_element::<String>()? {
                resources.push(non_empty(resource)?);
            }
            if resources.is_empty() {
                return Err(de::Error::invalid_length(0, &self));
            }
            Ok(resources)
        }
    }

    deserializer.deserialize_any(ResourcesVisitor)
}

/// Frame sent from the server to a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// Acknowledgement of an operation.
    Ack(Ack),
    /// Outcome of a lock request.
    LockResponse(LockResponse),
    /// The session has been authenticated.
    Authenticated,
    /// Authentication failed.
    Unauthorized {
        /// Reason.
        message: String,
    },
}

/// Acknowledgement of an operation.
///
/// Exactly one of the result fields is set if `success` is true,
/// otherwise `error` is set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    /// Id of the acknowledged frame.
    pub id: u64,
    /// Whether the operation was carried out.
    pub success: bool,
    /// Result of [Op::TryLock].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_acquired: Option<bool>,
    /// Result of [Op::Lock].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Result of [Op::Release].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_released_resources_were_locked: Option<bool>,
    /// Result of [Op::Abort].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_existed: Option<bool>,
    /// Reason why the operation was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    /// Acknowledges [Op::TryLock].
    pub fn lock_acquired(id: u64, lock_acquired: bool) -> Self {
        Self { id, success: true, lock_acquired: Some(lock_acquired), ..Default::default() }
    }

    /// Acknowledges [Op::Lock].
    pub fn request_id(id: u64, request_id: RequestId) -> Self {
        Self { id, success: true, request_id: Some(request_id), ..Default::default() }
    }

    /// Acknowledges [Op::Release].
    pub fn released(id: u64, all_released_resources_were_locked: bool) -> Self {
        Self {
            id,
            success: true,
            all_released_resources_were_locked: Some(all_released_resources_were_locked),
            ..Default::default()
        }
    }

    /// Acknowledges [Op::Abort].
    pub fn request_existed(id: u64, request_existed: bool) -> Self {
        Self { id, success: true, request_existed: Some(request_existed), ..Default::default() }
    }

    /// Refuses an operation.
    pub fn error(id: u64, error: impl fmt::Display) -> Self {
        Self { id, success: false, error: Some(error.to_string()), ..Default::default() }
    }
}

/// Outcome of a lock request, delivered after the request has been acknowledged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    /// Whether the lock was granted.
    pub success: bool,
    /// Namespace of the request.
    pub namespace: Option<String>,
    /// Id of the request.
    pub request_id: RequestId,
    /// Reason why the lock was not granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
