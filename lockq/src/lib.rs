//! lockq: a network-reachable advisory lock broker
//!
//! Clients lock named resources, which are opaque strings grouped into
//! namespaces. A lock request names a set of resources and is granted
//! atomically: either all of them are locked for the requester or none is.
//! Requests that cannot be granted right away wait in a queue and are granted
//! in order of arrival once their resources become free, unless they time out
//! or are aborted first.
//!
//! Locks are advisory: the broker does not protect the resources themselves,
//! it only coordinates clients that agree to use it.
//!
//! The crate consists of
//!
//! * the synchronous lock [engine],
//! * the [broker], which runs an engine on a single task,
//! * a TCP [server] speaking a length-delimited JSON [protocol](proto),
//! * a [client] for that protocol.
//!
//! # Example
//!
//! ```no_run
//! use lockq::{client::{Client, ClientCfg}, server::Server, Cfg};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::bind("127.0.0.1:0", Cfg::default()).await?;
//! let addr = server.local_addr()?;
//! tokio::spawn(server.run());
//!
//! let client = Client::connect(addr, ClientCfg::default()).await?;
//! assert!(client.try_lock(["printer"]).await?);
//! assert!(client.release(["printer"]).await?);
//! # Ok(())
//! # }
//! ```

pub mod broker;
mod cfg;
pub mod client;
pub mod engine;
pub mod proto;
pub mod server;
pub mod transport;

pub use cfg::Cfg;
