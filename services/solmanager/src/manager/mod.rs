//! Manager-facing side of the gateway: the link variants (serial,
//! jsonserver), the connection supervisor, and the network-time map.

pub mod connector;
pub mod jsonserver;
pub mod link;
pub mod serial;

pub use connector::{ConnState, Connector, ManagerHandle, TimeMap};
pub use link::{LinkError, LinkEvent, LinkSession, ManagerLink, RequestHandle, Requester};
