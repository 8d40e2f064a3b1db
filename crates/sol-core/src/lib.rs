// sol-core: SOL object model and codec.
//
// Everything that knows the shape of a sensor object lives here: the
// canonical record type, the framed binary encoding, the HTTP publish
// payload, the append-only backup file, and the Manager-notification
// transform.  The gateway daemon depends on this crate and never touches
// the wire layout directly.

pub mod backup;
pub mod bin_codec;
pub mod http_payload;
pub mod notif;
pub mod object;

pub use notif::{NetTime, Notification};
pub use object::{Mac, SolObject, SolType};

/// SOL payload format version, as `[major, minor, patch, build]`.
pub const SOL_VERSION: [u32; 4] = [1, 7, 2, 0];

/// Version of the Manager API surface this gateway speaks, as
/// `[major, minor, patch, build]`.
pub const SDK_VERSION: [u32; 4] = [1, 3, 0, 1];
