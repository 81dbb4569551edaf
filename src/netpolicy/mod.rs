//! Network policy primitives: allowlist entries and private-IP
//! classification. Pure functions, no I/O; the egress proxy layers DNS
//! resolution and enforcement on top.

mod allowlist;
mod ipcheck;

pub use allowlist::{AllowlistEntry, AllowlistError, normalize_host, parse_allowlist_entry};
pub use ipcheck::is_private_ip;
