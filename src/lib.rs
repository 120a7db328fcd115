//! ICMP echo engine: packet codec, raw and datagram sockets, and the ping,
//! multiping and traceroute algorithms built on them.

pub mod dns;
pub mod error;
pub mod icmp;
pub mod multiping;
pub mod ping;
pub mod stats;
pub mod traceroute;
pub mod utils;

pub use error::{IcmpError, Result};
pub use icmp::{Family, IcmpCondition, IcmpReply, IcmpRequest, IcmpSocket, IcmpTransport};
pub use multiping::{MultipingOptions, Strategy};
pub use ping::{PingOptions, ProbeOutcome};
pub use stats::{Hop, Host};
pub use traceroute::TracerouteOptions;
pub use utils::IdentifierSource;
