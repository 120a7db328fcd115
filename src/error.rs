use std::io;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::icmp::IcmpCondition;

pub type Result<T> = std::result::Result<T, IcmpError>;

#[derive(Debug, Error)]
pub enum IcmpError {
    /// Opening a raw socket requires privileges the process does not have.
    #[error("insufficient privileges to open an ICMP socket")]
    Permission,

    #[error("cannot assign source address {address}: {source}")]
    AddressBinding {
        address: IpAddr,
        #[source]
        source: io::Error,
    },

    #[error("broadcast is not permitted on this socket")]
    BroadcastDenied,

    #[error("no reply within {0:?}")]
    TimeoutExceeded(Duration),

    #[error("{0}")]
    Condition(IcmpCondition),

    #[error("the socket is closed")]
    Unavailable,

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("cannot resolve '{0}'")]
    NameLookup(String),
}

impl IcmpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, IcmpError::TimeoutExceeded(_))
    }
}
