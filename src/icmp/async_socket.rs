use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{IcmpError, Result};
use crate::icmp::{Family, IcmpReply, IcmpRequest, IcmpSocket, IcmpTransport};

/// Async front for a transport. Waiting for a reply runs on tokio's
/// blocking pool so the calling task yields instead of parking a worker.
pub struct AsyncIcmpSocket<T: IcmpTransport + 'static = IcmpSocket> {
    inner: Arc<T>,
}

impl<T: IcmpTransport + 'static> AsyncIcmpSocket<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(transport),
        }
    }

    pub fn family(&self) -> Family {
        self.inner.family()
    }

    /// Returns as soon as the OS accepted the datagram.
    pub fn send(&self, request: &mut IcmpRequest) -> Result<()> {
        self.inner.send(request)
    }

    pub async fn receive(&self, request: &IcmpRequest, timeout: Duration) -> Result<IcmpReply> {
        let transport = Arc::clone(&self.inner);
        let request = request.clone();
        tokio::task::spawn_blocking(move || transport.receive(Some(&request), timeout))
            .await
            .map_err(|e| IcmpError::Socket(io::Error::other(e)))?
    }

    /// Hands the transport back once no receive is in flight.
    pub fn detach(self) -> Result<T> {
        Arc::try_unwrap(self.inner).map_err(|_| IcmpError::Unavailable)
    }
}
