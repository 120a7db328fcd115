//! In-memory transports for exercising the engines without raw sockets.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{IcmpError, Result};
use crate::icmp::{Family, IcmpReply, IcmpRequest, IcmpTransport};

/// What the simulated network does with one request.
#[derive(Debug, Clone)]
pub(crate) enum Response {
    Echo { from: IpAddr, after: Duration },
    Condition { from: IpAddr, icmp_type: u8, code: u8, after: Duration },
    Silent,
}

type Script = Box<dyn Fn(&IcmpRequest) -> Response + Send + Sync>;

/// Answers each request according to a script, sleeping for the scripted
/// latency so wall-clock behaviour matches a real network.
pub(crate) struct ScriptedTransport {
    family: Family,
    script: Script,
    sent: Mutex<Vec<IcmpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        family: Family,
        script: impl Fn(&IcmpRequest) -> Response + Send + Sync + 'static,
    ) -> Self {
        Self {
            family,
            script: Box::new(script),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sent(&self) -> Vec<IcmpRequest> {
        self.sent.lock().unwrap().clone()
    }
}

impl IcmpTransport for ScriptedTransport {
    fn family(&self) -> Family {
        self.family
    }

    fn send(&self, request: &mut IcmpRequest) -> Result<()> {
        request.mark_sent(Instant::now());
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn receive(&self, request: Option<&IcmpRequest>, timeout: Duration) -> Result<IcmpReply> {
        let Some(request) = request else {
            thread::sleep(timeout);
            return Err(IcmpError::TimeoutExceeded(timeout));
        };
        let sent_at = request.sent_at().unwrap_or_else(Instant::now);

        let (from, icmp_type, code, after) = match (self.script)(request) {
            Response::Echo { from, after } => (from, self.family.echo_reply(), 0, after),
            Response::Condition { from, icmp_type, code, after } => (from, icmp_type, code, after),
            Response::Silent => {
                thread::sleep(timeout);
                return Err(IcmpError::TimeoutExceeded(timeout));
            }
        };

        if after > timeout {
            thread::sleep(timeout);
            return Err(IcmpError::TimeoutExceeded(timeout));
        }
        thread::sleep(after);

        Ok(IcmpReply {
            source: from,
            family: self.family,
            id: request.id(),
            sequence: request.sequence(),
            icmp_type,
            code,
            bytes_received: request.payload_size() + 8,
            received_at: sent_at + after,
            ttl: Some(64),
        })
    }
}

/// Hands out whatever replies were queued, in order, regardless of what
/// was requested. Feeds the demultiplexer.
pub(crate) struct QueueTransport {
    family: Family,
    inbox: Mutex<VecDeque<IcmpReply>>,
}

impl QueueTransport {
    pub(crate) fn new(family: Family) -> Self {
        Self {
            family,
            inbox: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, reply: IcmpReply) {
        self.inbox.lock().unwrap().push_back(reply);
    }

    pub(crate) fn pending(&self) -> usize {
        self.inbox.lock().unwrap().len()
    }
}

impl IcmpTransport for QueueTransport {
    fn family(&self) -> Family {
        self.family
    }

    fn send(&self, request: &mut IcmpRequest) -> Result<()> {
        request.mark_sent(Instant::now());
        Ok(())
    }

    fn receive(&self, _request: Option<&IcmpRequest>, timeout: Duration) -> Result<IcmpReply> {
        if let Some(reply) = self.inbox.lock().unwrap().pop_front() {
            return Ok(reply);
        }
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Err(IcmpError::TimeoutExceeded(timeout))
    }
}

pub(crate) fn echo_reply(family: Family, source: &str, id: u16, sequence: u16) -> IcmpReply {
    IcmpReply {
        source: source.parse().unwrap(),
        family,
        id,
        sequence,
        icmp_type: family.echo_reply(),
        code: 0,
        bytes_received: 64,
        received_at: Instant::now(),
        ttl: Some(64),
    }
}
