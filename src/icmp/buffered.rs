use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{IcmpError, Result};
use crate::icmp::{Family, IcmpReply, IcmpRequest, IcmpSocket, IcmpTransport};

// How long the reader blocks before rechecking whether it should stop
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// Replies nobody asked for are dropped once they are this old
const RETENTION: Duration = Duration::from_secs(30);
const PRUNE_THRESHOLD: usize = 1024;

type Key = (u16, u16);

struct Shared {
    replies: Mutex<HashMap<Key, VecDeque<IcmpReply>>>,
    arrived: Condvar,
    running: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<Key, VecDeque<IcmpReply>>> {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn file(&self, reply: IcmpReply) {
        let mut replies = self.lock();
        if replies.len() > PRUNE_THRESHOLD {
            let now = Instant::now();
            replies.retain(|_, queue| {
                queue
                    .back()
                    .is_some_and(|r| now.saturating_duration_since(r.received_at) < RETENTION)
            });
        }
        replies
            .entry((reply.id, reply.sequence))
            .or_default()
            .push_back(reply);
        drop(replies);
        self.arrived.notify_all();
    }
}

/// Lets several requests be in flight on one socket.
///
/// A background thread drains the transport and files every reply under its
/// (identifier, sequence). `receive` waits for its own key only, with the
/// deadline counted from when the request was sent.
pub struct BufferedSocket<T: IcmpTransport + 'static = IcmpSocket> {
    transport: Arc<T>,
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl<T: IcmpTransport + 'static> BufferedSocket<T> {
    pub fn new(transport: T) -> Result<Self> {
        let transport = Arc::new(transport);
        let shared = Arc::new(Shared {
            replies: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let reader = thread::Builder::new()
            .name("icmp-reader".to_string())
            .spawn({
                let transport = Arc::clone(&transport);
                let shared = Arc::clone(&shared);
                move || read_loop(transport.as_ref(), &shared)
            })?;

        Ok(Self {
            transport,
            shared,
            reader: Some(reader),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn send(&self, request: &mut IcmpRequest) -> Result<()> {
        self.transport.send(request)
    }

    /// Waits for the oldest reply filed under `request`'s key.
    pub fn receive(&self, request: &IcmpRequest, timeout: Duration) -> Result<IcmpReply> {
        let start = request.sent_at().unwrap_or_else(Instant::now);
        let key = (request.id(), request.sequence());
        self.wait_for(start + timeout, timeout, |replies| {
            let queue = replies.get_mut(&key)?;
            let reply = queue.pop_front();
            if queue.is_empty() {
                replies.remove(&key);
            }
            reply
        })
    }

    /// Waits for any reply at all.
    pub fn receive_any(&self, timeout: Duration) -> Result<IcmpReply> {
        self.wait_for(Instant::now() + timeout, timeout, |replies| {
            let key = *replies.keys().next()?;
            let queue = replies.get_mut(&key)?;
            let reply = queue.pop_front();
            if queue.is_empty() {
                replies.remove(&key);
            }
            reply
        })
    }

    fn wait_for<F>(&self, deadline: Instant, timeout: Duration, mut take: F) -> Result<IcmpReply>
    where
        F: FnMut(&mut HashMap<Key, VecDeque<IcmpReply>>) -> Option<IcmpReply>,
    {
        let mut replies = self.shared.lock();
        loop {
            if let Some(reply) = take(&mut *replies) {
                return Ok(reply);
            }
            if !self.shared.running.load(Ordering::Acquire) {
                return Err(IcmpError::Unavailable);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(IcmpError::TimeoutExceeded(timeout));
            }
            replies = self
                .shared
                .arrived
                .wait_timeout(replies, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stops the reader and hands the transport back.
    pub fn detach(mut self) -> Result<T> {
        self.stop_reader();
        let transport = Arc::clone(&self.transport);
        drop(self);
        Arc::try_unwrap(transport).map_err(|_| IcmpError::Unavailable)
    }

    fn stop_reader(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::warn!("ICMP reader thread panicked");
            }
        }
    }
}

impl<T: IcmpTransport + 'static> IcmpTransport for BufferedSocket<T> {
    fn family(&self) -> Family {
        self.transport.family()
    }

    fn send(&self, request: &mut IcmpRequest) -> Result<()> {
        BufferedSocket::send(self, request)
    }

    fn receive(&self, request: Option<&IcmpRequest>, timeout: Duration) -> Result<IcmpReply> {
        match request {
            Some(request) => BufferedSocket::receive(self, request, timeout),
            None => self.receive_any(timeout),
        }
    }
}

impl<T: IcmpTransport + 'static> Drop for BufferedSocket<T> {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

fn read_loop<T: IcmpTransport + ?Sized>(transport: &T, shared: &Shared) {
    while shared.running.load(Ordering::Acquire) {
        match transport.receive(None, POLL_INTERVAL) {
            Ok(reply) => shared.file(reply),
            Err(IcmpError::TimeoutExceeded(_)) => continue,
            Err(e) => {
                log::warn!("ICMP reader stopped: {}", e);
                break;
            }
        }
    }
    shared.running.store(false, Ordering::Release);
    // Wake waiters so they notice the reader is gone
    let _guard = shared.lock();
    shared.arrived.notify_all();
}
