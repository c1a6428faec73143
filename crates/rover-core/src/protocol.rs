//! Packet protocol layer.
//!
//! [`UartController`] correlates responses with outstanding requests and
//! routes notifications to subscribers. Correlation is by attribute only:
//! each attribute has a FIFO of pending requests and an `ACK` or `ERROR_*`
//! for that attribute resolves the oldest one. The engine never has more
//! than one transaction in flight per attribute because its command lane
//! runs transactions one at a time.
//!
//! The controller itself is synchronous and owns no I/O. [`transaction`]
//! drives one request over a [`Link`] against a controller held in a mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use rover_types::packet::describe;
use rover_types::{AttributeType, OpCode, Packet};

use crate::error::{Error, Result};
use crate::transport::Link;

/// Callback invoked with the payload of each `NOTIFY` for an attribute.
pub type NotifyCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

struct PendingRequest {
    id: u64,
    op_code: OpCode,
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// Handle to a registered request.
#[derive(Debug)]
pub struct Ticket {
    /// Attribute the request was registered under.
    pub attribute: AttributeType,
    /// Identifier used to withdraw the request.
    pub id: u64,
    /// Resolved by the matching response, or by a reset.
    pub reply: oneshot::Receiver<Result<Vec<u8>>>,
}

/// Subscribers due to receive one notification.
pub struct Notification {
    attribute: AttributeType,
    payload: Vec<u8>,
    callbacks: Vec<NotifyCallback>,
}

impl Notification {
    /// Invoke every subscriber in registration order.
    pub fn deliver(self) {
        for callback in &self.callbacks {
            callback(&self.payload);
        }
    }

    /// Attribute that was notified.
    pub fn attribute(&self) -> AttributeType {
        self.attribute
    }

    /// Number of subscribers that will be called.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// Pending-request table and notification subscriptions.
#[derive(Default)]
pub struct UartController {
    pending: HashMap<AttributeType, VecDeque<PendingRequest>>,
    subscriptions: HashMap<AttributeType, Vec<NotifyCallback>>,
    next_id: u64,
}

impl UartController {
    /// Create an empty controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request for `attribute` and return its ticket.
    pub fn register(&mut self, op_code: OpCode, attribute: AttributeType, payload: &[u8]) -> Ticket {
        let (reply, rx) = oneshot::channel();
        self.next_id += 1;
        let id = self.next_id;
        self.pending
            .entry(attribute)
            .or_default()
            .push_back(PendingRequest {
                id,
                op_code,
                payload: payload.to_vec(),
                reply,
            });
        Ticket {
            attribute,
            id,
            reply: rx,
        }
    }

    /// Withdraw a request that will no longer be waited on.
    ///
    /// Returns `false` when the request was already resolved.
    pub fn forget(&mut self, attribute: AttributeType, id: u64) -> bool {
        let Some(queue) = self.pending.get_mut(&attribute) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|request| request.id != id);
        before != queue.len()
    }

    /// Number of requests awaiting a response for `attribute`.
    pub fn pending_len(&self, attribute: AttributeType) -> usize {
        self.pending.get(&attribute).map_or(0, VecDeque::len)
    }

    /// Append a notification callback for `attribute`.
    pub fn subscribe(&mut self, attribute: AttributeType, callback: NotifyCallback) {
        self.subscriptions.entry(attribute).or_default().push(callback);
    }

    /// Drop every callback for `attribute`.
    pub fn unsubscribe(&mut self, attribute: AttributeType) {
        self.subscriptions.remove(&attribute);
    }

    /// Drop every callback for every attribute.
    pub fn clear_subscriptions(&mut self) {
        self.subscriptions.clear();
    }

    /// Number of callbacks registered for `attribute`.
    pub fn subscriber_count(&self, attribute: AttributeType) -> usize {
        self.subscriptions.get(&attribute).map_or(0, Vec::len)
    }

    /// Fail every pending request with [`Error::Cancelled`].
    ///
    /// Returns how many requests were cancelled.
    pub fn clear_response_queues(&mut self) -> usize {
        let mut cancelled = 0;
        for (_, queue) in self.pending.drain() {
            for request in queue {
                cancelled += 1;
                let _ = request.reply.send(Err(Error::Cancelled));
            }
        }
        if cancelled > 0 {
            debug!(cancelled, "Cancelled pending requests");
        }
        cancelled
    }

    /// Cancel everything pending and drop every subscription.
    pub fn reset(&mut self) {
        self.clear_response_queues();
        self.clear_subscriptions();
    }

    /// Route an incoming packet.
    ///
    /// Responses resolve the oldest pending request for their attribute and
    /// are dropped when none is pending. A `NOTIFY` yields the subscribers
    /// to call, which the caller should invoke once it has released any lock
    /// around the controller.
    pub fn route(&mut self, packet: Packet) -> Option<Notification> {
        let Packet {
            op_code,
            attribute,
            payload,
        } = packet;

        if op_code == OpCode::Notify {
            let callbacks = self.subscriptions.get(&attribute).cloned().unwrap_or_default();
            if callbacks.is_empty() {
                return None;
            }
            return Some(Notification {
                attribute,
                payload,
                callbacks,
            });
        }

        let request = self.pending.get_mut(&attribute).and_then(VecDeque::pop_front);

        if op_code == OpCode::Ack {
            match request {
                Some(request) => {
                    let _ = request.reply.send(Ok(payload));
                }
                None => debug!(%attribute, "Dropping ACK with no pending request"),
            }
            return None;
        }

        // READ and WRITE echoed back by the robot are rejections too.
        let response = describe(op_code, attribute, &payload);
        match request {
            Some(request) => {
                let sent = describe(request.op_code, attribute, &request.payload);
                let failure = Error::device(attribute, op_code, sent);
                error!("Request failed: {failure} (response: {response})");
                let _ = request.reply.send(Err(failure));
            }
            None => warn!("Robot reported {response} with no pending request"),
        }
        None
    }
}

impl std::fmt::Debug for UartController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending: usize = self.pending.values().map(VecDeque::len).sum();
        f.debug_struct("UartController")
            .field("pending", &pending)
            .field("subscribed_attributes", &self.subscriptions.len())
            .finish()
    }
}

pub(crate) fn lock(protocol: &Mutex<UartController>) -> MutexGuard<'_, UartController> {
    protocol.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Send one request and wait for its response.
///
/// On a link that [fakes acknowledgements](Link::fakes_ack) a `WRITE` is
/// resolved locally as soon as the write succeeds. A request that times out
/// is withdrawn, so a late response for it is dropped.
///
/// # Errors
///
/// [`Error::Timeout`] when nothing resolves the request in time,
/// [`Error::Device`] for an `ERROR_*` response, [`Error::Cancelled`] when a
/// reset discards the request, or the link's write error.
pub async fn transaction(
    protocol: &Mutex<UartController>,
    link: &Link,
    op_code: OpCode,
    attribute: AttributeType,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let packet = Packet::new(op_code, attribute, payload)?;
    let bytes = packet.encode()?;
    let mut ticket = lock(protocol).register(op_code, attribute, &packet.payload);

    if let Err(e) = link.write_timed(&bytes).await {
        lock(protocol).forget(attribute, ticket.id);
        debug!("Write of {} failed: {e}", packet.describe());
        return Err(e);
    }

    if link.fakes_ack() && op_code == OpCode::Write {
        lock(protocol).route(Packet::ack(attribute));
    }

    match tokio::time::timeout(timeout, &mut ticket.reply).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(Error::Cancelled),
        Err(_) => {
            lock(protocol).forget(attribute, ticket.id);
            Err(Error::timeout(packet.describe(), timeout))
        }
    }
}

/// Write a packet without registering for a response.
pub async fn send_unacknowledged(
    link: &Link,
    op_code: OpCode,
    attribute: AttributeType,
    payload: Vec<u8>,
) -> Result<()> {
    let packet = Packet::new(op_code, attribute, payload)?;
    link.write_timed(&packet.encode()?).await
}
