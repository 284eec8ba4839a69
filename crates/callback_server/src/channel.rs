// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Channels that let test code synchronise with intercepted transactions.
//!
//! A channel's [`callback`](PassiveChannel::callback) is registered with a
//! [`CallbackServer`](crate::CallbackServer) (usually through a proxy configuration),
//! and the test then receives each intercepted [`Data`] from the channel in the order
//! the callbacks delivered them.
//!
//! Blocking channels have no buffer, so the intercepted transaction stalls inside the
//! proxy until the test receives it. That is how tests tarpit requests and pair up
//! concurrent ones.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use tracing::debug;

use crate::data::{CallbackFn, Data, Response};
use crate::error::ChannelError;
use crate::scope::TestScope;

/// How many callbacks may be in flight on a non-blocking passive channel before they
/// start waiting on the test. Too low and concurrent callbacks block each other; too
/// high and a chatty test hoards memory.
pub const NON_BLOCKING_BUFFER: usize = 10;

/// Multi-producer queue that can be closed from any thread.
///
/// Every blocking operation also waits on `closed_signal`, whose sender is dropped on
/// close, so closing wakes parked senders and receivers at once and never waits for
/// them.
struct Mailbox<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    close_signal: Mutex<Option<Sender<()>>>,
    closed_signal: Receiver<()>,
    closed: AtomicBool,
}

impl<T> Mailbox<T> {
    /// A capacity of 0 makes every delivery wait for a receiver.
    fn bounded(capacity: usize) -> Self {
        Self::from_channel(bounded(capacity))
    }

    fn unbounded() -> Self {
        Self::from_channel(unbounded())
    }

    fn from_channel((sender, receiver): (Sender<T>, Receiver<T>)) -> Self {
        let (close_signal, closed_signal) = bounded(0);
        Self {
            sender,
            receiver,
            close_signal: Mutex::new(Some(close_signal)),
            closed_signal,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns false if the mailbox was closed before or while delivering.
    fn deliver(&self, item: T) -> bool {
        if self.is_closed() {
            return false;
        }
        let delivered = select! {
            send(self.sender, item) -> sent => sent.is_ok(),
            recv(self.closed_signal) -> _ => false,
        };
        // close() may have drained the queue just before this item landed in it.
        if delivered && self.is_closed() {
            self.drain();
            return false;
        }
        delivered
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<T, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        select! {
            recv(self.receiver) -> item => item.map_err(|_| ChannelError::Closed),
            recv(self.closed_signal) -> _ => Err(ChannelError::Closed),
            default(timeout) => Err(ChannelError::Timeout(timeout)),
        }
    }

    fn try_recv(&self) -> Result<Option<T>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        match self.receiver.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Closed),
        }
    }

    /// Returns true the first time only. Queued items are dropped.
    fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.close_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.drain();
        true
    }

    fn drain(&self) {
        while self.receiver.try_recv().is_ok() {}
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A channel which receives intercepted transactions but cannot modify them.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct PassiveChannel {
    mailbox: Arc<Mailbox<Data>>,
    timeout: Duration,
}

impl PassiveChannel {
    /// `timeout` bounds how long [`recv`](Self::recv) waits. If `blocking` is true,
    /// callbacks don't return until the test receives their data, which is useful for
    /// synchronising actions with the moment a callback fires.
    pub fn new(timeout: Duration, blocking: bool) -> Self {
        let capacity = if blocking { 0 } else { NON_BLOCKING_BUFFER };
        Self {
            mailbox: Arc::new(Mailbox::bounded(capacity)),
            timeout,
        }
    }

    /// The callback feeding this channel. It never modifies the transaction.
    pub fn callback(&self) -> CallbackFn {
        let mailbox = self.mailbox.clone();
        Arc::new(move |data| {
            if !mailbox.deliver(data) {
                debug!("PassiveChannel closed; letting transaction through");
            }
            None
        })
    }

    /// Block until the channel receives a transaction, failing the test with `msg` if
    /// none arrives within the timeout.
    pub fn recv(&self, scope: &TestScope, msg: impl Display) -> Data {
        self.recv_timeout()
            .unwrap_or_else(|err| scope.fatal(format_args!("{msg}: {err}")))
    }

    /// Like [`recv`](Self::recv) but reports the failure instead of failing the test.
    pub fn recv_timeout(&self) -> Result<Data, ChannelError> {
        self.mailbox.recv_timeout(self.timeout)
    }

    /// Take a waiting transaction without blocking. `None` means nothing was waiting,
    /// which is how tests assert that a callback did *not* happen.
    pub fn try_recv(&self) -> Option<Data> {
        self.mailbox.try_recv().ok().flatten()
    }

    /// Stop accepting transactions. Later callbacks let their transactions straight
    /// through. Calling this more than once is harmless.
    pub fn close(&self) {
        if self.mailbox.close() {
            debug!("PassiveChannel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

/// An intercepted transaction waiting for the test's verdict.
struct Pending {
    data: Data,
    reply: Sender<Option<Response>>,
}

/// A channel which receives intercepted transactions and decides their fate.
///
/// Every callback blocks the proxied transaction until the test has both
/// [`recv`](Self::recv)d its data and [`send`](Self::send)ed a verdict for it. Verdicts
/// are matched to transactions in the order they were received.
#[derive(Clone)]
pub struct ActiveChannel {
    inbox: Arc<Mailbox<Pending>>,
    /// Reply slots for transactions the test has received but not answered yet.
    unanswered: Arc<Mailbox<Sender<Option<Response>>>>,
    timeout: Duration,
}

impl ActiveChannel {
    /// `timeout` bounds how long [`recv`](Self::recv) and [`send`](Self::send) wait.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inbox: Arc::new(Mailbox::bounded(0)),
            // Filled by the test's own receives, which must never block on it.
            unanswered: Arc::new(Mailbox::unbounded()),
            timeout,
        }
    }

    /// The callback feeding this channel.
    ///
    /// If the channel is closed before the test answers, the transaction is let
    /// through unaltered.
    pub fn callback(&self) -> CallbackFn {
        let inbox = self.inbox.clone();
        Arc::new(move |data| {
            let (reply, verdict) = bounded(1);
            if !inbox.deliver(Pending { data, reply }) {
                debug!("ActiveChannel closed; letting transaction through");
                return None;
            }
            // Errors mean the reply slot was dropped by close().
            verdict.recv().unwrap_or(None)
        })
    }

    /// Block until the channel receives a transaction, failing the test with `msg` if
    /// none arrives within the timeout. The transaction stays blocked until
    /// [`send`](Self::send) is called.
    pub fn recv(&self, scope: &TestScope, msg: impl Display) -> Data {
        self.recv_timeout()
            .unwrap_or_else(|err| scope.fatal(format_args!("{msg}: {err}")))
    }

    pub fn recv_timeout(&self) -> Result<Data, ChannelError> {
        let pending = self.inbox.recv_timeout(self.timeout)?;
        Ok(self.hold(pending))
    }

    /// Take a waiting transaction without blocking.
    pub fn try_recv(&self) -> Option<Data> {
        let pending = self.inbox.try_recv().ok().flatten()?;
        Some(self.hold(pending))
    }

    fn hold(&self, pending: Pending) -> Data {
        let Pending { data, reply } = pending;
        // If this fails the channel was closed in the meantime, and dropping the
        // reply slot releases the transaction.
        self.unanswered.deliver(reply);
        data
    }

    /// Answer the oldest received transaction. `None` lets it through unaltered.
    ///
    /// Fails the test if there is no transaction to answer within the timeout. Sending
    /// on a closed channel does nothing.
    pub fn send(&self, scope: &TestScope, response: Option<Response>) {
        match self.try_send(response) {
            Ok(()) => {}
            Err(ChannelError::Closed) => debug!("ActiveChannel.send on a closed channel"),
            Err(err @ ChannelError::Timeout(_)) => scope.fatal(format_args!(
                "ActiveChannel.send timed out sending the response: {err}"
            )),
        }
    }

    /// Like [`send`](Self::send) but reports failures instead of failing the test.
    pub fn try_send(&self, response: Option<Response>) -> Result<(), ChannelError> {
        let reply = self.unanswered.recv_timeout(self.timeout)?;
        // The transaction may have been abandoned by the proxy; nothing to do then.
        if reply.send(response).is_err() {
            debug!("ActiveChannel verdict went unheard");
        }
        Ok(())
    }

    /// Close both directions at once. Blocked callbacks let their transactions
    /// through. Calling this more than once is harmless.
    pub fn close(&self) {
        if self.inbox.close() {
            self.unanswered.close();
            debug!("ActiveChannel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}
