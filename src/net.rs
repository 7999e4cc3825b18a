use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, error, warn};

use crate::transport::{BrokerAddr, Connection};
use crate::wire::Frame;
use crate::{AuthKey, Error, Message, Payload, PubSub, Result, Subscriber, Topic};

/// A [`PubSub`] with networking capabilities.
///
/// A `NetPubSub` hosts local subscribers exactly like [`PubSub`] and, once
/// connected, exchanges publications with every other endpoint attached to
/// the same broker. The type is single-threaded by design: the host drives
/// it through `publish` and `poll`, and subscribers run on the driving
/// thread only.
///
/// Remote messages are only observed when the host calls [`NetPubSub::poll`]
/// (or [`NetPubSub::wait_forever`]); nothing runs in the background.
pub struct NetPubSub {
    local: PubSub,
    address: RefCell<BrokerAddr>,
    authkey: RefCell<AuthKey>,
    conn: RefCell<Option<Connection>>,
    flushing: Cell<bool>,
    pending_send: RefCell<VecDeque<Message>>,
    pending_publish: RefCell<VecDeque<Message>>,
}

impl NetPubSub {
    /// Creates a disconnected endpoint aimed at the broker at `address`.
    pub fn new(address: BrokerAddr, authkey: AuthKey) -> Self {
        NetPubSub {
            local: PubSub::new(),
            address: RefCell::new(address),
            authkey: RefCell::new(authkey),
            conn: RefCell::new(None),
            flushing: Cell::new(false),
            pending_send: RefCell::new(VecDeque::new()),
            pending_publish: RefCell::new(VecDeque::new()),
        }
    }

    pub fn add_subscriber(&self, topic: impl Into<Topic>, subscriber: &Subscriber) {
        self.local.add_subscriber(topic, subscriber);
    }

    pub fn remove_subscriber(&self, topic: impl Into<Topic>, subscriber: &Subscriber) {
        self.local.remove_subscriber(topic, subscriber);
    }

    pub fn clear_subscribers(&self) {
        self.local.clear_subscribers();
    }

    pub fn is_connected(&self) -> bool {
        self.conn.borrow().is_some()
    }

    /// Changes the broker to connect to. Fails while connected.
    pub fn set_broker(&self, address: BrokerAddr, authkey: AuthKey) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        *self.address.borrow_mut() = address;
        *self.authkey.borrow_mut() = authkey;
        Ok(())
    }

    /// Connects and handshakes with the broker. Fails when already
    /// connected, on authentication failure, or on a bad handshake echo.
    pub fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        let conn = Connection::connect(&self.address.borrow(), &self.authkey.borrow())?;
        conn.send(&Frame::NewPubSub)?;
        match conn.recv()? {
            Frame::NewPubSub => {}
            frame => {
                conn.close();
                return Err(Error::Handshake(format!(
                    "expecting NewPubSub echo from broker, got {frame:?}"
                )));
            }
        }
        *self.conn.borrow_mut() = Some(conn);
        Ok(())
    }

    /// Tells the broker this endpoint is going away and closes the
    /// connection. Queued outbound messages are dropped. Fails when not
    /// connected.
    pub fn disconnect(&self) -> Result<()> {
        let Some(conn) = self.conn.borrow_mut().take() else {
            return Err(Error::NotConnected);
        };
        self.pending_send.borrow_mut().clear();
        if let Err(err) = conn.send(&Frame::Stop) {
            debug!("stop not delivered to broker: {err}");
        }
        conn.close();
        Ok(())
    }

    /// Publishes a message on a topic, locally and through the broker.
    ///
    /// When disconnected, or when the topic ends with
    /// [`crate::LOCAL_SUFFIX`], the message is dispatched to local
    /// subscribers only. Broker failures never surface here: the endpoint
    /// drops the connection and keeps serving local subscribers.
    pub fn publish(&self, topic: impl Into<Topic>, payload: Payload) {
        let topic = topic.into();
        if !self.is_connected() || topic.is_local() {
            self.local.publish(topic, &payload);
            return;
        }

        let message = Message { topic, payload };
        self.pending_publish.borrow_mut().push_back(message.clone());
        self.pending_send.borrow_mut().push_back(message);

        if !self.flushing.get() {
            self.flush();
        }
    }

    /// Checks the broker for new messages and dispatches them locally.
    ///
    /// Blocks up to `timeout` for broker input; `None` blocks until input
    /// arrives and `Some(Duration::ZERO)` probes without blocking. Returns
    /// whether any message was available. The host must call this (or
    /// [`NetPubSub::wait_forever`]) eventually or remote messages are
    /// never seen.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        {
            let conn = self.conn.borrow();
            let conn = conn.as_ref().ok_or(Error::NotConnected)?;
            if !conn.poll(timeout)? {
                return Ok(false);
            }
        }

        self.recv_all()?;

        if !self.flushing.get() {
            self.flush();
        }
        Ok(true)
    }

    /// Blocks forever forwarding messages between the broker and local
    /// subscribers. Returns only on error.
    pub fn wait_forever(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        loop {
            self.poll(None)?;
        }
    }

    /// Drains every already-readable inbound message into
    /// `pending_publish` without blocking. Broker EOF closes the
    /// connection and reads as [`Error::Disconnected`].
    fn recv_all(&self) -> Result<()> {
        loop {
            let frame = {
                let conn = self.conn.borrow();
                let Some(conn) = conn.as_ref() else {
                    return Ok(());
                };
                if !conn.poll(Some(Duration::ZERO))? {
                    return Ok(());
                }
                conn.recv()
            };
            match frame {
                Ok(Frame::Payload(message)) => {
                    self.pending_publish.borrow_mut().push_back(message);
                }
                Ok(frame) => warn!("ignoring unexpected frame from broker: {frame:?}"),
                Err(err) if err.is_disconnect() => {
                    self.drop_connection();
                    return Err(Error::Disconnected);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn drop_connection(&self) {
        self.pending_send.borrow_mut().clear();
        if let Some(conn) = self.conn.borrow_mut().take() {
            conn.close();
        }
    }

    /// The interleaving loop: alternates between draining broker input,
    /// sending one queued outbound message, and dispatching every queued
    /// inbound message locally. `publish` calls made by subscribers while
    /// this runs only append to the queues; the running flush picks them
    /// up, so delivery never recurses into a second flush.
    fn flush(&self) {
        debug_assert!(!self.flushing.get(), "already flushing");
        self.flushing.set(true);

        loop {
            if !self.is_connected() {
                break;
            }
            if self.pending_send.borrow().is_empty() && self.pending_publish.borrow().is_empty() {
                break;
            }

            if let Err(err) = self.recv_all() {
                debug!("broker connection lost while flushing: {err}");
                break;
            }

            let outbound = self.pending_send.borrow_mut().pop_front();
            if let Some(message) = outbound {
                let sent = {
                    let conn = self.conn.borrow();
                    conn.as_ref().map(|conn| conn.send(&Frame::Payload(message)))
                };
                match sent {
                    Some(Ok(())) => {}
                    Some(Err(err)) if err.is_disconnect() => {
                        self.drop_connection();
                        break;
                    }
                    Some(Err(err)) => error!("could not send: {err}"),
                    None => break,
                }
            }

            loop {
                let message = self.pending_publish.borrow_mut().pop_front();
                match message {
                    Some(message) => self.local.publish(message.topic, &message.payload),
                    None => break,
                }
            }
        }

        self.flushing.set(false);
    }
}
