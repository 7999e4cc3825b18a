use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::auth::AuthKey;
use crate::transport::{wait_readable, BrokerAddr, Connection, Listener};
use crate::wire::Frame;
use crate::{Error, Message, Result};

/// How often the accept loop wakes up to look for a stop request.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Broker construction parameters.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to listen on; `None` lets the transport pick a local one.
    pub address: Option<BrokerAddr>,
    /// How long a freshly accepted client gets to send its handshake.
    pub handshake_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            address: None,
            handshake_timeout: Duration::from_millis(500),
        }
    }
}

type Clients = Arc<Mutex<HashMap<u64, Arc<Connection>>>>;

fn lock_clients(clients: &Clients) -> MutexGuard<'_, HashMap<u64, Arc<Connection>>> {
    clients.lock().unwrap_or_else(|err| err.into_inner())
}

/// Requests a clean broker shutdown: the acceptor stops the forwarder over
/// the control connection, joins it, and [`Broker::start`] returns.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// The process that connects publishers and subscribers.
///
/// The broker accepts authenticated endpoint connections and forwards
/// every received publication to every other connected endpoint. It is
/// stateless with respect to topics: matching happens in the endpoints.
///
/// Two threads cooperate. The caller of [`Broker::start`] accepts and
/// handshakes clients; a forwarder thread multiplexes the connected
/// clients and fans messages out. The threads coordinate over a control
/// connection the broker opens to its own listener: the acceptor sends
/// `NewConn` after adding a client and waits for the echo, so the
/// forwarder has always observed a new client before the next accept.
pub struct Broker {
    listener: Arc<Listener>,
    clients: Clients,
    authkey: AuthKey,
    handshake_timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl Broker {
    /// Binds the listening socket. The broker does not run until
    /// [`Broker::start`] is called.
    pub fn bind(config: BrokerConfig, authkey: AuthKey) -> Result<Broker> {
        let listener = Listener::bind(config.address, authkey.clone())?;
        Ok(Broker {
            listener: Arc::new(listener),
            clients: Arc::default(),
            authkey,
            handshake_timeout: config.handshake_timeout,
            stop: Arc::default(),
        })
    }

    /// The address the broker is listening on.
    pub fn address(&self) -> &BrokerAddr {
        self.listener.address()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Runs the broker until a [`StopHandle`] asks it to stop.
    pub fn start(self) -> Result<()> {
        debug!("starting up broker at {}", self.listener.address());

        let forwarder = {
            let listener = Arc::clone(&self.listener);
            let clients = Arc::clone(&self.clients);
            thread::Builder::new()
                .name("fanout-forwarder".into())
                .spawn(move || forwarder_loop(&listener, &clients))?
        };

        // Establish the control connection through our own listener; the
        // forwarder accepts it and keeps the other end.
        let control = Connection::connect(self.listener.address(), &self.authkey)?;
        control.send(&Frame::Init)?;
        match control.recv()? {
            Frame::Init => {}
            frame => {
                return Err(Error::Handshake(format!(
                    "expecting Init echo on control connection, got {frame:?}"
                )))
            }
        }

        loop {
            if self.stop.load(Ordering::Acquire) {
                control.send(&Frame::Stop)?;
                control.recv()?;
                let _ = forwarder.join();
                debug!("broker stopped");
                return Ok(());
            }

            let conn = match self.listener.accept_timeout(ACCEPT_POLL) {
                Ok(None) => continue,
                Ok(Some(conn)) => conn,
                Err(Error::Auth(reason)) => {
                    error!("authentication error: {reason}");
                    continue;
                }
                Err(err) => return Err(err),
            };

            match conn.poll(Some(self.handshake_timeout)) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("client connection timeout");
                    conn.close();
                    continue;
                }
                Err(err) => {
                    warn!("client handshake failed: {err}");
                    conn.close();
                    continue;
                }
            }
            match conn.recv() {
                Ok(Frame::NewPubSub) => {}
                Ok(frame) => {
                    error!("expecting NewPubSub from client, got {frame:?}");
                    conn.close();
                    continue;
                }
                Err(err) => {
                    warn!("client handshake failed: {err}");
                    conn.close();
                    continue;
                }
            }
            if let Err(err) = conn.send(&Frame::NewPubSub) {
                warn!("client handshake failed: {err}");
                conn.close();
                continue;
            }

            lock_clients(&self.clients).insert(conn.id(), Arc::new(conn));

            // Synchronous rendezvous: do not accept the next client until
            // the forwarder has seen this one.
            control.send(&Frame::NewConn)?;
            control.recv()?;
        }
    }
}

/// Accepts connections until the control connection shows up, then relays
/// and fans out until stopped.
fn forwarder_loop(listener: &Listener, clients: &Clients) {
    let mut pending: Vec<(u64, Message)> = Vec::new();

    let control = match control_conn(listener, clients, &mut pending) {
        Ok(control) => control,
        Err(err) => {
            error!("forwarder could not establish control connection: {err}");
            return;
        }
    };
    let control_id = control.id();

    let mut closed: HashSet<u64> = HashSet::new();
    let mut stop = false;

    loop {
        let snapshot: Vec<Arc<Connection>> = {
            let guard = lock_clients(clients);
            if guard.is_empty() {
                break;
            }
            guard.values().cloned().collect()
        };

        let refs: Vec<&Connection> = snapshot.iter().map(|conn| &**conn).collect();
        let ready = match wait_readable(&refs, None) {
            Ok(ready) => ready,
            Err(err) => {
                error!("forwarder wait failed: {err}");
                break;
            }
        };

        closed.clear();
        for index in ready {
            let conn = &snapshot[index];
            let frame = conn.recv();

            if conn.id() == control_id {
                match frame {
                    Ok(frame) => {
                        if control.send(&frame).is_err() {
                            stop = true;
                        }
                        match frame {
                            Frame::Stop => stop = true,
                            Frame::NewConn => {}
                            frame => warn!("unexpected control frame: {frame:?}"),
                        }
                    }
                    // Control EOF means the acceptor is gone.
                    Err(_) => stop = true,
                }
            } else {
                match frame {
                    Ok(Frame::Payload(message)) => pending.push((conn.id(), message)),
                    Ok(Frame::Stop) | Err(_) => {
                        closed.insert(conn.id());
                        conn.close();
                    }
                    Ok(frame) => {
                        warn!("unexpected frame from client: {frame:?}");
                        closed.insert(conn.id());
                        conn.close();
                    }
                }
            }
        }

        {
            let mut guard = lock_clients(clients);
            for id in &closed {
                guard.remove(id);
            }
        }

        if stop {
            debug!("exiting forwarder thread");
            break;
        }

        forward(control_id, clients, &mut pending);
    }

    let mut guard = lock_clients(clients);
    for (_, conn) in guard.drain() {
        conn.close();
    }
}

/// Forwarder startup: the acceptor cannot put the control connection into
/// the shared set itself, because the forwarder must recognize it before
/// the set is mutated concurrently. So the forwarder accepts the first few
/// connections directly, classifying `Init` as control; endpoints arriving
/// in this window are handshaken here, and an early payload is buffered
/// into the pending queue.
fn control_conn(
    listener: &Listener,
    clients: &Clients,
    pending: &mut Vec<(u64, Message)>,
) -> Result<Arc<Connection>> {
    loop {
        let conn = match listener.accept() {
            Ok(conn) => Arc::new(conn),
            Err(Error::Auth(reason)) => {
                error!("authentication error: {reason}");
                continue;
            }
            Err(err) => return Err(err),
        };
        lock_clients(clients).insert(conn.id(), Arc::clone(&conn));

        match conn.recv() {
            Ok(Frame::Init) => {
                conn.send(&Frame::Init)?;
                return Ok(conn);
            }
            Ok(Frame::NewPubSub) => {
                conn.send(&Frame::NewPubSub)?;
            }
            Ok(Frame::Payload(message)) => pending.push((conn.id(), message)),
            Ok(Frame::Stop) | Err(_) => {
                lock_clients(clients).remove(&conn.id());
                conn.close();
            }
            Ok(frame) => {
                warn!("unexpected frame during forwarder startup: {frame:?}");
                lock_clients(clients).remove(&conn.id());
                conn.close();
            }
        }
    }
}

/// One forwarding pass: every pending message goes to every client except
/// its source and the control connection. A destination that died is
/// closed and dropped from the set; other send failures are logged and do
/// not cost the destination its membership.
fn forward(control_id: u64, clients: &Clients, pending: &mut Vec<(u64, Message)>) {
    let mut closed: HashSet<u64> = HashSet::new();
    let snapshot: Vec<Arc<Connection>> = lock_clients(clients).values().cloned().collect();

    for (source, message) in pending.drain(..) {
        for conn in &snapshot {
            if conn.id() == source || conn.id() == control_id || closed.contains(&conn.id()) {
                continue;
            }
            match conn.send(&Frame::Payload(message.clone())) {
                Ok(()) => {}
                Err(err) if err.is_disconnect() => {
                    conn.close();
                    closed.insert(conn.id());
                }
                Err(err) => error!("could not send: {err}"),
            }
        }
    }

    let mut guard = lock_clients(clients);
    for id in &closed {
        guard.remove(id);
    }
}
