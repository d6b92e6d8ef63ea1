//! The single-threaded, `poll()`-driven event loop (§5).
//!
//! One listening socket plus a bounded [`Slab`] of [`Session`]s, all driven
//! from one thread with no locks: `mio::Poll` reports readiness, the broker
//! reads and dispatches, and a periodic pass handles timers that readiness
//! alone can't catch (connect timeout, keep-alive, QoS 1 retry).

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type as SocketType};

use crate::error::BrokerError;
use crate::limits::MAX_CLIENTS;
use crate::retained::RetainedStore;
use crate::router;
use crate::session::{Session, SessionEvent};

const LISTENER: Token = Token(usize::MAX);
const LISTEN_BACKLOG: i32 = 16;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Broker {
    listener: TcpListener,
    poll: Poll,
    sessions: Slab<Session>,
    retained: RetainedStore,
}

impl Broker {
    pub fn bind(port: u16) -> Result<Self, BrokerError> {
        let listener = bind_dual_stack(port).map_err(|source| BrokerError::Bind { port, source })?;
        let poll = Poll::new().map_err(|source| BrokerError::Bind { port, source })?;

        let mut listener = listener;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|source| BrokerError::Bind { port, source })?;

        log::info!("listening on {:?}", listener.local_addr());

        Ok(Broker {
            listener,
            poll,
            sessions: Slab::with_capacity(MAX_CLIENTS),
            retained: RetainedStore::new(crate::limits::MAX_RETAINED),
        })
    }

    /// Run the event loop until `running` goes false. Returns once a clean
    /// shutdown has been requested.
    pub fn run(&mut self, running: &std::sync::atomic::AtomicBool) -> io::Result<()> {
        let mut events = Events::with_capacity(MAX_CLIENTS + 1);

        while running.load(std::sync::atomic::Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                if event.token() == LISTENER {
                    self.accept_all();
                } else {
                    self.service(event.token());
                }
            }

            self.run_timers();
        }

        self.shutdown();

        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.accept_one(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn accept_one(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.sessions.len() >= MAX_CLIENTS {
            log::warn!("rejecting connection from {addr}: at capacity ({MAX_CLIENTS} clients)");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("failed to set TCP_NODELAY for {addr}: {e}");
        }

        let mut session = Session::new(stream);
        let key = self.sessions.vacant_key();

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut session.socket, Token(key), Interest::READABLE)
        {
            log::warn!("failed to register connection from {addr}: {e}");
            return;
        }

        log::debug!("accepted connection #{key} from {addr}");
        self.sessions.insert(session);
    }

    fn service(&mut self, token: Token) {
        let key = token.0;

        let result = match self.sessions.get_mut(key) {
            Some(session) => session.on_readable(&mut self.retained),
            None => return,
        };

        let events = match result {
            Ok(events) => events,
            Err(e) => {
                log::debug!("session #{key} read error: {e}");
                if let Some(session) = self.sessions.get_mut(key) {
                    session.closed = true;
                }
                Vec::new()
            }
        };

        for event in events {
            match event {
                SessionEvent::Publish { topic, payload, qos } => {
                    router::route_publish(&mut self.sessions, &topic, &payload, qos);
                }
                SessionEvent::Connected { client_id } => self.evict_duplicate(key, &client_id),
            }
        }

        self.reap(key);
    }

    /// A CONNECT just installed `client_id` on session `key`; any other
    /// Connected session already holding that id loses the race and is torn
    /// down immediately with its will suppressed, per the "new connection
    /// wins" rule.
    fn evict_duplicate(&mut self, key: usize, client_id: &str) {
        let other = self
            .sessions
            .iter()
            .find(|&(k, s)| k != key && s.is_connected() && s.client_id == client_id)
            .map(|(k, _)| k);

        if let Some(other_key) = other {
            log::debug!("client id {client_id} reconnected, evicting session #{other_key}");
            if let Some(session) = self.sessions.get_mut(other_key) {
                session.take_will();
                session.closed = true;
            }
            self.reap(other_key);
        }
    }

    fn reap(&mut self, key: usize) {
        let closed = matches!(self.sessions.get(key), Some(s) if s.closed);
        if !closed {
            return;
        }

        let mut session = self.sessions.remove(key);
        let _ = self.poll.registry().deregister(&mut session.socket);

        if let Some(will) = session.take_will() {
            log::debug!("publishing last will for #{key} on {}", will.topic);
            if will.retain {
                self.retained.store(&will.topic, &will.payload, will.qos);
            }
            router::route_will(&mut self.sessions, &will);
        }
    }

    fn run_timers(&mut self) {
        let now = Instant::now();
        let mut to_close = Vec::new();

        for (key, session) in self.sessions.iter_mut() {
            if session.is_connect_timed_out(now) {
                log::debug!("#{key} timed out before CONNECT");
                to_close.push(key);
                continue;
            }
            if session.is_keep_alive_expired(now) {
                log::debug!("#{key} keep-alive expired");
                to_close.push(key);
                continue;
            }
            session.retry_inflight(now);
            if session.closed {
                to_close.push(key);
            }
        }

        for key in to_close {
            if let Some(session) = self.sessions.get_mut(key) {
                session.closed = true;
            }
            self.reap(key);
        }
    }

    fn shutdown(&mut self) {
        log::info!("shutting down, closing {} connections", self.sessions.len());
        for (_, mut session) in self.sessions.drain() {
            let _ = self.poll.registry().deregister(&mut session.socket);
        }
    }
}

/// Prefer a dual-stack IPv6 listener (so IPv4 clients connect via a
/// mapped address on the same socket); fall back to IPv4-only if the
/// platform or network stack won't allow it.
fn bind_dual_stack(port: u16) -> io::Result<TcpListener> {
    match bind_v6_dual_stack(port) {
        Ok(listener) => Ok(listener),
        Err(e) => {
            log::debug!("dual-stack bind on [::]:{port} failed ({e}), falling back to IPv4");
            let std_listener = StdTcpListener::bind(("0.0.0.0", port))?;
            std_listener.set_nonblocking(true)?;
            Ok(TcpListener::from_std(std_listener))
        }
    }
}

fn bind_v6_dual_stack(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, SocketType::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = (std::net::Ipv6Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}
