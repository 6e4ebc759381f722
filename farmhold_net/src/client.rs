// Client side of the transport.
//
// Mirrors the server's shape with a single connection: one receive thread
// queues frames, handle_callbacks drains them on the owner's thread. The
// handshake frame is consumed inside the receive thread, so the assigned id
// becomes visible without waiting for a drain pass.

use std::collections::HashMap;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use farmhold_protocol::registry::{Packet, PacketFields, PacketRegistry};
use farmhold_protocol::types::{ClientId, PacketId};
use farmhold_protocol::wire::WireReader;

use crate::conn::{self, Connection, Envelope};

/// Sentinel meaning the server has not assigned us an id yet.
const UNASSIGNED: u32 = u32::MAX;

type PacketHandler = Box<dyn FnMut(&[u8])>;

pub struct SocketClient {
    registry: Arc<PacketRegistry>,
    running: Arc<AtomicBool>,
    assigned_id: Arc<AtomicU32>,
    conn: Option<Arc<Connection>>,
    handlers: HashMap<PacketId, PacketHandler>,
    on_disconnected: Option<Box<dyn FnMut()>>,
    /// Latched once the disconnect notification has fired, so it fires at
    /// most once per connection.
    disconnect_notified: bool,
}

impl SocketClient {
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self {
            registry,
            running: Arc::new(AtomicBool::new(false)),
            assigned_id: Arc::new(AtomicU32::new(UNASSIGNED)),
            conn: None,
            handlers: HashMap::new(),
            on_disconnected: None,
            disconnect_notified: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True while the receive thread still has a live socket.
    pub fn is_connected(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| conn.alive.load(Ordering::SeqCst))
    }

    /// The server-assigned id, once the handshake has arrived.
    pub fn client_id(&self) -> Option<ClientId> {
        match self.assigned_id.load(Ordering::SeqCst) {
            UNASSIGNED => None,
            id => Some(ClientId(id)),
        }
    }

    /// Connect synchronously and start the receive thread.
    pub fn start(&mut self, addr: impl ToSocketAddrs) -> io::Result<()> {
        if self.is_running() {
            tracing::warn!("socket client already connected; start ignored");
            return Ok(());
        }
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("connect failed: {e}");
                return Err(e);
            }
        };
        if let Ok(peer) = stream.peer_addr() {
            tracing::info!("connected to {peer}");
        }

        self.assigned_id.store(UNASSIGNED, Ordering::SeqCst);
        self.disconnect_notified = false;
        self.running.store(true, Ordering::SeqCst);

        let conn = Arc::new(Connection::new(stream));
        let thread_conn = Arc::clone(&conn);
        let running = Arc::clone(&self.running);
        let assigned = Arc::clone(&self.assigned_id);
        let handle = thread::spawn(move || {
            conn::receive_into(&thread_conn, &running, |envelope| {
                if envelope.id == PacketId::HANDSHAKE {
                    let mut reader = WireReader::new(&envelope.body);
                    match reader.take_u32() {
                        Ok(id) => assigned.store(id, Ordering::SeqCst),
                        Err(e) => tracing::warn!("malformed handshake: {e}"),
                    }
                    return;
                }
                thread_conn
                    .inbound
                    .lock()
                    .expect("inbound queue lock poisoned")
                    .push(envelope);
            });
        });
        *conn
            .thread
            .lock()
            .expect("receive thread handle lock poisoned") = Some(handle);
        self.conn = Some(conn);
        Ok(())
    }

    /// Send one packet. Failures are logged and dropped; an actual broken
    /// connection surfaces through the disconnect notification.
    pub fn send(&self, packet: &Packet) {
        let Some(conn) = &self.conn else {
            tracing::warn!("send while not connected; dropped");
            return;
        };
        if let Err(e) = conn.send_frame(packet.bytes()) {
            tracing::warn!("send failed: {e}");
        }
    }

    /// Install the receive callback for `id`, validated against the
    /// registry exactly like the server side.
    pub fn on_packet<P, F>(&mut self, id: PacketId, mut callback: F)
    where
        P: PacketFields,
        F: FnMut(P) + 'static,
    {
        if !self.registry.matches::<P>(id) {
            return;
        }
        let name = self.registry.name_of(id).unwrap_or("unknown");
        self.handlers.insert(
            id,
            Box::new(move |body| {
                let mut reader = WireReader::new(body);
                match P::take(&mut reader) {
                    Ok(fields) => callback(fields),
                    Err(e) => tracing::warn!("dropping {name}: {e}"),
                }
            }),
        );
    }

    /// Install the connection-lost notification. Fires from
    /// handle_callbacks, after any packets that arrived before the close,
    /// and at most once per connection.
    pub fn on_disconnected(&mut self, callback: impl FnMut() + 'static) {
        self.on_disconnected = Some(Box::new(callback));
    }

    /// Drain queued packets into their callbacks on the caller's thread.
    pub fn handle_callbacks(&mut self) {
        if !self.is_running() {
            tracing::warn!("handle_callbacks on a stopped client ignored");
            return;
        }
        let Some(conn) = self.conn.as_ref().map(Arc::clone) else {
            return;
        };

        let envelopes = std::mem::take(
            &mut *conn.inbound.lock().expect("inbound queue lock poisoned"),
        );
        for envelope in envelopes {
            self.dispatch(&envelope);
        }

        if !conn.alive.load(Ordering::SeqCst) && !self.disconnect_notified {
            self.disconnect_notified = true;
            tracing::info!("connection to server lost");
            if let Some(callback) = self.on_disconnected.as_mut() {
                callback();
            }
        }
    }

    fn dispatch(&mut self, envelope: &Envelope) {
        if !self.registry.is_registered(envelope.id) {
            tracing::warn!("unregistered packet id {}; dropped", envelope.id.0);
            return;
        }
        let Some(handler) = self.handlers.get_mut(&envelope.id) else {
            tracing::warn!(
                "no callback for packet '{}'; dropped",
                self.registry.name_of(envelope.id).unwrap_or("unknown")
            );
            return;
        };
        handler(&envelope.body);
    }

    /// Close the socket and join the receive thread. Deliberate disconnects
    /// do not fire the disconnect notification.
    pub fn stop(&mut self) {
        if !self.is_running() {
            tracing::warn!("socket client already stopped; stop ignored");
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(conn) = &self.conn {
            conn.shutdown();
            conn.join_thread();
        }
        self.conn = None;
        self.assigned_id.store(UNASSIGNED, Ordering::SeqCst);
        tracing::info!("disconnected from server");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    use crate::server::{ServerConfig, SocketServer};

    const NUMBER: PacketId = PacketId(1);

    const POLL_TIMEOUT: Duration = Duration::from_secs(5);
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    fn test_registry() -> Arc<PacketRegistry> {
        let mut registry = PacketRegistry::new();
        registry.register::<(i32,)>(NUMBER, "number");
        Arc::new(registry)
    }

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() {
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            thread::sleep(POLL_INTERVAL);
        }
    }

    #[test]
    fn handshake_assigns_id_without_a_drain_pass() {
        let mut server = SocketServer::new(ServerConfig { port: 0 }, test_registry());
        let addr = server.start().unwrap();

        let mut client = SocketClient::new(test_registry());
        client.start(addr).unwrap();

        // The id must arrive via the receive thread alone; no
        // handle_callbacks calls here.
        wait_until("handshake id", || client.client_id().is_some());
        assert_eq!(client.client_id(), Some(ClientId(0)));

        client.stop();
        server.stop();
    }

    #[test]
    fn server_packets_reach_client_callbacks_in_order() {
        let mut server = SocketServer::new(ServerConfig { port: 0 }, test_registry());
        let addr = server.start().unwrap();
        let registry = test_registry();

        let mut client = SocketClient::new(Arc::clone(&registry));
        client.start(addr).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        client.on_packet::<(i32,), _>(NUMBER, move |(value,)| {
            sink.borrow_mut().push(value);
        });

        wait_until("handshake id", || client.client_id().is_some());
        let my_id = client.client_id().unwrap();
        let start = Instant::now();
        loop {
            server.handle_callbacks();
            if server.client_count() == 1 {
                break;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "client never reached the table");
            thread::sleep(POLL_INTERVAL);
        }

        for n in 0..5 {
            let packet = registry.compose(NUMBER, &(n,)).unwrap();
            server.send(my_id, &packet);
        }

        let start = Instant::now();
        loop {
            client.handle_callbacks();
            if seen.borrow().len() == 5 {
                break;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "packets never arrived");
            thread::sleep(POLL_INTERVAL);
        }
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);

        client.stop();
        server.stop();
    }

    #[test]
    fn client_sends_reach_the_server() {
        let mut server = SocketServer::new(ServerConfig { port: 0 }, test_registry());
        let addr = server.start().unwrap();
        let registry = test_registry();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        server.on_packet::<(i32,), _>(NUMBER, move |from, (value,)| {
            sink.borrow_mut().push((from, value));
        });

        let mut client = SocketClient::new(Arc::clone(&registry));
        client.start(addr).unwrap();
        wait_until("handshake id", || client.client_id().is_some());
        let my_id = client.client_id().unwrap();

        let packet = registry.compose(NUMBER, &(77,)).unwrap();
        client.send(&packet);

        let start = Instant::now();
        loop {
            server.handle_callbacks();
            if !seen.borrow().is_empty() {
                break;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "packet never arrived");
            thread::sleep(POLL_INTERVAL);
        }
        assert_eq!(*seen.borrow(), vec![(my_id, 77)]);

        client.stop();
        server.stop();
    }

    #[test]
    fn disconnect_notification_fires_exactly_once() {
        let mut server = SocketServer::new(ServerConfig { port: 0 }, test_registry());
        let addr = server.start().unwrap();

        let mut client = SocketClient::new(test_registry());
        let fired = Rc::new(RefCell::new(0u32));
        let counter = Rc::clone(&fired);
        client.on_disconnected(move || *counter.borrow_mut() += 1);
        client.start(addr).unwrap();
        wait_until("handshake id", || client.client_id().is_some());

        server.stop();
        let start = Instant::now();
        loop {
            client.handle_callbacks();
            if *fired.borrow() == 1 {
                break;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "disconnect never noticed");
            thread::sleep(POLL_INTERVAL);
        }

        // Extra drains must not re-fire the notification.
        client.handle_callbacks();
        client.handle_callbacks();
        assert_eq!(*fired.borrow(), 1);
        assert!(!client.is_connected());

        client.stop();
    }

    #[test]
    fn deliberate_stop_does_not_notify() {
        let mut server = SocketServer::new(ServerConfig { port: 0 }, test_registry());
        let addr = server.start().unwrap();

        let mut client = SocketClient::new(test_registry());
        let fired = Rc::new(RefCell::new(0u32));
        let counter = Rc::clone(&fired);
        client.on_disconnected(move || *counter.borrow_mut() += 1);
        client.start(addr).unwrap();
        wait_until("handshake id", || client.client_id().is_some());

        client.stop();
        assert_eq!(*fired.borrow(), 0);
        assert!(client.client_id().is_none());

        // Stopped lifecycle calls are warn-and-ignore.
        client.stop();
        client.handle_callbacks();
        server.stop();
    }

    #[test]
    fn connect_to_nothing_is_an_error() {
        let mut client = SocketClient::new(test_registry());
        // Port 1 on loopback is essentially never listening.
        assert!(client.start("127.0.0.1:1").is_err());
        assert!(!client.is_running());
    }

    #[test]
    fn client_can_reconnect_after_stop() {
        let mut server = SocketServer::new(ServerConfig { port: 0 }, test_registry());
        let addr = server.start().unwrap();

        let mut client = SocketClient::new(test_registry());
        client.start(addr).unwrap();
        wait_until("first handshake", || client.client_id().is_some());
        let first = client.client_id().unwrap();
        client.stop();

        client.start(addr).unwrap();
        wait_until("second handshake", || client.client_id().is_some());
        let second = client.client_id().unwrap();
        assert!(second.0 > first.0);

        client.stop();
        server.stop();
    }
}
