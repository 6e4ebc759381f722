// Server side of the transport.
//
// Thread model: one accept thread polling a non-blocking listener, plus one
// receive thread per accepted client. Receive threads only queue frames and
// flip flags; every callback runs on the thread that calls
// handle_callbacks, so game code stays single-threaded.
//
// Locks guard the client table and the three queues (connected,
// disconnected, per-connection inbound) and are held only to push, take or
// snapshot. Socket writes happen after every lock is released, under the
// connection's own write gate.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use farmhold_protocol::registry::{Packet, PacketFields, PacketRegistry};
use farmhold_protocol::types::{ClientId, PacketId};
use farmhold_protocol::wire::{WireReader, WireWriter};

use crate::conn::{self, Connection, Envelope};

/// Poll interval for the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Poll interval while start() waits for the accept thread to bind.
const START_POLL: Duration = Duration::from_millis(1);

pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 7878 }
    }
}

type PacketHandler = Box<dyn FnMut(ClientId, &[u8])>;
type LifecycleHandler = Box<dyn FnMut(ClientId)>;

/// State shared between the owner, the accept thread and receive threads.
struct ServerShared {
    running: AtomicBool,
    listen_ready: AtomicBool,
    listen_failed: AtomicBool,
    listen_error: Mutex<Option<io::Error>>,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Monotonic id source, deliberately never reset so ids stay unique
    /// across a stop/start cycle.
    next_client_id: AtomicU32,
    clients: Mutex<BTreeMap<ClientId, Arc<Connection>>>,
    connected: Mutex<Vec<ClientId>>,
    disconnected: Mutex<Vec<ClientId>>,
}

/// Cloneable sending half of a [`SocketServer`]. Lets callback code send
/// and kick without borrowing the server itself.
#[derive(Clone)]
pub struct ServerSender {
    shared: Arc<ServerShared>,
}

impl ServerSender {
    /// Send one packet to one client. Unknown ids and write failures are
    /// logged and dropped; the receive thread notices a broken pipe.
    pub fn send(&self, to: ClientId, packet: &Packet) {
        let conn = {
            let clients = self.shared.clients.lock().expect("client table lock poisoned");
            clients.get(&to).cloned()
        };
        let Some(conn) = conn else {
            tracing::warn!("send to unknown client {}", to.0);
            return;
        };
        if let Err(e) = conn.send_frame(packet.bytes()) {
            tracing::warn!("send to client {} failed: {e}", to.0);
        }
    }

    /// Send one packet to every connected client, optionally excluding one.
    pub fn send_all(&self, packet: &Packet, exclude: Option<ClientId>) {
        let conns: Vec<(ClientId, Arc<Connection>)> = {
            let clients = self.shared.clients.lock().expect("client table lock poisoned");
            clients
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(id, conn)| (*id, Arc::clone(conn)))
                .collect()
        };
        for (id, conn) in conns {
            if let Err(e) = conn.send_frame(packet.bytes()) {
                tracing::warn!("send to client {} failed: {e}", id.0);
            }
        }
    }

    /// Force-close a client's socket. The disconnect then flows through the
    /// usual path: receive thread exit, sweep, disconnected callback.
    pub fn kick(&self, id: ClientId) {
        let conn = {
            let clients = self.shared.clients.lock().expect("client table lock poisoned");
            clients.get(&id).cloned()
        };
        match conn {
            Some(conn) => {
                tracing::info!("kicking client {}", id.0);
                conn.shutdown();
            }
            None => tracing::warn!("kick of unknown client {}", id.0),
        }
    }
}

pub struct SocketServer {
    registry: Arc<PacketRegistry>,
    config: ServerConfig,
    shared: Arc<ServerShared>,
    accept_thread: Option<thread::JoinHandle<()>>,
    handlers: HashMap<PacketId, PacketHandler>,
    on_connected: Option<LifecycleHandler>,
    on_disconnected: Option<LifecycleHandler>,
}

impl SocketServer {
    pub fn new(config: ServerConfig, registry: Arc<PacketRegistry>) -> Self {
        Self {
            registry,
            config,
            shared: Arc::new(ServerShared {
                running: AtomicBool::new(false),
                listen_ready: AtomicBool::new(false),
                listen_failed: AtomicBool::new(false),
                listen_error: Mutex::new(None),
                local_addr: Mutex::new(None),
                next_client_id: AtomicU32::new(0),
                clients: Mutex::new(BTreeMap::new()),
                connected: Mutex::new(Vec::new()),
                disconnected: Mutex::new(Vec::new()),
            }),
            accept_thread: None,
            handlers: HashMap::new(),
            on_connected: None,
            on_disconnected: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .shared
            .local_addr
            .lock()
            .expect("local addr lock poisoned")
    }

    pub fn client_count(&self) -> usize {
        self.shared
            .clients
            .lock()
            .expect("client table lock poisoned")
            .len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.shared
            .clients
            .lock()
            .expect("client table lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn sender(&self) -> ServerSender {
        ServerSender {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn send(&self, to: ClientId, packet: &Packet) {
        self.sender().send(to, packet);
    }

    pub fn send_all(&self, packet: &Packet, exclude: Option<ClientId>) {
        self.sender().send_all(packet, exclude);
    }

    pub fn kick(&self, id: ClientId) {
        self.sender().kick(id);
    }

    /// Install the connect notification. Fired from handle_callbacks, one
    /// call per client, before any of that client's packets.
    pub fn on_connected(&mut self, callback: impl FnMut(ClientId) + 'static) {
        self.on_connected = Some(Box::new(callback));
    }

    pub fn on_disconnected(&mut self, callback: impl FnMut(ClientId) + 'static) {
        self.on_disconnected = Some(Box::new(callback));
    }

    /// Install the receive callback for `id`. The fields `P` must match the
    /// registered signature; otherwise the callback is refused with a
    /// warning and inbound packets of that id are dropped.
    pub fn on_packet<P, F>(&mut self, id: PacketId, mut callback: F)
    where
        P: PacketFields,
        F: FnMut(ClientId, P) + 'static,
    {
        if !self.registry.matches::<P>(id) {
            return;
        }
        let name = self.registry.name_of(id).unwrap_or("unknown");
        self.handlers.insert(
            id,
            Box::new(move |from, body| {
                let mut reader = WireReader::new(body);
                match P::take(&mut reader) {
                    Ok(fields) => callback(from, fields),
                    Err(e) => {
                        tracing::warn!("dropping {name} from client {}: {e}", from.0);
                    }
                }
            }),
        );
    }

    /// Bind and start accepting. Blocks until the accept thread reports the
    /// listener as ready or failed; binding happens on that thread so the
    /// accept loop owns the listener.
    pub fn start(&mut self) -> io::Result<SocketAddr> {
        if self.is_running() {
            tracing::warn!("socket server already running; start ignored");
            if let Some(addr) = self.local_addr() {
                return Ok(addr);
            }
            return Err(io::Error::other("server already running"));
        }

        self.shared.listen_ready.store(false, Ordering::SeqCst);
        self.shared.listen_failed.store(false, Ordering::SeqCst);
        *self
            .shared
            .listen_error
            .lock()
            .expect("listen error lock poisoned") = None;
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let port = self.config.port;
        self.accept_thread = Some(thread::spawn(move || accept_loop(&shared, port)));

        while !self.shared.listen_ready.load(Ordering::SeqCst)
            && !self.shared.listen_failed.load(Ordering::SeqCst)
        {
            thread::sleep(START_POLL);
        }

        if self.shared.listen_failed.load(Ordering::SeqCst) {
            self.shared.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.accept_thread.take() {
                let _ = handle.join();
            }
            let err = self
                .shared
                .listen_error
                .lock()
                .expect("listen error lock poisoned")
                .take()
                .unwrap_or_else(|| io::Error::other("listen failed"));
            tracing::warn!("failed to start listening on port {port}: {err}");
            return Err(err);
        }

        match self.local_addr() {
            Some(addr) => {
                tracing::info!("listening on {addr}");
                Ok(addr)
            }
            None => Err(io::Error::other("listener reported ready without an address")),
        }
    }

    /// Run one drain pass on the caller's thread: sweep dead connections,
    /// fire connect/disconnect notifications, then dispatch queued packets
    /// grouped per client in client id order. A leaver's queued packets
    /// are dispatched before its disconnect notification, so nothing a
    /// client sent is ever dropped by its own departure.
    pub fn handle_callbacks(&mut self) {
        if !self.is_running() {
            tracing::warn!("handle_callbacks on a stopped server ignored");
            return;
        }

        let parting = self.sweep_dead_connections();

        let connected: Vec<ClientId> = std::mem::take(
            &mut *self
                .shared
                .connected
                .lock()
                .expect("connected list lock poisoned"),
        );
        for id in connected {
            if let Some(callback) = self.on_connected.as_mut() {
                callback(id);
            }
        }

        for (id, envelopes) in parting {
            for envelope in envelopes {
                self.dispatch(id, &envelope);
            }
        }

        let disconnected: Vec<ClientId> = std::mem::take(
            &mut *self
                .shared
                .disconnected
                .lock()
                .expect("disconnected list lock poisoned"),
        );
        for id in disconnected {
            if let Some(callback) = self.on_disconnected.as_mut() {
                callback(id);
            }
        }

        let conns: Vec<(ClientId, Arc<Connection>)> = {
            let clients = self.shared.clients.lock().expect("client table lock poisoned");
            clients
                .iter()
                .map(|(id, conn)| (*id, Arc::clone(conn)))
                .collect()
        };
        for (id, conn) in conns {
            let envelopes = std::mem::take(
                &mut *conn.inbound.lock().expect("inbound queue lock poisoned"),
            );
            for envelope in envelopes {
                self.dispatch(id, &envelope);
            }
        }
    }

    /// Remove connections whose receive thread has exited, joining each
    /// thread before dropping the entry. Returns whatever each swept
    /// connection still had queued, for a final dispatch pass.
    fn sweep_dead_connections(&mut self) -> Vec<(ClientId, Vec<Envelope>)> {
        let dead: Vec<(ClientId, Arc<Connection>)> = {
            let clients = self.shared.clients.lock().expect("client table lock poisoned");
            clients
                .iter()
                .filter(|(_, conn)| !conn.alive.load(Ordering::SeqCst))
                .map(|(id, conn)| (*id, Arc::clone(conn)))
                .collect()
        };
        let mut parting = Vec::new();
        for (id, conn) in dead {
            // Join first: after this no more envelopes can be queued.
            conn.join_thread();
            self.shared
                .clients
                .lock()
                .expect("client table lock poisoned")
                .remove(&id);
            let envelopes = std::mem::take(
                &mut *conn.inbound.lock().expect("inbound queue lock poisoned"),
            );
            if !envelopes.is_empty() {
                parting.push((id, envelopes));
            }
        }
        parting
    }

    fn dispatch(&mut self, from: ClientId, envelope: &Envelope) {
        if envelope.id == PacketId::HANDSHAKE {
            tracing::warn!(
                "client {} sent the reserved handshake id; dropped",
                from.0
            );
            return;
        }
        if !self.registry.is_registered(envelope.id) {
            tracing::warn!(
                "unregistered packet id {} from client {}; dropped",
                envelope.id.0,
                from.0
            );
            return;
        }
        let Some(handler) = self.handlers.get_mut(&envelope.id) else {
            tracing::warn!(
                "no callback for packet '{}' from client {}; dropped",
                self.registry.name_of(envelope.id).unwrap_or("unknown"),
                from.0
            );
            return;
        };
        handler(from, &envelope.body);
    }

    /// Stop accepting, close every socket and join every thread. Clears the
    /// client table and both notification queues; packet callbacks and the
    /// id counter are kept for a later restart.
    pub fn stop(&mut self) {
        if !self.is_running() {
            tracing::warn!("socket server already stopped; stop ignored");
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);

        let conns: Vec<Arc<Connection>> = {
            let clients = self.shared.clients.lock().expect("client table lock poisoned");
            clients.values().cloned().collect()
        };
        for conn in &conns {
            conn.shutdown();
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        for conn in &conns {
            conn.join_thread();
        }

        self.shared
            .clients
            .lock()
            .expect("client table lock poisoned")
            .clear();
        self.shared
            .connected
            .lock()
            .expect("connected list lock poisoned")
            .clear();
        self.shared
            .disconnected
            .lock()
            .expect("disconnected list lock poisoned")
            .clear();
        *self
            .shared
            .local_addr
            .lock()
            .expect("local addr lock poisoned") = None;
        tracing::info!("socket server stopped");
    }
}

fn accept_loop(shared: &Arc<ServerShared>, port: u16) {
    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener,
        Err(e) => {
            *shared
                .listen_error
                .lock()
                .expect("listen error lock poisoned") = Some(e);
            shared.listen_failed.store(true, Ordering::SeqCst);
            return;
        }
    };
    listener.set_nonblocking(true).ok();
    match listener.local_addr() {
        Ok(addr) => {
            *shared
                .local_addr
                .lock()
                .expect("local addr lock poisoned") = Some(addr);
        }
        Err(e) => {
            *shared
                .listen_error
                .lock()
                .expect("listen error lock poisoned") = Some(e);
            shared.listen_failed.store(true, Ordering::SeqCst);
            return;
        }
    }
    shared.listen_ready.store(true, Ordering::SeqCst);

    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).ok();
                let id = ClientId(shared.next_client_id.fetch_add(1, Ordering::SeqCst));
                tracing::info!("client {} connected", id.0);
                spawn_receive_thread(shared, id, stream);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                break;
            }
        }
    }
}

fn spawn_receive_thread(shared: &Arc<ServerShared>, id: ClientId, stream: TcpStream) {
    let conn = Arc::new(Connection::new(stream));
    shared
        .clients
        .lock()
        .expect("client table lock poisoned")
        .insert(id, Arc::clone(&conn));
    shared
        .connected
        .lock()
        .expect("connected list lock poisoned")
        .push(id);

    let thread_shared = Arc::clone(shared);
    let thread_conn = Arc::clone(&conn);
    let handle = thread::spawn(move || {
        receive_loop(&thread_shared, id, &thread_conn);
    });
    *conn
        .thread
        .lock()
        .expect("receive thread handle lock poisoned") = Some(handle);
}

fn receive_loop(shared: &Arc<ServerShared>, id: ClientId, conn: &Arc<Connection>) {
    // First traffic on every connection: the handshake frame telling the
    // client its assigned id.
    let mut writer = WireWriter::new();
    writer.put_u32(PacketId::HANDSHAKE.0);
    writer.put_u32(id.0);
    if let Err(e) = conn.send_frame(writer.bytes()) {
        tracing::warn!("handshake to client {} failed: {e}", id.0);
    }

    conn::receive_into(conn, &shared.running, |envelope| {
        conn.inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .push(envelope);
    });

    // alive is already false here; the order matters so the sweep can never
    // observe the disconnect notice before the dead flag.
    shared
        .disconnected
        .lock()
        .expect("disconnected list lock poisoned")
        .push(id);
    tracing::info!("client {} disconnected", id.0);
}
