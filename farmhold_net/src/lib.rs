// farmhold_net: blocking TCP transport for the game.
//
// - conn: per-connection state, framed reads with interruptible waits
// - server: accept loop, per-client receive threads, drain-based dispatch
// - client: single connection mirror of the server side
//
// The contract with game code is single-threadedness: packets and
// connection events are queued by background threads and every callback
// runs inside handle_callbacks on whatever thread the owner ticks from.
// Send calls are synchronous blocking writes on the caller's thread.
//
// Dependencies: farmhold_protocol for framing, the packet registry and the
// field codec; tracing for transport diagnostics.

mod conn;

pub mod client;
pub mod server;

pub use client::SocketClient;
pub use server::{ServerConfig, ServerSender, SocketServer};
