// Polling helpers for multiplayer integration tests.
//
// The integration tests drive a real `GameServer` (on its own tick thread,
// via `start_server`) and real `GameClient` instances over loopback TCP.
// Clients only apply packets inside `tick()`, so every wait is a bounded
// tick-and-sleep loop. All networking and game logic uses the same code
// paths as the live game — the only test-specific code is these loops.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use farmhold_game::client::GameClient;
use farmhold_game::server::{GameConfig, ServerHandle, start_server};

/// Default timeout for blocking waits.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between ticks while waiting.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Start a game server on an OS-assigned port.
pub fn start_test_server(config: GameConfig) -> (ServerHandle, SocketAddr) {
    start_server(GameConfig { port: 0, ..config }).expect("server failed to start")
}

/// Connect a named client and block until the server has assigned it an id
/// (which also means the name announcement is on the wire).
pub fn connect(addr: SocketAddr, name: &str) -> GameClient {
    let mut client = GameClient::new(name);
    client.start(addr).expect("client failed to connect");
    let deadline = Instant::now() + POLL_TIMEOUT;
    loop {
        client.tick();
        if client.my_id().is_some() {
            return client;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for a client id"
        );
        thread::sleep(POLL_INTERVAL);
    }
}

/// Tick every client until `done` holds, asserting a bounded deadline.
pub fn pump_until(
    clients: &mut [&mut GameClient],
    what: &str,
    mut done: impl FnMut(&[&mut GameClient]) -> bool,
) {
    let deadline = Instant::now() + POLL_TIMEOUT;
    loop {
        for client in clients.iter_mut() {
            client.tick();
        }
        if done(clients) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// Tick every client for a fixed duration. For asserting that something
/// does *not* happen.
pub fn pump_for(clients: &mut [&mut GameClient], duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        for client in clients.iter_mut() {
            client.tick();
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Assert two clients hold identical replicated state.
pub fn assert_worlds_match(a: &GameClient, b: &GameClient) {
    let a_json: serde_json::Value = a.world_json();
    let b_json = b.world_json();
    assert_eq!(a_json, b_json, "replicated state should be identical");
}
