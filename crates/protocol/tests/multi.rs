use std::net::SocketAddr;

use slipstream::{
    ClientSession, DemoWorld, MemoryHub, MemoryTransport, PacketLossSimulation, PlayerState,
    ServerSession,
};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

type Server = ServerSession<MemoryTransport, DemoWorld>;
type Client = ClientSession<MemoryTransport, DemoWorld>;

fn start_clients(hub: &MemoryHub, server_addr: SocketAddr, base_port: u16, count: usize) -> Vec<Client> {
    (0..count)
        .map(|i| {
            ClientSession::new(
                hub.endpoint(addr(base_port + i as u16)),
                DemoWorld::new(1),
                server_addr,
            )
            .expect("client session")
        })
        .collect()
}

fn pump(server: &mut Server, clients: &mut [Client], rounds: usize) {
    for _ in 0..rounds {
        for client in clients.iter_mut() {
            client.tick();
        }
        server.tick();
    }
}

#[test]
fn several_clients_connect_and_stream() {
    let hub = MemoryHub::new();
    let server_addr = addr(42000);
    let mut server: Server =
        ServerSession::new(hub.endpoint(server_addr), DemoWorld::new(8)).expect("server session");
    let mut clients = start_clients(&hub, server_addr, 42001, 3);

    pump(&mut server, &mut clients, 5);

    assert_eq!(server.connected_count(), 3);
    assert_eq!(server.sim().peer_count(), 3);
    for client in &clients {
        assert!(client.is_connected());
    }

    // each server-side peer gets a distinct state; each client sees its own
    let handles = server.sim().handles();
    for (i, &handle) in handles.iter().enumerate() {
        let state = PlayerState {
            x: i as i32 * 100,
            y: 1,
            z: 2,
            health: 50 + i as u16,
            flags: i as u8,
        };
        server.sim_mut().set_peer_state(handle, state);
    }
    pump(&mut server, &mut clients, 3);

    let mut seen: Vec<u16> = clients
        .iter()
        .map(|client| {
            let handle = client.handle().unwrap();
            client.sim().received_state(handle).unwrap().health
        })
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![50, 51, 52]);
}

#[test]
fn one_client_leaving_does_not_disturb_the_rest() {
    let hub = MemoryHub::new();
    let server_addr = addr(42100);
    let mut server: Server =
        ServerSession::new(hub.endpoint(server_addr), DemoWorld::new(8)).expect("server session");
    let mut clients = start_clients(&hub, server_addr, 42101, 3);

    pump(&mut server, &mut clients, 5);
    assert_eq!(server.connected_count(), 3);

    clients[1].disconnect("Client quit");
    pump(&mut server, &mut clients, 3);

    assert!(clients[1].has_failed());
    assert_eq!(server.connected_count(), 2);
    assert_eq!(server.sim().peer_count(), 2);
    assert!(clients[0].is_connected());
    assert!(clients[2].is_connected());

    // the survivors keep streaming; every peer gets the same nudge, so
    // both remaining clients converge on the same state
    for &handle in &server.sim().handles() {
        server.sim_mut().nudge(handle, 5);
    }
    pump(&mut server, &mut clients, 3);
    let expected = server.sim().peer_state(server.sim().handles()[0]);
    for client in [&clients[0], &clients[2]] {
        assert_eq!(
            client.sim().received_state(client.handle().unwrap()),
            expected
        );
    }
}

#[test]
fn admission_cap_rejects_the_overflow_client() {
    let hub = MemoryHub::new();
    let server_addr = addr(42200);
    let mut server: Server =
        ServerSession::new(hub.endpoint(server_addr), DemoWorld::new(2)).expect("server session");
    let mut clients = start_clients(&hub, server_addr, 42201, 3);

    pump(&mut server, &mut clients, 6);

    let connected = clients.iter().filter(|c| c.is_connected()).count();
    let refused = clients.iter().filter(|c| c.has_failed()).count();
    assert_eq!(connected, 2);
    assert_eq!(refused, 1);
    assert_eq!(server.sim().peer_count(), 2);

    let loser = clients.iter().find(|c| c.has_failed()).unwrap();
    assert!(loser.fail_reason().unwrap().contains("full"));
}

#[test]
fn soak_with_loss_and_latency() {
    let hub = MemoryHub::new();
    let server_addr = addr(42300);
    let mut server: Server =
        ServerSession::new(hub.endpoint(server_addr), DemoWorld::new(8)).expect("server session");
    let mut clients = start_clients(&hub, server_addr, 42301, 2);

    pump(&mut server, &mut clients, 5);
    assert_eq!(server.connected_count(), 2);

    hub.set_loss(Some(PacketLossSimulation {
        enabled: true,
        loss_percent: 20.0,
        min_latency_ms: 1,
        max_latency_ms: 3,
        jitter_ms: 2,
    }));

    let handles = server.sim().handles();
    for step in 0..150 {
        for &handle in &handles {
            server.sim_mut().nudge(handle, step);
        }
        for client in clients.iter_mut() {
            client.tick();
        }
        server.tick();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    // clean wire again: everyone reconverges on the server's state. All
    // peers got identical nudges, so one expected state covers both.
    hub.set_loss(None);
    std::thread::sleep(std::time::Duration::from_millis(10));
    pump(&mut server, &mut clients, 8);

    assert_eq!(server.connected_count(), 2);
    let expected = server.sim().peer_state(handles[0]);
    assert!(expected.is_some());
    for client in &clients {
        assert!(client.is_connected());
        let handle = client.handle().unwrap();
        assert_eq!(client.sim().received_state(handle), expected);
    }
}
