use std::net;

use udprpc::{Call, MethodRegistry};

// An address nothing will answer on, owned by the test for its duration.
fn quiet_peer() -> net::UdpSocket {
    net::UdpSocket::bind(("127.0.0.1", 0)).expect("failed to bind peer socket")
}

#[test]
fn client_send() {
    let peer = quiet_peer();

    // Create client object in main thread to verify it implements Send
    let client = udprpc::Client::connect(peer.local_addr().unwrap())
        .expect("failed to create udprpc client");

    let thread = std::thread::spawn(move || {
        client.next_sequence();
        client.local_addr();
    });

    thread.join().unwrap();
}

#[test]
fn server_send() {
    // Create server object in main thread to verify it implements Send
    let mut server = udprpc::Server::bind(("127.0.0.1", 0), MethodRegistry::new())
        .expect("failed to create udprpc server");

    let thread = std::thread::spawn(move || {
        server
            .poll(Some(std::time::Duration::from_millis(1)))
            .unwrap();
    });

    thread.join().unwrap();
}

#[test]
fn client_handle_send() {
    let peer = quiet_peer();

    let client = udprpc::ThreadedClient::connect(peer.local_addr().unwrap())
        .expect("failed to create udprpc client");

    let handle = client.handle();

    // Submit from another thread, settle from this one
    let pending = std::thread::spawn(move || handle.submit(Call::new("noop")))
        .join()
        .unwrap();

    assert_eq!(pending.sequence(), 0);

    pending.abandon();
}
