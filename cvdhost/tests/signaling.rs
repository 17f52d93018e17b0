//! Device and client peers over real WebSocket connections.

use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use cvdhost::signaling::SignalingServer;

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

fn start_server() -> SocketAddr {
    let server = SignalingServer::bind("127.0.0.1:0".parse().unwrap(), json!([])).unwrap();
    let addr = server.local_addr().unwrap();
    server.spawn().unwrap();
    addr
}

fn open(addr: SocketAddr) -> Socket {
    let (mut socket, _) = tungstenite::connect(format!("ws://{}/", addr)).unwrap();
    if let MaybeTlsStream::Plain(stream) = socket.get_mut() {
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    }
    assert_eq!(next_frame(&mut socket)["type"], "config");
    socket
}

fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::text(frame.to_string())).unwrap();
}

fn next_frame(socket: &mut Socket) -> Value {
    loop {
        match socket.read().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {:?}", other),
        }
    }
}

#[test]
fn test_register_connect_forwards_payload() {
    let addr = start_server();
    let mut device = open(addr);
    send(&mut device, json!({"type": "register", "device_id": "cvd-1", "device_info": {}}));

    let mut client = open(addr);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        send(&mut client, json!({"type": "connect", "device_id": "cvd-1", "payload": {"x": 1}}));
        let reply = next_frame(&mut client);
        if reply["type"] == "device-info" {
            break;
        }
        // The register may not have been processed yet.
        assert_eq!(reply["type"], "error");
        assert!(Instant::now() < deadline, "device never registered");
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(
        next_frame(&mut device),
        json!({"type": "client_msg", "client_id": 0, "payload": {"x": 1}})
    );

    send(&mut device, json!({"type": "forward", "client_id": 0, "payload": {"sdp": "answer"}}));
    assert_eq!(
        next_frame(&mut client),
        json!({"type": "device_msg", "payload": {"sdp": "answer"}})
    );
}

#[test]
fn test_malformed_frame_gets_error_and_stays_open() {
    let addr = start_server();
    let mut peer = open(addr);
    peer.send(Message::text("{not json")).unwrap();
    assert_eq!(next_frame(&mut peer)["type"], "error");

    send(&mut peer, json!({"type": "register", "device_id": "cvd-2", "device_info": {"n": 1}}));
    let mut client = open(addr);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        send(&mut client, json!({"type": "connect", "device_id": "cvd-2"}));
        let reply = next_frame(&mut client);
        if reply["type"] == "device-info" {
            assert_eq!(reply["device_info"], json!({"n": 1}));
            break;
        }
        assert!(Instant::now() < deadline, "device never registered");
        std::thread::sleep(Duration::from_millis(20));
    }
}
