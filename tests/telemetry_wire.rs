use std::collections::HashMap;
use std::net::UdpSocket;
use std::time::Duration;

use rosc::{OscPacket, OscType};

use gaze_relay::telemetry::{default_routes, TelemetryDispatcher, PARAMETER_PREFIX};

fn receive_all(socket: &UdpSocket, count: usize) -> HashMap<String, f32> {
    let mut received = HashMap::new();
    let mut buf = [0u8; 1024];
    for _ in 0..count {
        let len = socket.recv(&mut buf).expect("datagram");
        let (_, packet) = rosc::decoder::decode_udp(&buf[..len]).expect("valid OSC");
        let OscPacket::Message(msg) = packet else {
            panic!("expected a single message per datagram");
        };
        assert_eq!(msg.args.len(), 1);
        let OscType::Float(value) = msg.args[0] else {
            panic!("expected a float argument, got {:?}", msg.args[0]);
        };
        received.insert(msg.addr, value);
    }
    received
}

#[test]
fn filtered_vector_maps_to_canonical_parameters() {
    let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
    rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut dispatcher = TelemetryDispatcher::new(rx.local_addr().unwrap(), default_routes()).unwrap();

    // left gaze (x, y), right gaze (x, y), blink closedness
    let filtered = [
        Some(0.125),
        Some(-0.25),
        Some(0.375),
        Some(-0.5),
        Some(0.2),
    ];
    let report = dispatcher.dispatch(&filtered);
    assert_eq!(report.sent, 6);
    assert_eq!(report.failed, 0);

    let received = receive_all(&rx, 6);
    let param = |name: &str| received[&format!("{}{}", PARAMETER_PREFIX, name)];
    assert_eq!(param("EyeLeftX"), 0.125);
    assert_eq!(param("EyeLeftY"), -0.25);
    assert_eq!(param("EyeRightX"), 0.375);
    assert_eq!(param("EyeRightY"), -0.5);
    assert_eq!(param("EyeLidLeft"), (1.0 - 0.2f64) as f32);
    assert_eq!(param("EyeLidRight"), (1.0 - 0.2f64) as f32);
}

#[test]
fn values_keep_float32_precision() {
    let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
    rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let routes = vec![gaze_relay::Route::new("/precise", 0, false)];
    let mut dispatcher = TelemetryDispatcher::new(rx.local_addr().unwrap(), routes).unwrap();

    let value = 0.123_456_789_f64;
    dispatcher.dispatch(&[Some(value)]);
    let received = receive_all(&rx, 1);
    assert_eq!(received["/precise"].to_bits(), (value as f32).to_bits());
}

#[test]
fn unreachable_receiver_never_blocks_dispatch() {
    // Nothing listens on the discard port of this address; sends are fire-and-forget.
    let mut dispatcher =
        TelemetryDispatcher::new("127.0.0.1:9".parse().unwrap(), default_routes()).unwrap();
    for _ in 0..10 {
        let report = dispatcher.dispatch(&[Some(0.0); 5]);
        assert_eq!(report.sent + report.failed, 6);
    }
}
