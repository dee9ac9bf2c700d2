//! OSC parameter output over UDP.
//!
//! Each filtered channel value goes out as its own datagram: one address plus
//! one `f32` argument. Sends are fire-and-forget; nothing is retried.

use std::net::{SocketAddr, UdpSocket};

use anyhow::{Context, Result};
use rosc::{encoder, OscMessage, OscPacket, OscType};
use serde::Deserialize;

/// Address prefix of the avatar parameters.
pub const PARAMETER_PREFIX: &str = "/avatar/parameters/v2/";

/// Maps one filtered channel to one parameter address.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Route {
    pub path: String,
    pub channel: usize,
    /// Send `1 - value` instead of `value`.
    #[serde(default)]
    pub invert: bool,
}

impl Route {
    pub fn new(path: impl Into<String>, channel: usize, invert: bool) -> Self {
        Self {
            path: path.into(),
            channel,
            invert,
        }
    }

    /// Value to send for this route, if its channel has one.
    pub fn value_for(&self, filtered: &[Option<f64>]) -> Option<f32> {
        let value = filtered.get(self.channel).copied().flatten()?;
        let value = if self.invert { 1.0 - value } else { value };
        Some(value as f32)
    }
}

/// Route table for channels ordered left gaze (x, y), right gaze (x, y), blink.
pub fn default_routes() -> Vec<Route> {
    let param = |name: &str| format!("{}{}", PARAMETER_PREFIX, name);
    vec![
        Route::new(param("EyeLidLeft"), 4, true),
        Route::new(param("EyeLidRight"), 4, true),
        Route::new(param("EyeLeftX"), 0, false),
        Route::new(param("EyeRightX"), 2, false),
        Route::new(param("EyeLeftY"), 1, false),
        Route::new(param("EyeRightY"), 3, false),
    ]
}

/// Encode one single-float OSC message.
pub fn encode_parameter(path: &str, value: f32) -> Result<Vec<u8>> {
    let msg = OscMessage {
        addr: path.to_string(),
        args: vec![OscType::Float(value)],
    };
    encoder::encode(&OscPacket::Message(msg))
        .with_context(|| format!("failed to encode OSC message for {}", path))
}

/// Outcome of one dispatch round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
    /// Routes whose channel had no value yet.
    pub skipped: usize,
}

pub struct TelemetryDispatcher {
    socket: UdpSocket,
    target: SocketAddr,
    routes: Vec<Route>,
    sent: u64,
    failed: u64,
}

impl TelemetryDispatcher {
    /// Bind an ephemeral local socket for sending to `target`.
    pub fn new(target: SocketAddr, routes: Vec<Route>) -> Result<Self> {
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .with_context(|| format!("failed to bind UDP socket on {}", bind_addr))?;
        socket
            .set_nonblocking(true)
            .context("failed to make telemetry socket non-blocking")?;
        log::info!(
            "TelemetryDispatcher: sending {} routes to {}",
            routes.len(),
            target
        );
        Ok(Self {
            socket,
            target,
            routes,
            sent: 0,
            failed: 0,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Total datagrams sent since creation.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Total datagrams that failed to encode or send.
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Send one datagram per route with a value. Never blocks, never retries.
    pub fn dispatch(&mut self, filtered: &[Option<f64>]) -> DispatchReport {
        let mut report = DispatchReport::default();
        for route in &self.routes {
            let Some(value) = route.value_for(filtered) else {
                report.skipped += 1;
                continue;
            };
            let result = encode_parameter(&route.path, value).and_then(|datagram| {
                self.socket
                    .send_to(&datagram, self.target)
                    .with_context(|| format!("send to {} failed", self.target))
            });
            match result {
                Ok(_) => report.sent += 1,
                Err(err) => {
                    report.failed += 1;
                    log::debug!("TelemetryDispatcher: {}: {:#}", route.path, err);
                }
            }
        }
        self.sent += report.sent as u64;
        self.failed += report.failed as u64;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn receiver() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn recv_message(socket: &UdpSocket) -> OscMessage {
        let mut buf = [0u8; 512];
        let len = socket.recv(&mut buf).unwrap();
        match rosc::decoder::decode_udp(&buf[..len]).unwrap().1 {
            OscPacket::Message(msg) => msg,
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn encoded_parameter_decodes() {
        let datagram = encode_parameter("/avatar/parameters/v2/EyeLeftX", 0.375).unwrap();
        assert_eq!(datagram.len() % 4, 0);
        let (_, packet) = rosc::decoder::decode_udp(&datagram).unwrap();
        let OscPacket::Message(msg) = packet else {
            panic!("expected message");
        };
        assert_eq!(msg.addr, "/avatar/parameters/v2/EyeLeftX");
        assert_eq!(msg.args, vec![OscType::Float(0.375)]);
    }

    #[test]
    fn route_value_applies_inversion() {
        let filtered = [Some(0.25), None];
        assert_eq!(Route::new("/a", 0, false).value_for(&filtered), Some(0.25));
        assert_eq!(Route::new("/a", 0, true).value_for(&filtered), Some(0.75));
        assert_eq!(Route::new("/a", 1, false).value_for(&filtered), None);
        assert_eq!(Route::new("/a", 9, false).value_for(&filtered), None);
    }

    #[test]
    fn default_routes_cover_both_eyes() {
        let routes = default_routes();
        assert_eq!(routes.len(), 6);
        assert!(routes.iter().all(|r| r.path.starts_with(PARAMETER_PREFIX)));
        let lids: Vec<_> = routes.iter().filter(|r| r.invert).collect();
        assert_eq!(lids.len(), 2);
        assert!(lids.iter().all(|r| r.channel == 4));
    }

    #[test]
    fn dispatch_sends_one_datagram_per_available_route() {
        let rx = receiver();
        let routes = vec![
            Route::new("/p/x", 0, false),
            Route::new("/p/lid", 1, true),
            Route::new("/p/missing", 2, false),
        ];
        let mut dispatcher = TelemetryDispatcher::new(rx.local_addr().unwrap(), routes).unwrap();

        let report = dispatcher.dispatch(&[Some(-0.5), Some(0.125), None]);
        assert_eq!(
            report,
            DispatchReport {
                sent: 2,
                failed: 0,
                skipped: 1
            }
        );
        assert_eq!(dispatcher.sent(), 2);

        let first = recv_message(&rx);
        assert_eq!(first.addr, "/p/x");
        assert_eq!(first.args, vec![OscType::Float(-0.5)]);
        let second = recv_message(&rx);
        assert_eq!(second.addr, "/p/lid");
        assert_eq!(second.args, vec![OscType::Float(0.875)]);
    }
}
