use std::io;
use std::net::{Ipv4Addr, ToSocketAddrs, UdpSocket};

use tracing::error;

use crate::metric::MetricKind;
use crate::util;

/// Immediate-delivery transport: every recorded point is serialized as one
/// statsd datagram and written straight to the socket, bypassing aggregation
/// and scheduling entirely.
///
/// Delivery is lossy by design: sampled-out points are silently dropped
/// (the receiver scales counts back up by the sample rate), and send
/// failures are logged and swallowed.
pub(crate) struct StatsdForwarder {
    socket: UdpSocket,
    sample_rate: f64,
}

impl StatsdForwarder {
    /// Binds a local socket and connects it to the remote address.
    pub fn connect<A: ToSocketAddrs>(addr: A, sample_rate: f64) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(addr)?;

        Ok(StatsdForwarder { socket, sample_rate })
    }

    /// Sends one point, subject to the configured sample rate.
    pub fn send(&self, name: &str, tags: &[&str], value: f64, kind: MetricKind) {
        if self.sample_rate < 1.0 && !util::sample_keep(self.sample_rate) {
            return;
        }

        let payload = format_datagram(name, tags, value, kind, self.sample_rate);
        if let Err(e) = self.socket.send(payload.as_bytes()) {
            error!(error = %e, metric_name = name, "failed to send statsd datagram");
        }
    }
}

/// Formats one point as `name:value|type[|@rate][|#tag1,tag2,...]`.
fn format_datagram(
    name: &str,
    tags: &[&str],
    value: f64,
    kind: MetricKind,
    sample_rate: f64,
) -> String {
    let mut payload = String::with_capacity(name.len() + 24);
    payload.push_str(name);
    payload.push(':');
    push_value(&mut payload, value);
    payload.push('|');
    payload.push_str(kind.wire_type());

    if sample_rate < 1.0 {
        let mut float_writer = ryu::Buffer::new();
        payload.push_str("|@");
        payload.push_str(float_writer.format(sample_rate));
    }

    if !tags.is_empty() {
        payload.push_str("|#");
        for (i, tag) in tags.iter().enumerate() {
            if i > 0 {
                payload.push(',');
            }
            payload.push_str(tag);
        }
    }

    payload
}

/// Integral values go out without a trailing `.0`, everything else through
/// the shortest-roundtrip float formatter.
fn push_value(payload: &mut String, value: f64) {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        let mut int_writer = itoa::Buffer::new();
        payload.push_str(int_writer.format(value as i64));
    } else {
        let mut float_writer = ryu::Buffer::new();
        payload.push_str(float_writer.format(value));
    }
}
