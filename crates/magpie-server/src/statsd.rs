//! statsd UDP metrics sink.

use std::net::UdpSocket;

use tracing::debug;

use magpie_xmpp::MetricsSink;

/// Fire-and-forget statsd emitter.
pub struct StatsdSink {
    socket: UdpSocket,
    target: String,
    prefix: String,
}

impl StatsdSink {
    /// Create a sink sending to `host:port` with a metric name prefix.
    pub fn new(host: &str, port: u16, prefix: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            target: format!("{host}:{port}"),
            prefix: prefix.to_string(),
        })
    }

    fn emit(&self, key: &str, value: i64, kind: &str) {
        let datagram = format!("{}{}:{}|{}", self.prefix, key, value, kind);
        if let Err(e) = self.socket.send_to(datagram.as_bytes(), &self.target) {
            debug!(error = %e, "statsd send failed");
        }
    }
}

impl MetricsSink for StatsdSink {
    fn gauge(&self, key: &str, value: i64) {
        self.emit(key, value, "g");
    }

    fn counter(&self, key: &str, amount: i64) {
        self.emit(key, amount, "c");
    }
}
