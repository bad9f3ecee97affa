use std::net::{SocketAddr, UdpSocket};

use ketch_base::Result;
use ketch_model::Endpoint;

use crate::envelope;
use crate::msg::Msg;

/// Fire-and-forget UDP sender. One socket per node, shared by the
/// dispatcher and the service loop; sends never block on a reply.
pub struct Transport {
    socket: UdpSocket,
}

impl Transport {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Transport { socket })
    }

    /// Encodes and sends `msg` to `dest`. Failures are logged by the
    /// caller; the transport itself never retries (the protocol's own
    /// retransmission on `retransmitInterval` subsumes that).
    pub fn send(&self, dest: Endpoint, msg: &Msg) -> Result<()> {
        let bytes = envelope::to_bytes(msg)?;
        let addr = SocketAddr::new(dest.addr, dest.port);
        self.socket.send_to(&bytes, addr)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
