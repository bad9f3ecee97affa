use std::collections::BTreeMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::SyncSender;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ketch_base::Result;
use ketch_model::Endpoint;

use crate::envelope;
use crate::msg::Msg;

/// Identity and address of a peer, as carried in heartbeat metadata.
/// Analogous to the membership library's per-node metadata blob in the
/// original implementation, reduced here to exactly what the Server
/// table needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: Uuid,
    pub name: String,
    pub endpoint: Endpoint,
}

const HEARTBEAT_TAG: u8 = 0;

/// Minimal gossip-free membership: nodes periodically broadcast a
/// heartbeat datagram to every address in the static bootstrap list, and
/// any node seen within `liveness` is considered a live peer. This
/// replaces the original's SWIM-based membership library; the spec treats
/// full membership as external-collaborator scope and only needs the
/// contract surface (current peer set + inbound datagram delivery).
pub struct Membership {
    socket: UdpSocket,
    local: NodeInfo,
    peers: Mutex<BTreeMap<Uuid, (NodeInfo, Instant)>>,
    liveness: Duration,
}

impl Membership {
    pub fn new(socket: UdpSocket, local: NodeInfo, liveness: Duration) -> Self {
        Membership { socket, local, peers: Mutex::new(BTreeMap::new()), liveness }
    }

    /// Broadcasts one heartbeat datagram to each bootstrap address.
    pub fn heartbeat(&self, bootstrap: &[SocketAddr]) -> Result<()> {
        let mut buf = vec![HEARTBEAT_TAG];
        buf.extend_from_slice(&rmp_serde::to_vec(&self.local).map_err(ketch_base::Error::from)?);
        for addr in bootstrap {
            // Fire-and-forget: an unreachable bootstrap peer is routine, not an error.
            let _ = self.socket.send_to(&buf, addr);
        }
        Ok(())
    }

    /// Returns every peer whose last heartbeat is within the liveness
    /// window. This is the Server table's source of truth, refreshed once
    /// per service tick.
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        let now = Instant::now();
        let peers = self.peers.lock().unwrap();
        let mut nodes: Vec<NodeInfo> = peers
            .values()
            .filter(|(_, seen)| now.duration_since(*seen) <= self.liveness)
            .map(|(info, _)| info.clone())
            .collect();
        nodes.push(self.local.clone());
        nodes
    }

    /// Blocks on the socket, forever. Heartbeats update the peer table;
    /// anything else is treated as a protocol datagram and handed to
    /// `inbound`. `inbound` is a bounded, lossy channel: on a full queue
    /// the datagram is dropped and logged, trusting retransmission.
    pub fn recv_loop(&self, inbound: SyncSender<Msg>) {
        let mut buf = [0u8; 65536];
        loop {
            let (len, _from) = match self.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(target: ketch_base::LOG_TARGET, error = %e, "membership recv failed");
                    continue;
                }
            };
            let datagram = &buf[..len];
            match datagram.first() {
                Some(&HEARTBEAT_TAG) => self.handle_heartbeat(&datagram[1..]),
                Some(_) => self.handle_protocol_msg(datagram, &inbound),
                None => {}
            }
        }
    }

    fn handle_heartbeat(&self, payload: &[u8]) {
        match rmp_serde::from_slice::<NodeInfo>(payload) {
            Ok(info) => {
                let mut peers = self.peers.lock().unwrap();
                peers.insert(info.id, (info, Instant::now()));
            }
            Err(e) => {
                tracing::error!(target: ketch_base::LOG_TARGET, error = %e, "failed to decode heartbeat");
            }
        }
    }

    fn handle_protocol_msg(&self, datagram: &[u8], inbound: &SyncSender<Msg>) {
        match envelope::from_bytes(datagram) {
            Ok(msg) => {
                if inbound.try_send(msg).is_err() {
                    tracing::error!(target: ketch_base::LOG_TARGET, "incoming message channel full, discarding message");
                }
            }
            Err(e) => {
                tracing::error!(target: ketch_base::LOG_TARGET, error = ?e, size = datagram.len(), "failed to decode incoming message");
            }
        }
    }
}
