//! Outbound peer transport.
//!
//! The receive side ([`crate::network::ReceiveLoop`]) is `mio`-driven and
//! non-blocking; sends are comparatively rare and small (one
//! `PreProcessRequestMsg`/`PreProcessReplyMsg` per peer per round), so a
//! plain blocking `UdpSocket` behind a registry is enough here — the
//! transport is explicitly out of scope for this spec (`spec.md` §2),
//! and this is the thinnest thing that can deliver a [`Message`] to a
//! [`ReplicaId`].

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};

use quorate_core::Message;
use quorate_types::ReplicaId;

/// Sends an encoded [`Message`] to a specific peer.
pub trait PeerTransport: Send + Sync {
    fn send_to(&self, peer: ReplicaId, message: &Message);
}

/// A [`PeerTransport`] backed by one UDP socket shared across all sends,
/// addressed via a static `ReplicaId -> SocketAddr` directory.
pub struct UdpPeerTransport {
    socket: UdpSocket,
    peers: HashMap<ReplicaId, SocketAddr>,
}

impl UdpPeerTransport {
    pub fn bind(local_addr: SocketAddr, peers: HashMap<ReplicaId, SocketAddr>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(local_addr)?;
        Ok(Self { socket, peers })
    }
}

impl PeerTransport for UdpPeerTransport {
    fn send_to(&self, peer: ReplicaId, message: &Message) {
        let Some(addr) = self.peers.get(&peer) else {
            tracing::warn!(%peer, "no known address for peer, dropping send");
            return;
        };
        let frame = quorate_core::RawFrame::encode(message);
        if let Err(err) = self.socket.send_to(frame.as_bytes(), addr) {
            tracing::warn!(%peer, %addr, error = %err, "failed to send message to peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorate_core::MessagePayload;
    use quorate_types::{ClientId, SeqNum};

    #[test]
    fn send_to_unknown_peer_does_not_panic() {
        let socket_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let transport = UdpPeerTransport::bind(socket_addr, HashMap::new()).unwrap();
        let msg = Message::new(
            ReplicaId::new(0),
            MessagePayload::ClientPreProcessRequest(quorate_core::ClientPreProcessRequestMsg {
                client_id: ClientId::new(1),
                req_seq_num: SeqNum::new(1),
                cid: "cid".into(),
                payload: b"x".to_vec(),
                request_timeout_milli: 1_000,
                signature: None,
                flags: 0,
            }),
        );
        transport.send_to(ReplicaId::new(9), &msg);
    }
}
