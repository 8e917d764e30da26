//! Transport contract.
//!
//! The engine only needs to hand packets to something. Framing, compression
//! and encryption belong to the transport; inbound packets are delivered
//! with [`EngineHandle::handle_packet`] or [`EngineHandle::handle_wire`].

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clipboard::dispatcher::EngineHandle;
use crate::clipboard::packet::{Packet, WireValue};

/// Outbound half of a packet transport. Sending is fire-and-forget.
pub trait PacketSender: Send + Sync {
    /// Queue `packet` for the peer
    fn send(&self, packet: Packet);
}

/// Transport that queues packets on an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Packet>,
}

impl ChannelSender {
    /// Create the sender and the receiving end of its queue
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PacketSender for ChannelSender {
    fn send(&self, packet: Packet) {
        if let Err(e) = self.tx.send(packet) {
            debug!("Transport closed, dropping {}", e.0.name());
        }
    }
}

/// How a forwarder hands packets to the peer engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ForwardEncoding {
    /// Typed packets, as-is
    #[default]
    Direct,
    /// Positional values
    Wire,
    /// Positional values through a JSON byte stream
    Json,
}

/// Forward every packet from `rx` to `peer` until either side goes away
pub fn spawn_forwarder(
    mut rx: mpsc::UnboundedReceiver<Packet>,
    peer: EngineHandle,
    encoding: ForwardEncoding,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let delivered = match encoding {
                ForwardEncoding::Direct => peer.handle_packet(packet),
                ForwardEncoding::Wire => peer.handle_wire(packet.to_wire()),
                ForwardEncoding::Json => match json_round_trip(&packet) {
                    Ok(values) => peer.handle_wire(values),
                    Err(e) => {
                        warn!("Failed to serialize {}: {}", packet.name(), e);
                        continue;
                    }
                },
            };
            if delivered.is_err() {
                debug!("Peer engine stopped, forwarder exiting");
                break;
            }
        }
    })
}

fn json_round_trip(packet: &Packet) -> serde_json::Result<Vec<WireValue>> {
    let bytes = serde_json::to_vec(&packet.to_wire())?;
    serde_json::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sender_queues_packets() {
        let (sender, mut rx) = ChannelSender::new();
        sender.send(Packet::PendingRequests(2));
        assert_eq!(rx.recv().await, Some(Packet::PendingRequests(2)));
    }

    #[test]
    fn test_send_after_close_is_silent() {
        let (sender, rx) = ChannelSender::new();
        drop(rx);
        sender.send(Packet::EnableSelections(vec!["CLIPBOARD".to_string()]));
    }

    #[test]
    fn test_json_round_trip() {
        let packet = Packet::Request {
            request_id: 12,
            selection: "PRIMARY".to_string(),
            target: "TEXT".to_string(),
        };
        let values = json_round_trip(&packet).unwrap();
        assert_eq!(Packet::from_wire(values).unwrap(), packet);
    }
}
