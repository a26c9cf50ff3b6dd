//! Shared black-box fixtures: an in-memory [`FakeSocket`] standing in for
//! the external RFCOMM collaborator, plus a paired [`MemoryStore`] entry,
//! used across the end-to-end scenario tests in this directory.

use std::sync::Arc;

use async_trait::async_trait;
use combo_ctl::bt::Socket;
use combo_ctl::codec::{encode_frame, Deframer};
use combo_ctl::crypto::{Key, Nonce};
use combo_ctl::store::{Addr, InvariantPumpData, MemoryStore, PumpStore};
use combo_ctl::transport::{CommandByte, Packet, Transport, TransportCommand, TransportConfig};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Stands in for the pump side of the RFCOMM link: captures every raw
/// frame handed to [`Socket::send`] (decoded for assertions) and, for
/// every reliable send, immediately loops back a matching `ACK_RESPONSE`
/// so the transport's retry/timeout machinery never has to fire in a
/// test that isn't specifically exercising it.
#[derive(Debug)]
pub struct FakeSocket {
    sent_frames: Arc<Mutex<Vec<Vec<u8>>>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    ack_key: Key,
    ack_nonce: Nonce,
}

impl FakeSocket {
    #[must_use]
    pub fn new(ack_key: Key) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>, mpsc::UnboundedSender<Vec<u8>>) {
        let sent_frames = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sent_frames: sent_frames.clone(),
                inbound_tx: tx.clone(),
                inbound_rx: Some(rx),
                ack_key,
                ack_nonce: Nonce::zero(),
            },
            sent_frames,
            tx,
        )
    }
}

#[async_trait]
impl Socket for FakeSocket {
    async fn send(&mut self, bytes: &[u8]) -> combo_ctl::Result<()> {
        self.sent_frames.lock().push(bytes.to_vec());

        let mut deframer = Deframer::new();
        for frame in deframer.feed(bytes) {
            if let Ok((packet, _mac)) = Packet::parse_unverified(&frame) {
                if packet.command.reliable {
                    self.ack_nonce = self.ack_nonce.incremented(1);
                    let ack = Packet {
                        command: CommandByte {
                            command: TransportCommand::AckResponse,
                            sequence_bit: packet.command.sequence_bit,
                            reliable: false,
                        },
                        address: packet.address,
                        nonce: self.ack_nonce,
                        payload: Vec::new(),
                    };
                    let wire = ack.serialize_authenticated(&self.ack_key);
                    let _ = self.inbound_tx.send(encode_frame(&wire));
                }
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> combo_ctl::Result<Vec<u8>> {
        match self.inbound_rx.as_mut().unwrap().recv().await {
            Some(bytes) => Ok(bytes),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> combo_ctl::Result<()> {
        Ok(())
    }
}

pub fn sample_addr() -> Addr {
    Addr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
}

pub fn sample_invariant() -> InvariantPumpData {
    InvariantPumpData {
        client_pump_cipher: Key::new([7; 16]),
        pump_client_cipher: Key::new([9; 16]),
        key_response_address: 0x12,
        pump_id: "PUMP_TEST0001".into(),
    }
}

/// Builds a paired [`Transport`] over a self-acking [`FakeSocket`] and
/// spawns its receive loop, returning the transport along with the
/// captured outbound frame buffer so a test can decode each send.
pub fn paired_transport() -> (Arc<Transport>, Arc<Mutex<Vec<Vec<u8>>>>) {
    let store: Arc<dyn PumpStore> = Arc::new(MemoryStore::new());
    let addr = sample_addr();
    let invariant = sample_invariant();
    store.create(addr, invariant.clone()).unwrap();
    let (socket, sent_frames, _inbound_tx) = FakeSocket::new(invariant.pump_client_cipher);
    let transport = Transport::new(addr, store, Box::new(socket), TransportConfig::default());
    tokio::spawn(transport.clone().run());
    (transport, sent_frames)
}

/// Decodes a captured outbound frame back to `(command, sequence_bit,
/// reliable, payload)`, reversing byte-stuffing and MAC/CRC framing.
pub fn decode_outbound(frame: &[u8]) -> (TransportCommand, bool, bool, Vec<u8>) {
    let mut deframer = Deframer::new();
    let unstuffed = deframer.feed(frame);
    assert_eq!(unstuffed.len(), 1, "exactly one frame per send");
    let (packet, _mac) = Packet::parse_unverified(&unstuffed[0]).unwrap();
    (
        packet.command.command,
        packet.command.sequence_bit,
        packet.command.reliable,
        packet.payload,
    )
}
