//! Transport layer: framing, MAC/CRC verification,
//! reliable delivery with a per-endpoint sequence bit, and the pairing
//! handshake sub-protocol. Owns the RFCOMM socket exclusively; the Tx
//! nonce is owned by the worker that runs [`Transport::run`].

pub mod pairing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{encode_frame, Deframer};
use crate::crypto::{self, Nonce};
use crate::store::{Addr, PumpStore};
use crate::{Error, Result};

/// Header length: `version(1) + reserved(1) + command(1) + length(2) +
/// address(1) + nonce(13)`.
pub const HEADER_LEN: usize = 19;
/// 8-byte MAC trailer length.
pub const MAC_LEN: usize = crypto::MAC_LEN;
const PROTOCOL_VERSION: u8 = 1;

/// Transport-layer command family. The low 6 bits of the packet's command
/// byte; the upper two bits carry the reliability and sequence flags
/// separately (see [`CommandByte`]).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, num_enum::FromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum TransportCommand {
    ReqPairingConnection = 0x01,
    PairConnAccepted = 0x02,
    ReqKeys = 0x03,
    KeyResponse = 0x04,
    ReqId = 0x05,
    IdResponse = 0x06,
    ReqRegConnection = 0x07,
    RegConnAccepted = 0x08,
    Data = 0x09,
    AckResponse = 0x0A,
    Disconnect = 0x0B,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl TransportCommand {
    /// Pairing-phase commands use CRC-16 + zero MAC; everything else uses
    /// a MAC over the full header+payload.
    #[must_use]
    pub const fn is_pairing(self) -> bool {
        matches!(
            self,
            Self::ReqPairingConnection
                | Self::PairConnAccepted
                | Self::ReqKeys
                | Self::KeyResponse
                | Self::ReqId
                | Self::IdResponse
                | Self::ReqRegConnection
                | Self::RegConnAccepted
        )
    }
}

/// Reliability and sequence bits packed into the high two bits of the
/// packet's command byte, alongside the 6-bit command family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommandByte {
    pub command: TransportCommand,
    pub sequence_bit: bool,
    pub reliable: bool,
}

const RELIABLE_BIT: u8 = 0x80;
const SEQUENCE_BIT: u8 = 0x40;
const COMMAND_MASK: u8 = 0x3F;

impl CommandByte {
    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut b = u8::from(self.command) & COMMAND_MASK;
        if self.sequence_bit {
            b |= SEQUENCE_BIT;
        }
        if self.reliable {
            b |= RELIABLE_BIT;
        }
        b
    }

    #[must_use]
    pub fn from_byte(b: u8) -> Self {
        Self {
            command: TransportCommand::from(b & COMMAND_MASK),
            sequence_bit: b & SEQUENCE_BIT != 0,
            reliable: b & RELIABLE_BIT != 0,
        }
    }
}

/// One fully parsed (and, for non-pairing commands, MAC-verified) wire
/// packet.
#[derive(Clone, Debug)]
pub struct Packet {
    pub command: CommandByte,
    pub address: u8,
    pub nonce: Nonce,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Upper nibble: source address.
    #[must_use]
    pub const fn source(&self) -> u8 {
        self.address >> 4
    }

    /// Lower nibble: destination address.
    #[must_use]
    pub const fn destination(&self) -> u8 {
        self.address & 0x0F
    }

    fn header_bytes(&self, payload_len: u16) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[0] = PROTOCOL_VERSION;
        h[1] = 0; // reserved
        h[2] = self.command.to_byte();
        h[3..5].copy_from_slice(&payload_len.to_le_bytes());
        h[5] = self.address;
        h[6..19].copy_from_slice(&self.nonce.to_bytes());
        h
    }

    /// Serializes the packet for a pairing command: CRC-16 in the first
    /// two payload bytes, zero MAC. `self.payload`'s first two bytes must
    /// be a zero placeholder for the CRC field.
    #[must_use]
    pub fn serialize_pairing(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() >= 2, "pairing payload needs a CRC placeholder");
        let len = u16::try_from(self.payload.len()).expect("payload too large");
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + MAC_LEN);
        out.extend_from_slice(&self.header_bytes(len));
        out.extend_from_slice(&self.payload);
        let crc = crypto::crc16_bytes(&out);
        out[HEADER_LEN..HEADER_LEN + 2].copy_from_slice(&crc);
        out.extend_from_slice(&[0u8; MAC_LEN]);
        out
    }

    /// Serializes the packet and authenticates it with `key`.
    #[must_use]
    pub fn serialize_authenticated(&self, key: &crypto::Key) -> Vec<u8> {
        let len = u16::try_from(self.payload.len()).expect("payload too large");
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + MAC_LEN);
        out.extend_from_slice(&self.header_bytes(len));
        out.extend_from_slice(&self.payload);
        let mac = crypto::compute_mac(key, &out);
        out.extend_from_slice(&mac);
        out
    }

    /// Parses a deframed payload into header fields and raw payload,
    /// without verifying CRC/MAC (the caller knows which applies).
    pub fn parse_unverified(frame: &[u8]) -> Result<(Self, [u8; MAC_LEN])> {
        if frame.len() < HEADER_LEN + MAC_LEN {
            return Err(Error::Framing("frame shorter than header+mac".into()));
        }
        let version = frame[0];
        if version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!("unsupported version {version}")));
        }
        let command = CommandByte::from_byte(frame[2]);
        let payload_len = u16::from_le_bytes([frame[3], frame[4]]) as usize;
        let address = frame[5];
        let mut nonce_bytes = [0u8; 13];
        nonce_bytes.copy_from_slice(&frame[6..19]);
        let nonce = Nonce::from_bytes(&nonce_bytes);
        if frame.len() != HEADER_LEN + payload_len + MAC_LEN {
            return Err(Error::Protocol(format!(
                "length mismatch: header says {payload_len}, frame has {}",
                frame.len() - HEADER_LEN - MAC_LEN
            )));
        }
        let payload = frame[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&frame[HEADER_LEN + payload_len..]);
        Ok((
            Self {
                command,
                address,
                nonce,
                payload,
            },
            mac,
        ))
    }
}

/// Per-endpoint sequence bit state. Each endpoint
/// tracks its own next-outbound bit and the last bit it accepted inbound
/// (to recognize retransmitted duplicates).
#[derive(Debug, Default)]
struct SequenceState {
    next_out: AtomicBool,
    last_in: parking_lot::Mutex<Option<bool>>,
}

impl SequenceState {
    fn next_out_bit(&self) -> bool {
        self.next_out.fetch_xor(true, Ordering::SeqCst)
    }

    /// Returns `true` if `bit` is a fresh (non-duplicate) inbound
    /// sequence value, updating the tracked state as a side effect.
    fn accept_in(&self, bit: bool) -> bool {
        let mut last = self.last_in.lock();
        if *last == Some(bit) {
            false
        } else {
            *last = Some(bit);
            true
        }
    }
}

/// Pending-ACK bookkeeping for reliable sends.
struct PendingAck {
    sequence_bit: bool,
    done: oneshot::Sender<()>,
}

/// Policy knobs with the §5/§7/§9 defaults.
#[derive(Clone, Copy, Debug)]
pub struct TransportConfig {
    pub ack_timeout: Duration,
    pub max_retries: u8,
    /// MAC/CRC failures within `mac_failure_window` that reach
    /// `mac_failure_threshold` tear the transport down (§9 Open
    /// Questions: "3 within 1 s").
    pub mac_failure_threshold: u32,
    pub mac_failure_window: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1500),
            max_retries: 3,
            mac_failure_threshold: 3,
            mac_failure_window: Duration::from_secs(1),
        }
    }
}

/// Reliable, authenticated channel to a single paired pump.
///
/// Owns the RFCOMM socket exclusively. A background task (spawned by
/// [`Transport::run`]) performs deframing, verification, sequence-bit
/// bookkeeping, ACK generation, and dispatch into per-command-family
/// channels; [`Transport::send`] and [`Transport::recv`] are the only
/// supported entry points once the worker is running.
pub struct Transport {
    addr: Addr,
    store: Arc<dyn PumpStore>,
    socket: crate::AsyncMutex<Box<dyn crate::bt::Socket>>,
    config: TransportConfig,
    out_seq: SequenceState,
    in_seq: SequenceState,
    pending_acks: crate::SyncMutex<Vec<PendingAck>>,
    failed: AtomicBool,
    mac_failures: crate::SyncMutex<Vec<std::time::Instant>>,
    last_rx_nonce: crate::SyncMutex<Option<Nonce>>,
    subscribers: crate::SyncMutex<HashMap<TransportCommand, mpsc::UnboundedSender<Packet>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("addr", &self.addr).finish()
    }
}

impl Transport {
    #[must_use]
    pub fn new(
        addr: Addr,
        store: Arc<dyn PumpStore>,
        socket: Box<dyn crate::bt::Socket>,
        config: TransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr,
            store,
            socket: crate::AsyncMutex::new(socket),
            config,
            out_seq: SequenceState::default(),
            in_seq: SequenceState::default(),
            pending_acks: crate::SyncMutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            mac_failures: crate::SyncMutex::new(Vec::new()),
            last_rx_nonce: crate::SyncMutex::new(None),
            subscribers: crate::SyncMutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Whether the transport has failed terminally; once true, every send
    /// and receive fails immediately with the original error until the
    /// caller disconnects and reconnects.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Cancellation token observed by long-running operations built on
    /// top of this transport.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers a channel that receives every verified inbound packet of
    /// `command`'s family. Replaces any previous subscriber for that
    /// family.
    pub fn subscribe(&self, command: TransportCommand) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(command, tx);
        rx
    }

    /// Runs the receive loop until the socket closes or the transport is
    /// cancelled. Spawn this as a background task immediately after
    /// construction; a worker failure marks the transport failed.
    pub async fn run(self: Arc<Self>) {
        let mut deframer = Deframer::new();
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let recv = {
                let mut socket = self.socket.lock().await;
                socket.recv()
            };
            let bytes = tokio::select! {
                () = self.cancel.cancelled() => return,
                r = recv => r,
            };
            let bytes = match bytes {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "transport socket read failed");
                    self.mark_failed();
                    return;
                }
            };
            for frame in deframer.feed(&bytes) {
                self.handle_frame(&frame).await;
            }
        }
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let (packet, mac) = match Packet::parse_unverified(frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "framing error, resynchronizing");
                return;
            }
        };
        if packet.command.command.is_pairing() {
            if packet.payload.len() >= 2 {
                let mut zeroed = frame[..frame.len() - MAC_LEN].to_vec();
                zeroed[HEADER_LEN] = 0;
                zeroed[HEADER_LEN + 1] = 0;
                let expected = crypto::crc16_bytes(&zeroed);
                if packet.payload[..2] != expected {
                    warn!("pairing packet CRC mismatch");
                    self.record_mac_failure();
                    return;
                }
            }
        } else {
            let invariant = match self.store.get_invariant(self.addr) {
                Ok(i) => i,
                Err(e) => {
                    warn!(error = %e, "no invariant data, dropping authenticated packet");
                    return;
                }
            };
            let header_and_payload = &frame[..frame.len() - MAC_LEN];
            if !crypto::verify_mac(&invariant.pump_client_cipher, header_and_payload, &mac) {
                self.record_mac_failure();
                return;
            }
        }
        // A lost ACK makes the sender retry the same payload with the same
        // nonce and sequence bit. That retry must still be re-acked even
        // though its nonce looks like a replay, so sequence-bit duplicate
        // detection runs independently of, and before, nonce-replay
        // rejection.
        let sequence_duplicate =
            packet.command.reliable && !self.in_seq.accept_in(packet.command.sequence_bit);
        if sequence_duplicate {
            self.send_ack(packet.command.sequence_bit).await;
            trace!("duplicate reliable packet re-acked, not redelivered");
            return;
        }

        if !self.accept_nonce(packet.nonce) {
            debug!(nonce = ?packet.nonce, "dropping replayed nonce");
            return;
        }
        if packet.command.reliable {
            self.send_ack(packet.command.sequence_bit).await;
        }
        if packet.command.command == TransportCommand::AckResponse {
            self.complete_pending_ack(packet.command.sequence_bit);
            return;
        }
        if let Some(tx) = self.subscribers.lock().get(&packet.command.command) {
            let _ = tx.send(packet);
        }
    }

    /// Enforces strictly increasing nonces from the pump. This high-water
    /// mark is session-local, not persisted: a
    /// fresh RFCOMM connection starts a fresh pairing/bind sequence in
    /// which the pump's nonce stream restarts too.
    fn accept_nonce(&self, nonce: Nonce) -> bool {
        let mut last = self.last_rx_nonce.lock();
        match *last {
            Some(prev) if nonce <= prev => false,
            _ => {
                *last = Some(nonce);
                true
            }
        }
    }

    fn record_mac_failure(&self) {
        let now = std::time::Instant::now();
        let mut failures = self.mac_failures.lock();
        failures.retain(|t| now.duration_since(*t) <= self.config.mac_failure_window);
        failures.push(now);
        if failures.len() as u32 >= self.config.mac_failure_threshold {
            warn!("MAC failure threshold exceeded, tearing down transport");
            drop(failures);
            self.mark_failed();
        }
    }

    fn complete_pending_ack(&self, sequence_bit: bool) {
        let mut pending = self.pending_acks.lock();
        if let Some(pos) = pending.iter().position(|p| p.sequence_bit == sequence_bit) {
            let p = pending.remove(pos);
            let _ = p.done.send(());
        }
    }

    async fn send_ack(&self, sequence_bit: bool) {
        let ack = Packet {
            command: CommandByte {
                command: TransportCommand::AckResponse,
                sequence_bit,
                reliable: false,
            },
            address: self.addr_byte_out(),
            nonce: self.next_tx_nonce().unwrap_or_else(|_| Nonce::zero()),
            payload: Vec::new(),
        };
        let _ = self.write_raw(&ack).await;
    }

    fn addr_byte_out(&self) -> u8 {
        self.store
            .get_invariant(self.addr)
            .map(|i| {
                let a = i.key_response_address;
                (a << 4) | (a >> 4)
            })
            .unwrap_or(0)
    }

    fn next_tx_nonce(&self) -> Result<Nonce> {
        let current = self.store.get_tx_nonce(self.addr)?;
        let next = current.incremented(1);
        self.store.set_tx_nonce(self.addr, next)?;
        Ok(next)
    }

    async fn write_raw(&self, packet: &Packet) -> Result<()> {
        if self.is_failed() {
            return Err(Error::BluetoothIo("transport failed".into()));
        }
        let bytes = if packet.command.command.is_pairing() {
            packet.serialize_pairing()
        } else {
            let invariant = self.store.get_invariant(self.addr)?;
            packet.serialize_authenticated(&invariant.client_pump_cipher)
        };
        let frame = encode_frame(&bytes);
        let mut socket = self.socket.lock().await;
        socket.send(&frame).await.map_err(|e| {
            self.mark_failed();
            e
        })
    }

    /// Sends `payload` under `command`, with the reliability policy the
    /// caller picks. Reliable sends wait for an ACK up to
    /// [`TransportConfig::ack_timeout`], retrying the same nonce and
    /// sequence bit up to [`TransportConfig::max_retries`] times. Pairing
    /// commands are always sent CRC-protected with a zero MAC; every
    /// other command is MAC-authenticated.
    pub async fn send(
        &self,
        command: TransportCommand,
        payload: Vec<u8>,
        reliable: bool,
    ) -> Result<()> {
        if self.is_failed() {
            return Err(Error::BluetoothIo("transport failed".into()));
        }
        let sequence_bit = if reliable {
            self.out_seq.next_out_bit()
        } else {
            false
        };
        let nonce = self.next_tx_nonce()?;
        let packet = Packet {
            command: CommandByte {
                command,
                sequence_bit,
                reliable,
            },
            address: self.addr_byte_out(),
            nonce,
            payload,
        };
        if !reliable {
            return self.write_raw(&packet).await;
        }
        for attempt in 0..=self.config.max_retries {
            let (tx, rx) = oneshot::channel();
            self.pending_acks.lock().push(PendingAck {
                sequence_bit,
                done: tx,
            });
            self.write_raw(&packet).await?;
            match tokio::time::timeout(self.config.ack_timeout, rx).await {
                Ok(Ok(())) => return Ok(()),
                _ => {
                    debug!(attempt, "ack timeout, retrying with same nonce/sequence");
                }
            }
        }
        self.mark_failed();
        Err(Error::AckTimeout(self.config.max_retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_byte_round_trips() {
        let cb = CommandByte {
            command: TransportCommand::Data,
            sequence_bit: true,
            reliable: true,
        };
        assert_eq!(CommandByte::from_byte(cb.to_byte()), cb);
    }

    #[test]
    fn header_is_nineteen_bytes() {
        let p = Packet {
            command: CommandByte {
                command: TransportCommand::Data,
                sequence_bit: false,
                reliable: false,
            },
            address: 0x01,
            nonce: Nonce::zero(),
            payload: vec![1, 2, 3],
        };
        assert_eq!(p.header_bytes(3).len(), HEADER_LEN);
        assert_eq!(HEADER_LEN, 19);
    }

    #[test]
    fn authenticated_round_trip_verifies() {
        let key = crypto::Key::new([5u8; 16]);
        let p = Packet {
            command: CommandByte {
                command: TransportCommand::Data,
                sequence_bit: true,
                reliable: true,
            },
            address: 0x12,
            nonce: Nonce::zero().incremented(7),
            payload: vec![0xAA; 20],
        };
        let wire = p.serialize_authenticated(&key);
        let (parsed, mac) = Packet::parse_unverified(&wire).unwrap();
        assert_eq!(parsed.address, p.address);
        assert_eq!(parsed.payload, p.payload);
        let header_and_payload = &wire[..wire.len() - MAC_LEN];
        assert!(crypto::verify_mac(&key, header_and_payload, &mac));
    }

    #[test]
    fn tampered_payload_fails_mac() {
        let key = crypto::Key::new([5u8; 16]);
        let p = Packet {
            command: CommandByte {
                command: TransportCommand::Data,
                sequence_bit: false,
                reliable: false,
            },
            address: 0x12,
            nonce: Nonce::zero(),
            payload: vec![1, 2, 3],
        };
        let mut wire = p.serialize_authenticated(&key);
        let last = wire.len() - MAC_LEN - 1;
        wire[last] ^= 0xFF;
        let (_, mac) = Packet::parse_unverified(&wire).unwrap();
        let header_and_payload = &wire[..wire.len() - MAC_LEN];
        assert!(!crypto::verify_mac(&key, header_and_payload, &mac));
    }

    #[test]
    fn sequence_state_flags_duplicates() {
        let s = SequenceState::default();
        assert!(s.accept_in(false));
        assert!(!s.accept_in(false));
        assert!(s.accept_in(true));
    }

    #[test]
    fn next_out_bit_toggles() {
        let s = SequenceState::default();
        let a = s.next_out_bit();
        let b = s.next_out_bit();
        assert_ne!(a, b);
    }
}
