//! Pairing handshake sub-protocol. Runs before a
//! [`super::Transport`] has any persisted invariant data, so it speaks
//! directly to the socket with its own local nonce counter and the
//! CRC-16-protected pairing wire format.

use tracing::{debug, info};

use super::{CommandByte, Packet, TransportCommand, HEADER_LEN, MAC_LEN};
use crate::bt::{PinCallback, Socket};
use crate::codec::{encode_frame, Deframer};
use crate::crypto::{self, Nonce};
use crate::store::{Addr, InvariantPumpData};
use crate::{Error, Result};

/// Pairing handshake states. `Done` and the
/// terminal failure path (roll back and return `PairingAborted`) are not
/// modeled as explicit variants; the driver function returns instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PairingState {
    Init,
    ReqPairingConn,
    PairConnAccepted,
    ReqKeys,
    PinRequested,
    KeyResponse,
    ReqId,
    IdResponse,
    ReqRegConn,
    RegConnAccepted,
}

struct Driver<'a> {
    socket: &'a mut dyn Socket,
    deframer: Deframer,
    nonce: Nonce,
    /// Address byte to stamp on outgoing packets; flips to the
    /// reversed-nibble form once `KEY_RESPONSE` provides it.
    out_address: u8,
}

impl<'a> Driver<'a> {
    fn new(socket: &'a mut dyn Socket) -> Self {
        Self {
            socket,
            deframer: Deframer::new(),
            nonce: Nonce::zero(),
            out_address: 0,
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        let n = self.nonce;
        self.nonce = self.nonce.incremented(1);
        n
    }

    async fn send(&mut self, command: TransportCommand, mut payload: Vec<u8>) -> Result<()> {
        if payload.len() < 2 {
            payload.resize(2, 0);
        }
        let packet = Packet {
            command: CommandByte {
                command,
                sequence_bit: false,
                reliable: false,
            },
            address: self.out_address,
            nonce: self.next_nonce(),
            payload,
        };
        let wire = packet.serialize_pairing();
        self.socket.send(&encode_frame(&wire)).await
    }

    /// Receives the next pairing packet, verifying its CRC and that it
    /// carries the expected command.
    async fn recv(&mut self, expect: TransportCommand) -> Result<Packet> {
        loop {
            for frame in {
                let bytes = self.socket.recv().await?;
                self.deframer.feed(&bytes)
            } {
                let (packet, _mac) = Packet::parse_unverified(&frame)?;
                if packet.payload.len() >= 2 {
                    let mut zeroed = frame[..frame.len() - MAC_LEN].to_vec();
                    zeroed[HEADER_LEN] = 0;
                    zeroed[HEADER_LEN + 1] = 0;
                    if packet.payload[..2] != crypto::crc16_bytes(&zeroed) {
                        return Err(Error::CrcMismatch);
                    }
                }
                if packet.command.command != expect {
                    return Err(Error::Protocol(format!(
                        "expected {expect:?}, got {:?}",
                        packet.command.command
                    )));
                }
                return Ok(packet);
            }
        }
    }
}

/// Drives the full pairing handshake over an already-open RFCOMM socket,
/// prompting for a PIN via `pin_cb` when the pump requests it. On
/// success, returns the invariant data the caller must commit to the
/// store atomically; on failure the caller is expected to also unpair
/// at the Bluetooth level (§4.C, §7 `PairingAborted`).
pub async fn pair(
    socket: &mut dyn Socket,
    addr: Addr,
    pin_cb: &dyn PinCallback,
) -> Result<InvariantPumpData> {
    let mut d = Driver::new(socket);
    let mut state = PairingState::Init;
    let mut previous_attempt_failed = false;

    state = PairingState::ReqPairingConn;
    d.send(TransportCommand::ReqPairingConnection, vec![0, 0]).await?;
    d.recv(TransportCommand::PairConnAccepted).await?;
    state = PairingState::PairConnAccepted;
    debug!(?state, "pairing connection accepted");

    const MAX_PIN_ATTEMPTS: u8 = 3;
    let (key_response_address, client_pump_cipher, pump_client_cipher, pump_id) = 'attempts: {
        for _attempt in 0..MAX_PIN_ATTEMPTS {
            state = PairingState::ReqKeys;
            d.send(TransportCommand::ReqKeys, vec![0, 0]).await?;

            state = PairingState::PinRequested;
            let Some(pin) = pin_cb.ask_pin(addr, previous_attempt_failed).await else {
                return Err(Error::PairingAborted("PIN entry aborted by caller".into()));
            };
            let pin_key = crypto::derive_pin_key(&pin);
            let response = d.recv(TransportCommand::KeyResponse).await?;
            if response.payload.len() < 2 + 32 {
                return Err(Error::PairingAborted("KEY_RESPONSE payload too short".into()));
            }
            let body = &response.payload[2..34];
            let mut client_pump = [0u8; 16];
            let mut pump_client = [0u8; 16];
            client_pump.copy_from_slice(&body[..16]);
            pump_client.copy_from_slice(&body[16..]);
            let client_pump_cipher = crypto::decrypt_block(&pin_key, &client_pump);
            let pump_client_cipher = crypto::decrypt_block(&pin_key, &pump_client);
            state = PairingState::KeyResponse;
            let key_response_address = response.address;
            // Outgoing packets use the reversed nibble order of the
            // incoming KEY_RESPONSE address.
            d.out_address = (key_response_address << 4) | (key_response_address >> 4);
            debug!(?state, address = key_response_address, "keys derived");

            state = PairingState::ReqId;
            d.send(TransportCommand::ReqId, vec![0, 0]).await?;
            // A wrong PIN produces ciphers the pump's REQ_ID exchange
            // rejects; that surfaces here as a protocol or CRC error and
            // is the only way we learn the PIN was wrong (§9 Open
            // Questions).
            let id_response = match d.recv(TransportCommand::IdResponse).await {
                Ok(r) => r,
                Err(Error::Protocol(_) | Error::CrcMismatch) => {
                    previous_attempt_failed = true;
                    continue;
                }
                Err(e) => return Err(e),
            };
            state = PairingState::IdResponse;
            if id_response.payload.len() < 6 {
                return Err(Error::PairingAborted("ID_RESPONSE payload too short".into()));
            }
            let pump_id = String::from_utf8_lossy(&id_response.payload[6..])
                .trim_end_matches('\0')
                .to_string();
            break 'attempts (
                key_response_address,
                client_pump_cipher,
                pump_client_cipher,
                pump_id,
            );
        }
        return Err(Error::PairingAborted("PIN rejected too many times".into()));
    };

    state = PairingState::ReqRegConn;
    d.send(TransportCommand::ReqRegConnection, vec![0, 0]).await?;
    d.recv(TransportCommand::RegConnAccepted).await?;
    state = PairingState::RegConnAccepted;
    info!(?state, %pump_id, "pairing handshake complete");

    Ok(InvariantPumpData {
        client_pump_cipher: crypto::Key::new(client_pump_cipher),
        pump_client_cipher: crypto::Key::new(pump_client_cipher),
        key_response_address,
        pump_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_nibble_reversal() {
        let incoming: u8 = 0x10;
        let reversed = (incoming << 4) | (incoming >> 4);
        assert_eq!(reversed, 0x01);
    }
}
