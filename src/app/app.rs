//! Application layer: command codes, service
//! activation, RT-mode keep-alive, CMD requests/responses, and the
//! custom delivery filter that keeps keep-alives and display-fragment
//! reassembly internal to this layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::transport::{Transport, TransportCommand};
use crate::{Error, Result};

/// Service identifier: the low byte of the 16-bit little-endian command
/// field in the 4-byte application header.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, num_enum::FromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum ServiceId {
    PairingControl = 0x00,
    CommandMode = 0x01,
    RtMode = 0x02,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// 4-byte application header carried in every transport `DATA` frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub service: ServiceId,
    pub command: u8,
}

impl AppHeader {
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        [
            self.major_version,
            self.minor_version,
            u8::from(self.service),
            self.command,
        ]
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < 4 {
            return Err(Error::Protocol("application header too short".into()));
        }
        Ok(Self {
            major_version: b[0],
            minor_version: b[1],
            service: ServiceId::from(b[2]),
            command: b[3],
        })
    }
}

/// A fully decoded application-layer packet.
#[derive(Clone, Debug)]
pub struct AppPacket {
    pub header: AppHeader,
    pub body: Vec<u8>,
}

/// Control-service command codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::FromPrimitive, num_enum::IntoPrimitive, strum::Display)]
#[repr(u8)]
pub enum CtrlCommand {
    Connect = 0x01,
    ConnectResponse = 0x02,
    Bind = 0x03,
    BindResponse = 0x04,
    ActivateService = 0x05,
    ActivateServiceResponse = 0x06,
    DeactivateAllServices = 0x07,
    DeactivateAllServicesResponse = 0x08,
    Disconnect = 0x09,
    #[num_enum(catch_all)]
    #[strum(to_string = "Unknown({0})")]
    Unknown(u8),
}

/// CMD-mode command codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::FromPrimitive, num_enum::IntoPrimitive, strum::Display)]
#[repr(u8)]
pub enum CmdCommand {
    ReadDateTime = 0x01,
    ReadDateTimeResponse = 0x02,
    ReadPumpStatus = 0x03,
    ReadPumpStatusResponse = 0x04,
    ReadErrorWarningStatus = 0x05,
    ReadErrorWarningStatusResponse = 0x06,
    ReadHistoryBlock = 0x07,
    ReadHistoryBlockResponse = 0x08,
    ConfirmHistoryBlock = 0x09,
    DeliverBolus = 0x0A,
    DeliverBolusResponse = 0x0B,
    GetBolusStatus = 0x0C,
    GetBolusStatusResponse = 0x0D,
    CancelBolus = 0x0E,
    CancelBolusResponse = 0x0F,
    #[num_enum(catch_all)]
    #[strum(to_string = "Unknown({0})")]
    Unknown(u8),
}

/// RT-mode command codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::FromPrimitive, num_enum::IntoPrimitive, strum::Display)]
#[repr(u8)]
pub enum RtCommand {
    KeepAlive = 0x01,
    ButtonStatus = 0x02,
    Display = 0x03,
    Audio = 0x04,
    Vibration = 0x05,
    Pause = 0x06,
    Resume = 0x07,
    #[num_enum(catch_all)]
    #[strum(to_string = "Unknown({0})")]
    Unknown(u8),
}

bitflags::bitflags! {
    /// RT button codes. Multi-button chords OR
    /// these together into a single byte.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ButtonCode: u8 {
        const NO_BUTTON = 0x00;
        const UP        = 0x01;
        const DOWN      = 0x02;
        const MENU      = 0x04;
        const CHECK     = 0x08;
    }
}

/// One reassembled RT display quadrant set, keyed by the frame sequence
/// id the pump stamps on all four quadrants of a single redraw.
#[derive(Default)]
struct DisplayReassembly {
    frame_seq: Option<u16>,
    quadrants: [Option<Vec<u8>>; 4],
}

impl DisplayReassembly {
    /// Feeds one quadrant; returns the reassembled 4-quadrant payload
    /// once all four for the same `frame_seq` have arrived.
    fn feed(&mut self, frame_seq: u16, quadrant: u8, data: Vec<u8>) -> Option<[Vec<u8>; 4]> {
        if self.frame_seq != Some(frame_seq) {
            self.frame_seq = Some(frame_seq);
            self.quadrants = Default::default();
        }
        if let Some(slot) = self.quadrants.get_mut(usize::from(quadrant)) {
            *slot = Some(data);
        }
        if self.quadrants.iter().all(Option::is_some) {
            let [a, b, c, d] = std::mem::take(&mut self.quadrants);
            self.frame_seq = None;
            Some([a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()])
        } else {
            None
        }
    }
}

/// Application layer over a connected [`Transport`]. Assigns RT
/// sequence numbers, reassembles the 4-quadrant RT display, and applies
/// the custom delivery filter before packets reach
/// waiters.
pub struct App {
    transport: Arc<Transport>,
    rt_seq: AtomicU16,
    reassembly: crate::SyncMutex<DisplayReassembly>,
    subscribers: crate::SyncMutex<HashMap<(ServiceId, u8), mpsc::UnboundedSender<AppPacket>>>,
    should_deliver: crate::SyncMutex<Box<dyn Fn(&AppPacket) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

impl App {
    #[must_use]
    pub fn new(transport: Arc<Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            rt_seq: AtomicU16::new(0),
            reassembly: crate::SyncMutex::new(DisplayReassembly::default()),
            subscribers: crate::SyncMutex::new(HashMap::new()),
            should_deliver: crate::SyncMutex::new(Box::new(default_should_deliver)),
        })
    }

    /// Installs a custom delivery predicate.
    /// Packets for which it returns `false` are handled internally (or
    /// dropped) and never reach [`App::subscribe`] waiters.
    pub fn set_should_deliver(&self, f: impl Fn(&AppPacket) -> bool + Send + Sync + 'static) {
        *self.should_deliver.lock() = Box::new(f);
    }

    pub fn subscribe(
        &self,
        service: ServiceId,
        command: u8,
    ) -> mpsc::UnboundedReceiver<AppPacket> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert((service, command), tx);
        rx
    }

    /// Runs the DATA-frame decode loop; spawn alongside
    /// [`Transport::run`].
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.transport.subscribe(TransportCommand::Data);
        while let Some(packet) = rx.recv().await {
            if let Err(e) = self.handle_data(packet.payload).await {
                warn!(error = %e, "dropping malformed application packet");
            }
        }
    }

    async fn handle_data(&self, payload: Vec<u8>) -> Result<()> {
        let header = AppHeader::from_bytes(&payload)?;
        let mut body = payload[4..].to_vec();

        if header.service == ServiceId::RtMode {
            let cmd = RtCommand::from(header.command);
            if matches!(cmd, RtCommand::ButtonStatus | RtCommand::Display) {
                if body.len() < 2 {
                    return Err(Error::Protocol("RT packet missing sequence prefix".into()));
                }
                let _seq = u16::from_le_bytes([body[0], body[1]]);
                body.drain(..2);
            }
            if cmd == RtCommand::Display {
                return self.handle_rt_display(body);
            }
        }

        let packet = AppPacket { header, body };
        if !(self.should_deliver.lock())(&packet) {
            trace!(?packet.header, "packet filtered, handled internally");
            return Ok(());
        }
        if let Some(tx) = self
            .subscribers
            .lock()
            .get(&(packet.header.service, packet.header.command))
        {
            let _ = tx.send(packet);
        }
        Ok(())
    }

    fn handle_rt_display(&self, body: Vec<u8>) -> Result<()> {
        if body.len() < 3 {
            return Err(Error::Protocol("RT_DISPLAY quadrant header too short".into()));
        }
        let frame_seq = u16::from_le_bytes([body[0], body[1]]);
        let quadrant = body[2];
        let data = body[3..].to_vec();
        let reassembled = self.reassembly.lock().feed(frame_seq, quadrant, data);
        if let Some(quadrants) = reassembled {
            let packet = AppPacket {
                header: AppHeader {
                    major_version: 1,
                    minor_version: 0,
                    service: ServiceId::RtMode,
                    command: u8::from(RtCommand::Display),
                },
                body: quadrants.concat(),
            };
            if let Some(tx) = self
                .subscribers
                .lock()
                .get(&(ServiceId::RtMode, u8::from(RtCommand::Display)))
            {
                let _ = tx.send(packet);
            }
        }
        Ok(())
    }

    /// Sends an application packet. Every RT-mode send (keep-alive,
    /// button status, ...) is prefixed with the next 2-byte little-endian
    /// RT sequence number from this connection's own outbound counter
    ///; all other services send their body
    /// unprefixed.
    pub async fn send(&self, service: ServiceId, command: u8, body: Vec<u8>) -> Result<()> {
        let header = AppHeader {
            major_version: 1,
            minor_version: 0,
            service,
            command,
        };
        let mut payload = header.to_bytes().to_vec();
        if service == ServiceId::RtMode {
            payload.extend(self.next_rt_sequence().to_le_bytes());
        }
        payload.extend(body);
        let reliable = service != ServiceId::RtMode || RtCommand::from(command) != RtCommand::KeepAlive;
        self.transport
            .send(TransportCommand::Data, payload, reliable)
            .await
    }

    /// Next RT sequence number for this connection's own outbound RT
    /// traffic. Independent of the sequence
    /// the pump stamps on its own `RT_DISPLAY` quadrants.
    pub fn next_rt_sequence(&self) -> u16 {
        self.rt_seq.fetch_add(1, Ordering::SeqCst)
    }
}

/// Default filter: keep-alives are internal noise, never surfaced.
fn default_should_deliver(packet: &AppPacket) -> bool {
    !(packet.header.service == ServiceId::RtMode
        && RtCommand::from(packet.header.command) == RtCommand::KeepAlive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_header_round_trips() {
        let h = AppHeader {
            major_version: 1,
            minor_version: 2,
            service: ServiceId::CommandMode,
            command: 0x03,
        };
        assert_eq!(AppHeader::from_bytes(&h.to_bytes()).unwrap(), h);
    }

    #[test]
    fn display_reassembly_waits_for_all_four_quadrants() {
        let mut r = DisplayReassembly::default();
        assert!(r.feed(1, 0, vec![0]).is_none());
        assert!(r.feed(1, 1, vec![1]).is_none());
        assert!(r.feed(1, 2, vec![2]).is_none());
        let done = r.feed(1, 3, vec![3]);
        assert_eq!(done, Some([vec![0], vec![1], vec![2], vec![3]]));
    }

    #[test]
    fn display_reassembly_resets_on_new_frame_sequence() {
        let mut r = DisplayReassembly::default();
        assert!(r.feed(1, 0, vec![0]).is_none());
        // A new frame_seq before the first completes discards stale
        // quadrants rather than mixing them into the new frame.
        assert!(r.feed(2, 0, vec![9]).is_none());
        assert!(r.feed(2, 1, vec![9]).is_none());
        assert!(r.feed(2, 2, vec![9]).is_none());
        assert!(r.feed(2, 3, vec![9]).is_some());
    }

    #[test]
    fn default_filter_drops_keep_alive_only() {
        let ka = AppPacket {
            header: AppHeader {
                major_version: 1,
                minor_version: 0,
                service: ServiceId::RtMode,
                command: u8::from(RtCommand::KeepAlive),
            },
            body: vec![],
        };
        let status = AppPacket {
            header: AppHeader {
                major_version: 1,
                minor_version: 0,
                service: ServiceId::RtMode,
                command: u8::from(RtCommand::ButtonStatus),
            },
            body: vec![],
        };
        assert!(!default_should_deliver(&ka));
        assert!(default_should_deliver(&status));
    }
}
