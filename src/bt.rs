//! External Bluetooth provider contract. Discovery,
//! SDP, and the RFCOMM socket itself are out of scope; the core only
//! depends on this narrow trait.

use async_trait::async_trait;

use crate::store::Addr;
use crate::Result;

/// One end of an RFCOMM connection to a paired pump. Send/recv are
/// blocking from the provider's perspective but cancellable by the
/// caller's async runtime.
#[async_trait]
pub trait Socket: std::fmt::Debug + Send + Sync {
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;
    async fn recv(&mut self) -> Result<Vec<u8>>;
    async fn close(&mut self) -> Result<()>;
}

/// Bluetooth adapter/provider contract the controller drives during
/// pairing and connect.
#[async_trait]
pub trait BluetoothProvider: std::fmt::Debug + Send + Sync {
    /// Scans for Combo pumps for up to `timeout_secs`, invoking `on_found`
    /// for each discovered device.
    async fn scan_for_combo(
        &self,
        timeout_secs: u64,
        on_found: &mut (dyn FnMut(Addr, &str) + Send),
    ) -> Result<()>;

    async fn connect_rfcomm(&self, addr: Addr) -> Result<Box<dyn Socket>>;

    async fn unpair(&self, addr: Addr) -> Result<()>;

    fn adapter_friendly_name(&self) -> String;
}

/// Pairing PIN callback contract. Returns `None` if
/// the user aborts pairing.
#[async_trait]
pub trait PinCallback: Send + Sync {
    async fn ask_pin(&self, addr: Addr, previous_attempt_failed: bool) -> Option<String>;
}
