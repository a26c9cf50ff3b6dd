//! Persistent pump state store. The store itself is
//! an external collaborator (backing format is implementation-defined);
//! this module only defines the contract and the value types it carries.

use crate::Result;

/// Bluetooth device address, as the 6-byte value the Bluetooth provider
/// (an external collaborator, §6) hands back from discovery.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Addr(pub [u8; 6]);

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Invariant per-pump data established once by pairing and erased only by
/// explicit unpair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvariantPumpData {
    pub client_pump_cipher: crate::crypto::Key,
    pub pump_client_cipher: crate::crypto::Key,
    /// Packed nibble pair: upper = source address, lower = destination,
    /// stored in the reversed-nibble form used by outgoing packets.
    pub key_response_address: u8,
    pub pump_id: String,
}

/// A temporary basal rate snapshot as last programmed by this process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TbrSnapshot {
    /// Unix timestamp (seconds) when the TBR was programmed.
    pub timestamp: i64,
    pub percentage: u16,
    pub duration_minutes: u16,
    pub kind: TbrKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TbrKind {
    Standard,
    Emulated,
}

/// Full per-pump state, keyed by Bluetooth address.
#[derive(Clone, Debug)]
pub struct PumpState {
    pub invariant: InvariantPumpData,
    pub current_tx_nonce: crate::crypto::Nonce,
    pub utc_offset_seconds: i32,
    pub current_tbr: Option<TbrSnapshot>,
}

/// Persistent store contract. Implementations must
/// make every mutating operation durable before returning; a failure of
/// any kind is surfaced as [`crate::Error::StoreAccess`]. Concurrent
/// access to distinct addresses is allowed; the controller serializes
/// same-address operations itself (§4.B).
pub trait PumpStore: std::fmt::Debug + Send + Sync {
    /// Creates a new pump entry. Fails if one already exists for `addr`.
    fn create(&self, addr: Addr, invariant: InvariantPumpData) -> Result<()>;

    /// Deletes the entry for `addr`. Returns `false` if none existed.
    fn delete(&self, addr: Addr) -> Result<bool>;

    fn has(&self, addr: Addr) -> Result<bool>;

    fn list_addresses(&self) -> Result<Vec<Addr>>;

    fn get_invariant(&self, addr: Addr) -> Result<InvariantPumpData>;

    fn get_tx_nonce(&self, addr: Addr) -> Result<crate::crypto::Nonce>;

    fn set_tx_nonce(&self, addr: Addr, nonce: crate::crypto::Nonce) -> Result<()>;

    fn get_utc_offset(&self, addr: Addr) -> Result<i32>;

    fn set_utc_offset(&self, addr: Addr, offset_seconds: i32) -> Result<()>;

    fn get_tbr(&self, addr: Addr) -> Result<Option<TbrSnapshot>>;

    fn set_tbr(&self, addr: Addr, tbr: Option<TbrSnapshot>) -> Result<()>;
}

/// In-memory [`PumpStore`] used by tests and by embedders that do not need
/// cross-process durability themselves (they persist the whole snapshot
/// externally instead).
#[derive(Debug, Default)]
pub struct MemoryStore {
    pumps: crate::SyncMutex<std::collections::HashMap<Addr, PumpState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PumpStore for MemoryStore {
    fn create(&self, addr: Addr, invariant: InvariantPumpData) -> Result<()> {
        let mut pumps = self.pumps.lock();
        if pumps.contains_key(&addr) {
            return Err(crate::Error::StoreAccess(format!("{addr} already exists")));
        }
        pumps.insert(
            addr,
            PumpState {
                invariant,
                current_tx_nonce: crate::crypto::Nonce::zero(),
                utc_offset_seconds: 0,
                current_tbr: None,
            },
        );
        Ok(())
    }

    fn delete(&self, addr: Addr) -> Result<bool> {
        Ok(self.pumps.lock().remove(&addr).is_some())
    }

    fn has(&self, addr: Addr) -> Result<bool> {
        Ok(self.pumps.lock().contains_key(&addr))
    }

    fn list_addresses(&self) -> Result<Vec<Addr>> {
        Ok(self.pumps.lock().keys().copied().collect())
    }

    fn get_invariant(&self, addr: Addr) -> Result<InvariantPumpData> {
        self.pumps
            .lock()
            .get(&addr)
            .map(|s| s.invariant.clone())
            .ok_or(crate::Error::UnknownPump)
    }

    fn get_tx_nonce(&self, addr: Addr) -> Result<crate::crypto::Nonce> {
        self.pumps
            .lock()
            .get(&addr)
            .map(|s| s.current_tx_nonce)
            .ok_or(crate::Error::UnknownPump)
    }

    fn set_tx_nonce(&self, addr: Addr, nonce: crate::crypto::Nonce) -> Result<()> {
        self.pumps
            .lock()
            .get_mut(&addr)
            .map(|s| s.current_tx_nonce = nonce)
            .ok_or(crate::Error::UnknownPump)
    }

    fn get_utc_offset(&self, addr: Addr) -> Result<i32> {
        self.pumps
            .lock()
            .get(&addr)
            .map(|s| s.utc_offset_seconds)
            .ok_or(crate::Error::UnknownPump)
    }

    fn set_utc_offset(&self, addr: Addr, offset_seconds: i32) -> Result<()> {
        self.pumps
            .lock()
            .get_mut(&addr)
            .map(|s| s.utc_offset_seconds = offset_seconds)
            .ok_or(crate::Error::UnknownPump)
    }

    fn get_tbr(&self, addr: Addr) -> Result<Option<TbrSnapshot>> {
        self.pumps
            .lock()
            .get(&addr)
            .map(|s| s.current_tbr)
            .ok_or(crate::Error::UnknownPump)
    }

    fn set_tbr(&self, addr: Addr, tbr: Option<TbrSnapshot>) -> Result<()> {
        self.pumps
            .lock()
            .get_mut(&addr)
            .map(|s| s.current_tbr = tbr)
            .ok_or(crate::Error::UnknownPump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Key;

    fn sample_invariant() -> InvariantPumpData {
        InvariantPumpData {
            client_pump_cipher: Key::new([1; 16]),
            pump_client_cipher: Key::new([2; 16]),
            key_response_address: 0x10,
            pump_id: "PUMP_10230947".into(),
        }
    }

    #[test]
    fn create_then_get() {
        let store = MemoryStore::new();
        let addr = Addr([1, 2, 3, 4, 5, 6]);
        store.create(addr, sample_invariant()).unwrap();
        assert!(store.has(addr).unwrap());
        assert_eq!(store.get_invariant(addr).unwrap().pump_id, "PUMP_10230947");
    }

    #[test]
    fn create_twice_fails() {
        let store = MemoryStore::new();
        let addr = Addr([1, 2, 3, 4, 5, 6]);
        store.create(addr, sample_invariant()).unwrap();
        assert!(store.create(addr, sample_invariant()).is_err());
    }

    #[test]
    fn tx_nonce_is_monotonic_across_writes() {
        let store = MemoryStore::new();
        let addr = Addr([9; 6]);
        store.create(addr, sample_invariant()).unwrap();
        let mut n = store.get_tx_nonce(addr).unwrap();
        for _ in 0..5 {
            let next = n.incremented(1);
            store.set_tx_nonce(addr, next).unwrap();
            assert!(store.get_tx_nonce(addr).unwrap() > n);
            n = next;
        }
    }

    #[test]
    fn delete_absent_returns_false() {
        let store = MemoryStore::new();
        assert!(!store.delete(Addr([0; 6])).unwrap());
    }
}
