use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Port value of a reservation whose client source port has not been observed
/// yet. The controller only knows addresses in advance; the first datagram
/// from a reserved address locks in the port it arrived from.
pub const UNBOUND_PORT: u16 = 0;

/// One allow-list slot, created by an `admit` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionEntry {
    pub player_id: u32,
    pub address: Ipv4Addr,
    pub port: u16,
}

/// Allow-list of players permitted to reach the game server, shared between
/// the control server and the forwarder. A linear scan under one mutex is
/// plenty: the controller admits tens of players, not thousands.
#[derive(Debug, Default)]
pub struct AdmissionTable {
    entries: Mutex<Vec<AdmissionEntry>>,
}

impl AdmissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AdmissionEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a reservation for `address`. The controller is trusted not to
    /// duplicate; a second reservation for the same address is a second slot,
    /// claimed by whichever client port shows up next.
    pub fn add(&self, player_id: u32, address: Ipv4Addr) {
        self.lock().push(AdmissionEntry {
            player_id,
            address,
            port: UNBOUND_PORT,
        });
    }

    /// Removes the first entry for `player_id`. The revoke command carries an
    /// address on the wire but removal matches the player id alone.
    pub fn remove(&self, player_id: u32) {
        let mut entries = self.lock();
        if let Some(index) = entries.iter().position(|e| e.player_id == player_id) {
            entries.remove(index);
        }
    }

    /// Clears the table. Existing flows are not touched here; they die on
    /// their next packet or at the idle reap.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Admission probe for one datagram source. An entry already bound to
    /// exactly (address, port) admits immediately. Otherwise the first
    /// reservation for that address, in insertion order, is bound to `port`
    /// and admits the client; later datagrams from the same address but a
    /// different port must claim their own reservation.
    pub fn check_allowed_and_bind_port(&self, address: Ipv4Addr, port: u16) -> bool {
        let mut entries = self.lock();
        if entries
            .iter()
            .any(|e| e.address == address && e.port == port)
        {
            return true;
        }
        if let Some(reservation) = entries
            .iter_mut()
            .find(|e| e.address == address && e.port == UNBOUND_PORT)
        {
            reservation.port = port;
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the current entries, insertion order preserved.
    pub fn entries(&self) -> Vec<AdmissionEntry> {
        self.lock().clone()
    }
}
