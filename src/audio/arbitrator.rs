//! Exclusive-ownership gate for the single half-duplex audio bus.
//!
//! Lock order is always `bus` then `owner`. Ownership queries only take the
//! `owner` lock, so they never wait on a blocking peripheral call.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::bus::{AudioBus, BusConfig, BusOwner, BusRole};
use crate::{Error, Result};

pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BusArbitrator {
    bus: Mutex<Box<dyn AudioBus>>,
    owner: Mutex<BusOwner>,
    config: BusConfig,
}

impl BusArbitrator {
    pub fn new(bus: Box<dyn AudioBus>, config: BusConfig) -> Self {
        Self {
            bus: Mutex::new(bus),
            owner: Mutex::new(BusOwner::Free),
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Grant the bus to `role` if it is free or already held by `role`.
    ///
    /// A fresh grant (re)configures the peripheral for the role. A failed
    /// configuration leaves the bus `Free` and returns `false`.
    pub fn request(&self, role: BusRole) -> bool {
        let mut bus = lock(&self.bus);
        let mut owner = lock(&self.owner);

        if *owner == BusOwner::from(role) {
            return true;
        }
        if *owner != BusOwner::Free {
            log::warn!("Bus access denied: {:?} holds the bus (requested by {:?})", *owner, role);
            return false;
        }

        let settings = self.config.settings_for(role);
        if let Err(e) = bus.configure(&settings) {
            log::error!("Failed to configure bus for {:?}: {}", role, e);
            bus.shutdown();
            return false;
        }

        *owner = role.into();
        log::info!("Bus access granted to {:?}", role);
        true
    }

    /// Release the bus. Only the current owner can release; anyone else gets
    /// `false` and nothing changes.
    pub fn release(&self, role: BusRole) -> bool {
        let mut bus = lock(&self.bus);
        let mut owner = lock(&self.owner);

        if *owner != BusOwner::from(role) {
            log::warn!("Bus release denied: {:?} does not hold the bus (current: {:?})", role, *owner);
            return false;
        }

        bus.shutdown();
        *owner = BusOwner::Free;
        log::info!("Bus access released by {:?}", role);
        true
    }

    /// Tear down whatever holds the bus. Idempotent.
    pub fn force_release(&self) {
        let mut bus = lock(&self.bus);
        let mut owner = lock(&self.owner);

        if *owner != BusOwner::Free {
            log::warn!("Force releasing bus from {:?}", *owner);
            bus.shutdown();
        }
        *owner = BusOwner::Free;
    }

    pub fn has_access(&self, role: BusRole) -> bool {
        *lock(&self.owner) == BusOwner::from(role)
    }

    pub fn current_owner(&self) -> BusOwner {
        *lock(&self.owner)
    }

    /// Read raw capture samples on behalf of `role`.
    pub fn read(&self, role: BusRole, buf: &mut [i32], timeout: Duration) -> Result<usize> {
        let mut bus = lock(&self.bus);
        if !self.has_access(role) {
            return Err(Error::NotOwner(role));
        }
        bus.read(buf, timeout)
    }

    /// Write 16-bit PCM bytes on behalf of `role`.
    pub fn write(&self, role: BusRole, data: &[u8], timeout: Duration) -> Result<usize> {
        let mut bus = lock(&self.bus);
        if !self.has_access(role) {
            return Err(Error::NotOwner(role));
        }
        bus.write(data, timeout)
    }
}
