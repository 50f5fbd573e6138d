//! Ownership of opaque provider handles.
//!
//! Every raw handle the provider hands out is adopted into the registry right away and
//! represented by a move-only [`Owned`] guard. Releasing consumes the guard; dropping an
//! unreleased guard releases it too, so every exit path releases exactly once. Identifiers are
//! `(index, generation)` pairs: once a slot is released its old identifiers never resolve again.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::provider::{CallStatus, GssProvider, RawHandle};
use crate::status::{CallSite, StatusTranslator};
use crate::{Error, ErrorKind, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Name,
    Credential,
    Context,
    Buffer,
}

impl HandleKind {
    fn index(self) -> usize {
        match self {
            HandleKind::Name => 0,
            HandleKind::Credential => 1,
            HandleKind::Context => 2,
            HandleKind::Buffer => 3,
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::Name => "name",
            HandleKind::Credential => "credential",
            HandleKind::Context => "security context",
            HandleKind::Buffer => "buffer",
        };

        f.write_str(name)
    }
}

mod private {
    pub trait Sealed {}
}

/// Type-level tag of an [`Owned`] handle.
pub trait Kind: private::Sealed {
    const KIND: HandleKind;
}

/// Marker types for [`Owned`].
pub mod kind {
    use super::{private, HandleKind, Kind};

    #[derive(Debug)]
    pub enum Name {}
    #[derive(Debug)]
    pub enum Credential {}
    #[derive(Debug)]
    pub enum Context {}
    #[derive(Debug)]
    pub enum Buffer {}

    impl private::Sealed for Name {}
    impl private::Sealed for Credential {}
    impl private::Sealed for Context {}
    impl private::Sealed for Buffer {}

    impl Kind for Name {
        const KIND: HandleKind = HandleKind::Name;
    }
    impl Kind for Credential {
        const KIND: HandleKind = HandleKind::Credential;
    }
    impl Kind for Context {
        const KIND: HandleKind = HandleKind::Context;
    }
    impl Kind for Buffer {
        const KIND: HandleKind = HandleKind::Buffer;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
    kind: HandleKind,
}

impl HandleId {
    pub fn kind(&self) -> HandleKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub allocated: u64,
    pub released: u64,
    /// Release attempts on handles that were already released. Never forwarded to the provider.
    pub double_releases: u64,
    /// Releases the provider reported as failed. The slot is freed anyway.
    pub release_failures: u64,
    /// Live handles per kind: names, credentials, contexts, buffers.
    pub live: [usize; 4],
}

impl RegistryStats {
    pub fn live(&self, kind: HandleKind) -> usize {
        self.live[kind.index()]
    }

    pub fn total_live(&self) -> usize {
        self.live.iter().sum()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    kind: HandleKind,
    raw: Option<RawHandle>,
}

#[derive(Debug, Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
}

pub struct HandleRegistry {
    provider: Arc<dyn GssProvider>,
    slots: Mutex<Slots>,
    allocated: AtomicU64,
    released: AtomicU64,
    double_releases: AtomicU64,
    release_failures: AtomicU64,
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry").field("stats", &self.stats()).finish()
    }
}

impl HandleRegistry {
    pub fn new(provider: Arc<dyn GssProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            slots: Mutex::new(Slots::default()),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
            double_releases: AtomicU64::new(0),
            release_failures: AtomicU64::new(0),
        })
    }

    pub fn provider(&self) -> &dyn GssProvider {
        self.provider.as_ref()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // slot bookkeeping stays consistent even if a holder panicked
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes ownership of a raw handle the provider just produced.
    pub fn adopt<K: Kind>(self: &Arc<Self>, raw: RawHandle) -> Owned<K> {
        let mut slots = self.slots();

        let id = match slots.free.pop() {
            Some(index) => {
                let slot = &mut slots.entries[index as usize];
                slot.kind = K::KIND;
                slot.raw = Some(raw);

                HandleId {
                    index,
                    generation: slot.generation,
                    kind: K::KIND,
                }
            }
            None => {
                let index = slots.entries.len() as u32;
                slots.entries.push(Slot {
                    generation: 0,
                    kind: K::KIND,
                    raw: Some(raw),
                });

                HandleId {
                    index,
                    generation: 0,
                    kind: K::KIND,
                }
            }
        };

        self.allocated.fetch_add(1, Ordering::Relaxed);
        trace!(kind = %K::KIND, index = id.index, generation = id.generation, "adopted handle");

        Owned {
            id,
            registry: Some(Arc::clone(self)),
            _kind: PhantomData,
        }
    }

    /// Borrows the raw handle behind an identifier. Stale identifiers never resolve.
    pub fn resolve(&self, id: HandleId) -> Result<RawHandle> {
        let slots = self.slots();

        slots
            .entries
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.kind == id.kind)
            .and_then(|slot| slot.raw)
            .ok_or_else(|| Error::new(ErrorKind::InvalidHandle, format!("stale {} handle", id.kind)))
    }

    fn replace(&self, id: HandleId, raw: RawHandle) -> Result<()> {
        let mut slots = self.slots();

        match slots
            .entries
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.kind == id.kind && slot.raw.is_some())
        {
            Some(slot) => {
                slot.raw = Some(raw);
                Ok(())
            }
            None => Err(Error::new(ErrorKind::InvalidHandle, format!("stale {} handle", id.kind))),
        }
    }

    /// Frees the slot of `id` and hands back the raw handle it held.
    fn vacate(&self, id: HandleId) -> Result<RawHandle> {
        let mut slots = self.slots();

        let raw = slots
            .entries
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.kind == id.kind)
            .and_then(|slot| {
                let raw = slot.raw.take();
                if raw.is_some() {
                    slot.generation = slot.generation.wrapping_add(1);
                }
                raw
            });

        match raw {
            Some(raw) => {
                slots.free.push(id.index);
                self.released.fetch_add(1, Ordering::Relaxed);

                Ok(raw)
            }
            None => {
                drop(slots);
                Err(self.report_double_release(id.kind))
            }
        }
    }

    fn release(&self, id: HandleId) -> Result<()> {
        let raw = self.vacate(id)?;

        trace!(kind = %id.kind, index = id.index, "releasing handle");

        let status = match id.kind {
            HandleKind::Name => self.provider.release_name(raw),
            HandleKind::Credential => self.provider.release_cred(raw),
            HandleKind::Context => self.provider.delete_sec_context(raw),
            HandleKind::Buffer => self.provider.release_buffer(raw),
        };

        self.check_release_status(id.kind, status)
    }

    /// Frees the slot without calling the provider, for handles the provider already
    /// released on its own.
    fn forget(&self, id: HandleId) -> Result<()> {
        self.vacate(id)?;

        debug!(kind = %id.kind, index = id.index, "provider released the handle itself");

        Ok(())
    }

    fn check_release_status(&self, kind: HandleKind, status: CallStatus) -> Result<()> {
        let translated = StatusTranslator::new(self.provider.as_ref()).translate(
            CallSite::Release,
            status.major,
            status.minor,
            None,
        );

        if let Err(err) = &translated {
            self.release_failures.fetch_add(1, Ordering::Relaxed);
            warn!(%kind, error = %err, "provider failed to release handle");
        }

        translated.map(|_| ())
    }

    /// Records a release attempt on something that is already gone and builds the error for it.
    pub fn report_double_release(&self, kind: HandleKind) -> Error {
        self.double_releases.fetch_add(1, Ordering::Relaxed);
        error!(%kind, "attempt to release a handle that was already released");

        Error::new(
            ErrorKind::InvalidHandle,
            format!("the {} handle was already released", kind),
        )
    }

    pub fn stats(&self) -> RegistryStats {
        let mut live = [0; 4];

        for slot in self.slots().entries.iter().filter(|slot| slot.raw.is_some()) {
            live[slot.kind.index()] += 1;
        }

        RegistryStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            double_releases: self.double_releases.load(Ordering::Relaxed),
            release_failures: self.release_failures.load(Ordering::Relaxed),
            live,
        }
    }
}

/// Exclusive ownership of one registered handle.
pub struct Owned<K: Kind> {
    id: HandleId,
    registry: Option<Arc<HandleRegistry>>,
    _kind: PhantomData<K>,
}

impl<K: Kind> Owned<K> {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn raw(&self) -> Result<RawHandle> {
        match &self.registry {
            Some(registry) => registry.resolve(self.id),
            None => Err(Error::new(ErrorKind::InvalidHandle, format!("{} handle was released", K::KIND))),
        }
    }

    /// Records a new raw value after the provider moved the handle.
    pub fn replace_raw(&mut self, raw: RawHandle) -> Result<()> {
        match &self.registry {
            Some(registry) => registry.replace(self.id, raw),
            None => Err(Error::new(ErrorKind::InvalidHandle, format!("{} handle was released", K::KIND))),
        }
    }

    pub fn release(mut self) -> Result<()> {
        match self.registry.take() {
            Some(registry) => registry.release(self.id),
            None => Err(Error::new(ErrorKind::InvalidHandle, format!("{} handle was released", K::KIND))),
        }
    }

    /// Gives up the handle after the provider released it. Nothing is forwarded to the provider.
    pub fn forget(mut self) -> Result<()> {
        match self.registry.take() {
            Some(registry) => registry.forget(self.id),
            None => Err(Error::new(ErrorKind::InvalidHandle, format!("{} handle was released", K::KIND))),
        }
    }
}

impl<K: Kind> fmt::Debug for Owned<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned").field("id", &self.id).finish()
    }
}

impl<K: Kind> Drop for Owned<K> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            if let Err(err) = registry.release(self.id) {
                warn!(error = %err, "failed to release {} handle on drop", K::KIND);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackProvider, LoopbackRealm};
    use crate::name::NameType;

    fn registry() -> (Arc<LoopbackProvider>, Arc<HandleRegistry>) {
        let provider = Arc::new(LoopbackProvider::new(LoopbackRealm::new("EXAMPLE.COM")));
        let registry = HandleRegistry::new(provider.clone());

        (provider, registry)
    }

    fn import(provider: &LoopbackProvider, name: &str) -> RawHandle {
        provider
            .import_name(name, NameType::UserPrincipal)
            .value
            .expect("name handle")
    }

    #[test]
    fn release_consumes_and_frees_provider_handle() {
        let (provider, registry) = registry();

        let owned: Owned<kind::Name> = registry.adopt(import(&provider, "alice@EXAMPLE.COM"));
        assert_eq!(registry.stats().live(HandleKind::Name), 1);

        owned.release().unwrap();

        let stats = registry.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.total_live(), 0);
        assert_eq!(provider.stats().live, 0);
    }

    #[test]
    fn drop_releases_exactly_once() {
        let (provider, registry) = registry();

        {
            let _owned: Owned<kind::Name> = registry.adopt(import(&provider, "alice@EXAMPLE.COM"));
        }

        assert_eq!(registry.stats().released, 1);
        assert_eq!(provider.stats().released, 1);
        assert_eq!(provider.stats().double_releases, 0);
    }

    #[test]
    fn stale_identifiers_never_resolve() {
        let (provider, registry) = registry();

        let first: Owned<kind::Name> = registry.adopt(import(&provider, "alice@EXAMPLE.COM"));
        let stale = first.id();
        first.release().unwrap();

        // the slot is reused with a new generation
        let second: Owned<kind::Name> = registry.adopt(import(&provider, "bob@EXAMPLE.COM"));
        assert_eq!(second.id().index, stale.index);

        assert_eq!(registry.resolve(stale).unwrap_err().error_type, ErrorKind::InvalidHandle);
        assert!(registry.resolve(second.id()).is_ok());
    }

    #[test]
    fn releasing_a_stale_identifier_is_reported_and_not_forwarded() {
        let (provider, registry) = registry();

        let owned: Owned<kind::Name> = registry.adopt(import(&provider, "alice@EXAMPLE.COM"));
        let id = owned.id();
        owned.release().unwrap();

        let err = registry.release(id).unwrap_err();

        assert_eq!(err.error_type, ErrorKind::InvalidHandle);
        assert_eq!(registry.stats().double_releases, 1);
        assert_eq!(provider.stats().released, 1);
        assert_eq!(provider.stats().double_releases, 0);
    }

    #[test]
    fn forgotten_handle_is_not_released_by_the_provider() {
        let (provider, registry) = registry();
        let raw = import(&provider, "alice@EXAMPLE.COM");

        let owned: Owned<kind::Name> = registry.adopt(raw);
        let id = owned.id();
        // the provider frees the handle on its own
        assert_eq!(provider.release_name(raw), CallStatus::COMPLETE);

        owned.forget().unwrap();

        let stats = registry.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.total_live(), 0);
        assert_eq!(stats.double_releases, 0);
        assert!(registry.resolve(id).is_err());
        assert_eq!(provider.stats().released, 1);
        assert_eq!(provider.stats().double_releases, 0);
    }
}
