//! Dispatch tables, built lazily per (capability, type) pair.
//!
//! Buckets are keyed by the pair hash; entries inside a bucket are compared
//! by identity, so colliding pairs simply share a bucket. Each entry owns a
//! `OnceLock` which is the single-flight point: whoever gets there first
//! builds, everyone else blocks on the same cell and observes the same
//! table.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::{debug, trace};
use parking_lot::RwLock;

use crate::{
    CapabilityKey, CapabilityRegistry, CapabilitySet, CapabilitySetId, MethodFn, Result,
    TypeDescriptor, TypeKey,
};

#[inline]
pub fn pair_hash(capability_hash: u32, type_hash: u32) -> u32 {
    capability_hash.rotate_left(16) ^ type_hash
}

pub struct DispatchTable {
    capability: &'static CapabilitySet,
    concrete: &'static TypeDescriptor,
    pair_hash: u32,
    slots: Box<[MethodFn]>,
}

impl DispatchTable {
    #[inline]
    pub fn capability(&self) -> &'static CapabilitySet {
        self.capability
    }

    #[inline]
    pub fn capability_id(&self) -> CapabilitySetId {
        self.capability.id()
    }

    #[inline]
    pub fn concrete_type(&self) -> &'static TypeDescriptor {
        self.concrete
    }

    #[inline]
    pub fn pair_hash(&self) -> u32 {
        self.pair_hash
    }

    #[inline]
    pub fn slots(&self) -> &[MethodFn] {
        &self.slots
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn method(&self, slot: usize) -> Option<MethodFn> {
        self.slots.get(slot).copied()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("capability", &self.capability.name())
            .field("concrete", &self.concrete.name())
            .field("pair_hash", &format_args!("{:#010x}", self.pair_hash))
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PairKey {
    capability: CapabilityKey,
    concrete: TypeKey,
}

type BuildCell = Arc<OnceLock<&'static DispatchTable>>;

#[derive(Default)]
pub struct DispatchTableCache {
    buckets: RwLock<HashMap<u32, Vec<(PairKey, BuildCell)>>>,
    builds: AtomicUsize,
}

impl DispatchTableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table for `capability` on `concrete`, building it on first use.
    pub fn get(
        &self,
        capabilities: &CapabilityRegistry,
        capability: CapabilitySetId,
        concrete: &'static TypeDescriptor,
    ) -> Result<&'static DispatchTable> {
        let set = capabilities.set(capability)?;
        let hash = pair_hash(set.identity_hash(), concrete.identity_hash());
        let key = PairKey {
            capability: set.key(),
            concrete: concrete.key(),
        };

        if let Some(table) = self.published(hash, key) {
            trace!("dispatch table hit `{}` for `{}`", set.name(), concrete.name());
            return Ok(table);
        }

        let slots = capabilities.implementation(capability, concrete)?;
        let cell = self.reserve(hash, key);
        let table = *cell.get_or_init(|| self.build(set, concrete, hash, &slots));
        Ok(table)
    }

    fn published(&self, hash: u32, key: PairKey) -> Option<&'static DispatchTable> {
        let buckets = self.buckets.read();
        buckets
            .get(&hash)?
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, cell)| cell.get().copied())
    }

    fn reserve(&self, hash: u32, key: PairKey) -> BuildCell {
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(hash).or_default();
        if let Some((_, cell)) = bucket.iter().find(|(k, _)| *k == key) {
            return cell.clone();
        }
        if !bucket.is_empty() {
            trace!("pair hash {hash:#010x} shared by {} entries", bucket.len() + 1);
        }
        let cell = BuildCell::default();
        bucket.push((key, cell.clone()));
        cell
    }

    fn build(
        &self,
        capability: &'static CapabilitySet,
        concrete: &'static TypeDescriptor,
        pair_hash: u32,
        slots: &[MethodFn],
    ) -> &'static DispatchTable {
        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!(
            "building dispatch table `{}` for `{}` ({} slots)",
            capability.name(),
            concrete.name(),
            slots.len()
        );
        Box::leak(Box::new(DispatchTable {
            capability,
            concrete,
            pair_hash,
            slots: slots.into(),
        }))
    }

    /// Number of tables built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    /// Number of published tables.
    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .values()
            .flatten()
            .filter(|(_, cell)| cell.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
