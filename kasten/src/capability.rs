use std::{collections::HashMap, sync::Arc};

use log::{debug, warn};
use parking_lot::RwLock;

use crate::{
    BoxError, MethodFn, MethodSignature, Result, TypeDescriptor, TypeKey,
    types::identity_hash_of_parts,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilitySetId(u32);

impl CapabilitySetId {
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identity key derived from a capability set's address. Unlike
/// `CapabilitySetId` it is unique across registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityKey(usize);

/// A named, ordered list of method slots.
#[derive(Debug)]
pub struct CapabilitySet {
    id: CapabilitySetId,
    name: Box<str>,
    hash: u32,
    slots: Box<[MethodSignature]>,
    /// capabilities this one was composed from, empty for plain ones
    parts: Box<[CapabilitySetId]>,
}

impl CapabilitySet {
    #[inline]
    pub fn id(&self) -> CapabilitySetId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn identity_hash(&self) -> u32 {
        self.hash
    }

    #[inline]
    pub fn slots(&self) -> &[MethodSignature] {
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
    pub fn parts(&self) -> &[CapabilitySetId] {
        &self.parts
    }

    #[inline]
    pub fn key(&self) -> CapabilityKey {
        CapabilityKey(self as *const Self as usize)
    }

    pub fn slot_index(&self, method: &str) -> Option<usize> {
        self.slots.iter().position(|slot| slot.name() == method)
    }
}

/// Method implementations for one `implement` call, keyed by method name.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: Vec<(Box<str>, MethodFn)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, method: &str, f: MethodFn) -> Self {
        self.entries.push((method.into(), f));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, method: &str) -> Option<MethodFn> {
        self.entries
            .iter()
            .find(|(name, _)| &**name == method)
            .map(|&(_, f)| f)
    }
}

struct MethodEntry {
    signature: MethodSignature,
    method: MethodFn,
}

#[derive(Default)]
struct CapabilityTable {
    sets: Vec<&'static CapabilitySet>,
    by_name: HashMap<Box<str>, CapabilitySetId>,
    /// every method a type has bound so far, across all capabilities
    method_sets: HashMap<TypeKey, HashMap<Box<str>, MethodEntry>>,
    /// resolved slot functions in slot order
    implementations: HashMap<(CapabilitySetId, TypeKey), Arc<[MethodFn]>>,
}

impl CapabilityTable {
    fn set(&self, id: CapabilitySetId) -> Result<&'static CapabilitySet> {
        self.sets
            .get(id.index())
            .copied()
            .ok_or(BoxError::UnknownCapability(id.raw()))
    }

    fn define(
        &mut self,
        name: &str,
        slots: Vec<MethodSignature>,
        parts: Vec<CapabilitySetId>,
    ) -> Result<CapabilitySetId> {
        if let Some(&id) = self.by_name.get(name) {
            let existing = self.sets[id.index()];
            if *existing.slots == *slots && *existing.parts == *parts {
                return Ok(id);
            }
            warn!("conflicting declaration for capability `{name}`");
            return Err(BoxError::CapabilityRedefinition { name: name.to_owned() });
        }

        let id = CapabilitySetId(self.sets.len() as u32);
        let hash = identity_hash_of_parts((name, &slots));
        let set: &'static CapabilitySet = Box::leak(Box::new(CapabilitySet {
            id,
            name: name.into(),
            hash,
            slots: slots.into_boxed_slice(),
            parts: parts.into_boxed_slice(),
        }));
        self.sets.push(set);
        self.by_name.insert(name.into(), id);
        debug!(
            "declared capability `{}` with {} slots (hash {:#010x})",
            set.name(),
            set.len(),
            set.identity_hash()
        );
        Ok(id)
    }
}

/// Capability sets and the method implementations types register for them.
pub struct CapabilityRegistry {
    inner: RwLock<CapabilityTable>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CapabilityTable::default()),
        }
    }

    /// Declare a capability. Declaring the same name with the same slots
    /// again returns the existing id.
    pub fn declare(
        &self,
        name: &str,
        slots: Vec<MethodSignature>,
    ) -> Result<CapabilitySetId> {
        for (i, slot) in slots.iter().enumerate() {
            if slots[..i].iter().any(|prev| prev.name() == slot.name()) {
                return Err(BoxError::CapabilityRedefinition { name: name.to_owned() });
            }
        }
        self.inner.write().define(name, slots, Vec::new())
    }

    /// Declare a capability embedding `parts`: their slots in order, identical
    /// signatures merged.
    pub fn declare_compound(
        &self,
        name: &str,
        parts: &[CapabilitySetId],
    ) -> Result<CapabilitySetId> {
        let mut table = self.inner.write();

        let mut slots: Vec<MethodSignature> = Vec::new();
        for &part in parts {
            for slot in table.set(part)?.slots() {
                match slots.iter().find(|s| s.name() == slot.name()) {
                    Some(existing) if existing == slot => {}
                    Some(_) => {
                        warn!(
                            "capability `{name}` embeds conflicting signatures for `{}`",
                            slot.name()
                        );
                        return Err(BoxError::CapabilityRedefinition {
                            name: name.to_owned(),
                        });
                    }
                    None => slots.push(slot.clone()),
                }
            }
        }

        table.define(name, slots, parts.to_vec())
    }

    /// Register the implementation of `capability` for `ty`.
    ///
    /// Every slot must resolve, either through `bindings` or through a method
    /// the type already bound for another capability with the same
    /// signature. A method name can only be bound once per type. Nothing is
    /// recorded when the call fails.
    pub fn implement(
        &self,
        ty: &'static TypeDescriptor,
        capability: CapabilitySetId,
        bindings: Bindings,
    ) -> Result<()> {
        let mut table = self.inner.write();
        let set = table.set(capability)?;
        let key = ty.key();

        let known = table.method_sets.get(&key);
        for (i, (method, _)) in bindings.entries.iter().enumerate() {
            if set.slot_index(method).is_none() {
                return Err(BoxError::UnknownMethod {
                    owner: set.name().to_owned(),
                    method: method.to_string(),
                });
            }
            let repeated = bindings.entries[..i].iter().any(|(prev, _)| prev == method);
            if repeated || known.is_some_and(|methods| methods.contains_key(method)) {
                warn!("`{}.{method}` is already bound", ty.name());
                return Err(BoxError::DuplicateConflict {
                    name: format!("{}.{method}", ty.name()),
                });
            }
        }

        let mut resolved = Vec::with_capacity(set.len());
        for slot in set.slots() {
            let method = match bindings.get(slot.name()) {
                Some(f) => f,
                None => known
                    .and_then(|methods| methods.get(slot.name()))
                    .filter(|entry| entry.signature == *slot)
                    .map(|entry| entry.method)
                    .ok_or_else(|| BoxError::CapabilityNotImplemented {
                        capability: set.name().to_owned(),
                        type_name: ty.name().to_owned(),
                        missing: Some(slot.name().to_owned()),
                    })?,
            };
            resolved.push(method);
        }

        let methods = table.method_sets.entry(key).or_default();
        for (method, f) in bindings.entries {
            if let Some(index) = set.slot_index(&method) {
                methods.insert(
                    method,
                    MethodEntry {
                        signature: set.slots()[index].clone(),
                        method: f,
                    },
                );
            }
        }
        table.implementations.insert((capability, key), resolved.into());
        debug!("`{}` implements `{}`", ty.name(), set.name());
        Ok(())
    }

    pub fn set(&self, id: CapabilitySetId) -> Result<&'static CapabilitySet> {
        self.inner.read().set(id)
    }

    pub fn lookup(&self, name: &str) -> Option<CapabilitySetId> {
        self.inner.read().by_name.get(name).copied()
    }

    pub fn implements(&self, ty: &TypeDescriptor, capability: CapabilitySetId) -> bool {
        self.inner
            .read()
            .implementations
            .contains_key(&(capability, ty.key()))
    }

    /// Slot functions in slot order, as recorded by `implement`.
    pub fn implementation(
        &self,
        capability: CapabilitySetId,
        ty: &TypeDescriptor,
    ) -> Result<Arc<[MethodFn]>> {
        let table = self.inner.read();
        if let Some(slots) = table.implementations.get(&(capability, ty.key())) {
            return Ok(slots.clone());
        }
        let set = table.set(capability)?;
        Err(BoxError::CapabilityNotImplemented {
            capability: set.name().to_owned(),
            type_name: ty.name().to_owned(),
            missing: None,
        })
    }

    /// A method bound for `ty` under any capability, for direct calls.
    pub fn method(&self, ty: &TypeDescriptor, name: &str) -> Result<MethodFn> {
        self.inner
            .read()
            .method_sets
            .get(&ty.key())
            .and_then(|methods| methods.get(name))
            .map(|entry| entry.method)
            .ok_or_else(|| BoxError::UnknownMethod {
                owner: ty.name().to_owned(),
                method: name.to_owned(),
            })
    }

    pub fn len(&self) -> usize {
        self.inner.read().sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
