//! Type identity.
//!
//! Every concrete type gets exactly one `TypeDescriptor`, leaked on
//! registration and handed out as `&'static`. Identity is the address of
//! that descriptor; the 32 bit identity hash only ever serves as a cheap
//! pre-filter in front of an address compare.
use std::{
    any::TypeId,
    collections::HashMap,
    hash::{BuildHasher, Hash, Hasher},
    mem, ptr,
};

use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::RwLock;

use crate::{BoxError, Result};

pub const WORD_SIZE: usize = mem::size_of::<usize>();

// fixed seeds so identity hashes are reproducible for a given build
const HASH_SEEDS: [u64; 4] = [
    0x6b65_7474_655f_7479,
    0x7065_5f69_6465_6e74,
    0x9e37_79b9_7f4a_7c15,
    0x2545_f491_4f6c_dd1d,
];

pub(crate) fn identity_hash_of_parts(parts: impl Hash) -> u32 {
    let state = ahash::RandomState::with_seeds(
        HASH_SEEDS[0],
        HASH_SEEDS[1],
        HASH_SEEDS[2],
        HASH_SEEDS[3],
    );
    let mut hasher = state.build_hasher();
    parts.hash(&mut hasher);
    let hash = hasher.finish();
    (hash ^ (hash >> 32)) as u32
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u8 {
        const ZERO_SIZED = 1 << 0;
        const HAS_POINTERS = 1 << 1;
        /// exactly one word which holds a reference
        const POINTER_SHAPED = 1 << 2;
    }
}

/// Which words of a value hold references.
///
/// Not interpreted by the runtime, only carried along for an external
/// collector. Trailing non-pointer words are trimmed so equal layouts
/// compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PointerLayout {
    words: Box<[bool]>,
}

impl PointerLayout {
    pub fn none() -> Self {
        Self::default()
    }

    /// A single reference word.
    pub fn pointer() -> Self {
        Self::from_words([true])
    }

    pub fn from_words(words: impl IntoIterator<Item = bool>) -> Self {
        let mut words: Vec<bool> = words.into_iter().collect();
        while words.last() == Some(&false) {
            words.pop();
        }
        Self {
            words: words.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn words(&self) -> &[bool] {
        &self.words
    }

    #[inline]
    pub fn is_pointer(&self, word: usize) -> bool {
        self.words.get(word).copied().unwrap_or(false)
    }

    #[inline]
    pub fn has_pointers(&self) -> bool {
        !self.words.is_empty()
    }

    /// Length of the prefix that contains all reference words, in bytes.
    pub fn pointer_bytes(&self) -> usize {
        self.words.len() * WORD_SIZE
    }
}

/// Identity key derived from a descriptor's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey(usize);

#[derive(Debug)]
pub struct TypeDescriptor {
    name: Box<str>,
    size: usize,
    align: usize,
    layout: PointerLayout,
    hash: u32,
    flags: TypeFlags,
    rust_type: Option<TypeId>,
}

impl TypeDescriptor {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn pointer_layout(&self) -> &PointerLayout {
        &self.layout
    }

    #[inline]
    pub fn identity_hash(&self) -> u32 {
        self.hash
    }

    #[inline]
    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    #[inline]
    pub fn is_zero_sized(&self) -> bool {
        self.flags.contains(TypeFlags::ZERO_SIZED)
    }

    #[inline]
    pub fn is_pointer_shaped(&self) -> bool {
        self.flags.contains(TypeFlags::POINTER_SHAPED)
    }

    /// The Rust type this descriptor was registered for, `None` for types
    /// registered from a host layout.
    #[inline]
    pub fn rust_type(&self) -> Option<TypeId> {
        self.rust_type
    }

    #[inline]
    pub fn is_rust_type<T: 'static>(&self) -> bool {
        self.rust_type == Some(TypeId::of::<T>())
    }

    #[inline]
    pub fn key(&self) -> TypeKey {
        TypeKey(self as *const Self as usize)
    }

    fn same_signature(&self, other: &Self) -> bool {
        self.size == other.size
            && self.align == other.align
            && self.layout == other.layout
            && self.hash == other.hash
            && self.rust_type == other.rust_type
    }
}

/// Pointer identity. Equal hashes mean nothing on their own.
#[inline]
pub fn same_type(a: &TypeDescriptor, b: &TypeDescriptor) -> bool {
    ptr::eq(a, b)
}

#[inline]
pub fn identity_hash_of(ty: &TypeDescriptor) -> u32 {
    ty.identity_hash()
}

/// Everything needed to register a type.
#[derive(Debug, Clone)]
pub struct TypeSpec {
    name: String,
    size: usize,
    align: Option<usize>,
    layout: PointerLayout,
    rust_type: Option<TypeId>,
    hash: Option<u32>,
}

impl TypeSpec {
    /// A host type described only by its byte size.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            align: None,
            layout: PointerLayout::none(),
            rust_type: None,
            hash: None,
        }
    }

    /// A Rust type; size and alignment come from `T`.
    pub fn of<T: Copy + 'static>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: mem::size_of::<T>(),
            align: Some(mem::align_of::<T>()),
            layout: PointerLayout::none(),
            rust_type: Some(TypeId::of::<T>()),
            hash: None,
        }
    }

    pub fn layout(mut self, layout: PointerLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn align(mut self, align: usize) -> Self {
        self.align = Some(align);
        self
    }

    /// Use a hash precomputed by the host instead of deriving one.
    pub fn identity_hash(mut self, hash: u32) -> Self {
        self.hash = Some(hash);
        self
    }

    fn build(self) -> Result<TypeDescriptor> {
        let words = self.size.div_ceil(WORD_SIZE);
        if self.layout.words().len() > words {
            return Err(BoxError::InvalidLayout {
                name: self.name,
                reason: "pointer layout covers more words than the type",
            });
        }

        let align = self.align.unwrap_or_else(|| natural_align(self.size));
        if !align.is_power_of_two() {
            return Err(BoxError::InvalidLayout {
                name: self.name,
                reason: "alignment must be a power of two",
            });
        }

        let hash = self.hash.unwrap_or_else(|| {
            identity_hash_of_parts((&self.name, self.size, align, &self.layout))
        });

        let mut flags = TypeFlags::empty();
        if self.size == 0 {
            flags |= TypeFlags::ZERO_SIZED;
        }
        if self.layout.has_pointers() {
            flags |= TypeFlags::HAS_POINTERS;
        }
        if self.size == WORD_SIZE && self.layout == PointerLayout::pointer() {
            flags |= TypeFlags::POINTER_SHAPED;
        }

        Ok(TypeDescriptor {
            name: self.name.into_boxed_str(),
            size: self.size,
            align,
            layout: self.layout,
            hash,
            flags,
            rust_type: self.rust_type,
        })
    }
}

/// Largest power of two dividing `size`, capped at a word.
fn natural_align(size: usize) -> usize {
    if size == 0 {
        return 1;
    }
    (size & size.wrapping_neg()).min(WORD_SIZE)
}

pub struct TypeRegistry {
    by_name: RwLock<HashMap<Box<str>, &'static TypeDescriptor>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            by_name: RwLock::new(HashMap::new()),
        }
    }

    /// Register a host type.
    pub fn register(
        &self,
        name: &str,
        size: usize,
        layout: PointerLayout,
    ) -> Result<&'static TypeDescriptor> {
        self.register_spec(TypeSpec::new(name, size).layout(layout))
    }

    /// Register a Rust type.
    pub fn register_type<T: Copy + 'static>(
        &self,
        name: &str,
        layout: PointerLayout,
    ) -> Result<&'static TypeDescriptor> {
        self.register_spec(TypeSpec::of::<T>(name).layout(layout))
    }

    /// Registering the same name with the same signature again returns the
    /// descriptor from the first registration.
    pub fn register_spec(&self, spec: TypeSpec) -> Result<&'static TypeDescriptor> {
        let candidate = spec.build()?;

        let mut by_name = self.by_name.write();
        if let Some(&existing) = by_name.get(candidate.name()) {
            if existing.same_signature(&candidate) {
                return Ok(existing);
            }
            warn!("conflicting registration for type `{}`", existing.name());
            return Err(BoxError::DuplicateConflict {
                name: candidate.name().to_owned(),
            });
        }

        let descriptor: &'static TypeDescriptor = Box::leak(Box::new(candidate));
        by_name.insert(descriptor.name().into(), descriptor);
        debug!(
            "registered type `{}` (size {}, align {}, hash {:#010x})",
            descriptor.name(),
            descriptor.size(),
            descriptor.align(),
            descriptor.identity_hash()
        );
        Ok(descriptor)
    }

    pub fn lookup(&self, name: &str) -> Option<&'static TypeDescriptor> {
        self.by_name.read().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = TypeRegistry::new();
        let a = registry.register("Point", 8, PointerLayout::none()).unwrap();
        let b = registry.register("Point", 8, PointerLayout::none()).unwrap();
        assert!(same_type(a, b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn trailing_non_pointer_words_do_not_change_the_signature() {
        let registry = TypeRegistry::new();
        let a = registry.register("Pair", 16, PointerLayout::none()).unwrap();
        let b = registry
            .register("Pair", 16, PointerLayout::from_words([false, false]))
            .unwrap();
        assert!(same_type(a, b));
    }

    #[test]
    fn different_layout_under_same_name_conflicts() {
        let registry = TypeRegistry::new();
        registry.register("Node", 16, PointerLayout::none()).unwrap();
        let err = registry
            .register("Node", 16, PointerLayout::from_words([true, false]))
            .unwrap_err();
        assert_eq!(
            err,
            BoxError::DuplicateConflict {
                name: "Node".into()
            }
        );

        let err = registry.register("Node", 24, PointerLayout::none()).unwrap_err();
        assert!(matches!(err, BoxError::DuplicateConflict { .. }));
    }

    #[test]
    fn typed_and_host_registrations_do_not_mix() {
        let registry = TypeRegistry::new();
        registry.register_type::<Point>("Point", PointerLayout::none()).unwrap();
        let err = registry.register("Point", 8, PointerLayout::none()).unwrap_err();
        assert!(matches!(err, BoxError::DuplicateConflict { .. }));
    }

    #[test]
    fn typed_registration_takes_size_from_the_type() {
        let registry = TypeRegistry::new();
        let point = registry.register_type::<Point>("Point", PointerLayout::none()).unwrap();
        assert_eq!(point.size(), 8);
        assert_eq!(point.align(), 4);
        assert!(point.is_rust_type::<Point>());
        assert!(!point.is_rust_type::<u64>());
        assert!(!point.flags().contains(TypeFlags::HAS_POINTERS));
    }

    #[test]
    fn identity_hash_is_deterministic() {
        let first = TypeRegistry::new();
        let second = TypeRegistry::new();
        let a = first.register("u32", 4, PointerLayout::none()).unwrap();
        let b = second.register("u32", 4, PointerLayout::none()).unwrap();
        assert_eq!(identity_hash_of(a), identity_hash_of(b));
        // separate registries hand out separate identities
        assert!(!same_type(a, b));
    }

    #[test]
    fn same_hash_is_not_same_type() {
        let registry = TypeRegistry::new();
        let a = registry
            .register_spec(TypeSpec::new("A", 4).identity_hash(0xdead_beef))
            .unwrap();
        let b = registry
            .register_spec(TypeSpec::new("B", 4).identity_hash(0xdead_beef))
            .unwrap();
        assert_eq!(a.identity_hash(), b.identity_hash());
        assert!(!same_type(a, b));
        assert!(same_type(a, a));
    }

    #[test]
    fn layout_larger_than_type_is_rejected() {
        let registry = TypeRegistry::new();
        let err = registry
            .register("Tiny", 4, PointerLayout::from_words([false, true]))
            .unwrap_err();
        assert!(matches!(err, BoxError::InvalidLayout { .. }));
        assert!(registry.lookup("Tiny").is_none());
    }

    #[test]
    fn bad_alignment_is_rejected() {
        let registry = TypeRegistry::new();
        let err = registry
            .register_spec(TypeSpec::new("Odd", 6).align(3))
            .unwrap_err();
        assert!(matches!(err, BoxError::InvalidLayout { .. }));
    }

    #[test]
    fn flags_follow_size_and_layout() {
        let registry = TypeRegistry::new();
        let unit = registry.register("unit", 0, PointerLayout::none()).unwrap();
        assert!(unit.is_zero_sized());
        assert_eq!(unit.align(), 1);

        let reference = registry.register("&Calc", WORD_SIZE, PointerLayout::pointer()).unwrap();
        assert!(reference.is_pointer_shaped());
        assert!(reference.flags().contains(TypeFlags::HAS_POINTERS));

        let slice = registry
            .register("[]u8", 3 * WORD_SIZE, PointerLayout::pointer())
            .unwrap();
        assert!(!slice.is_pointer_shaped());
        assert_eq!(slice.pointer_layout().pointer_bytes(), WORD_SIZE);
        assert!(slice.pointer_layout().is_pointer(0));
        assert!(!slice.pointer_layout().is_pointer(1));
        assert!(!slice.pointer_layout().is_pointer(7));
    }

    #[test]
    fn natural_alignment() {
        assert_eq!(natural_align(0), 1);
        assert_eq!(natural_align(1), 1);
        assert_eq!(natural_align(3), 1);
        assert_eq!(natural_align(12), 4);
        assert_eq!(natural_align(64), WORD_SIZE);
    }
}
