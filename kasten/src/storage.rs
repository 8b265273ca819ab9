//! Box storage.
//!
//! Where a boxed value lives is decided once, at boxing time, and recorded
//! as a `StorageKind`:
//!
//! - zero sized values point at `zero_base()` and never allocate
//! - single byte host values point into a static table of all 256 bytes
//! - values fitting one word stay inline unless they must escape; pointer
//!   shaped values always stay inline, the pointee is not ours
//! - escaping all-zero host values share one zeroed buffer
//! - everything else is copied into an allocation owned by the box
use std::{
    alloc::{self, Layout},
    fmt,
    mem::MaybeUninit,
    ptr::{self, NonNull},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::trace;

use crate::{BoxError, Result, TypeDescriptor, WORD_SIZE};

pub const INLINE_SIZE: usize = WORD_SIZE;
const INLINE_ALIGN: usize = 8;

pub const ZERO_VALUE_SIZE: usize = 1024;
const ZERO_VALUE_ALIGN: usize = 16;

#[repr(C, align(16))]
struct Aligned<T>(T);

static ZERO_BASE: Aligned<u8> = Aligned(0);
static ZERO_VALUES: Aligned<[u8; ZERO_VALUE_SIZE]> = Aligned([0; ZERO_VALUE_SIZE]);
static STATIC_BYTES: [u8; 256] = static_bytes();

const fn static_bytes() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = i as u8;
        i += 1;
    }
    table
}

/// The address every zero sized box points at. Never dereferenced.
#[inline]
pub fn zero_base() -> NonNull<u8> {
    NonNull::from(&ZERO_BASE.0)
}

/// Whether the boxed value has to outlive the frame that boxes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Escape {
    /// may be stored inline in the box
    #[default]
    Local,
    /// needs storage of its own, independent of the box
    Heap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Inline,
    Allocated,
    ZeroBase,
    StaticByte,
    ZeroValue,
}

/// The memory collaborator boxes allocate from.
pub trait Allocator: Send + Sync + fmt::Debug {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same layout
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        // SAFETY: storage never requests zero sized layouts
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(BoxError::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: by contract ptr was allocated with layout
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Wraps another allocator and counts calls.
#[derive(Debug, Default)]
pub struct CountingAllocator<A = SystemAllocator> {
    inner: A,
    allocations: AtomicUsize,
    frees: AtomicUsize,
}

impl<A: Allocator> CountingAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }

    pub fn live(&self) -> usize {
        self.allocations().saturating_sub(self.frees())
    }
}

impl<A: Allocator> Allocator for CountingAllocator<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        let ptr = self.inner.allocate(layout)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        // SAFETY: forwarded contract
        unsafe { self.inner.free(ptr, layout) }
    }
}

/// How a runtime places values; built from its create info.
#[derive(Debug, Clone)]
pub(crate) struct StoragePolicy {
    pub allocator: Arc<dyn Allocator>,
    pub share_zero_values: bool,
    pub share_small_bytes: bool,
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct InlineSlot([MaybeUninit<u8>; INLINE_SIZE]);

struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
    allocator: Arc<dyn Allocator>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: allocated from this allocator with this layout, owned only
        // by this allocation
        unsafe { self.allocator.free(self.ptr, self.layout) }
    }
}

enum Repr {
    Inline(InlineSlot),
    Allocated(Allocation),
    Shared(StorageKind, NonNull<u8>),
}

pub struct Storage {
    repr: Repr,
}

impl Storage {
    /// Copy a value into box storage.
    /// # Safety
    /// `src` must be valid for reads of `ty.size()` bytes. `initialized`
    /// may only be set when all of those bytes are initialized.
    pub(crate) unsafe fn place(
        src: *const u8,
        ty: &TypeDescriptor,
        escape: Escape,
        initialized: bool,
        policy: &StoragePolicy,
    ) -> Result<Self> {
        let size = ty.size();

        if size == 0 {
            return Ok(Self::shared(StorageKind::ZeroBase, zero_base()));
        }

        if size == 1 && initialized && policy.share_small_bytes {
            // SAFETY: one initialized byte is readable
            let byte = unsafe { src.read() };
            let slot = NonNull::from(&STATIC_BYTES[byte as usize]);
            return Ok(Self::shared(StorageKind::StaticByte, slot));
        }

        let fits_inline = size <= INLINE_SIZE && ty.align() <= INLINE_ALIGN;
        if fits_inline && (escape == Escape::Local || ty.is_pointer_shaped()) {
            let mut slot = InlineSlot([MaybeUninit::uninit(); INLINE_SIZE]);
            // SAFETY: size fits the slot and src is readable for size bytes
            unsafe { ptr::copy_nonoverlapping(src, slot.0.as_mut_ptr().cast::<u8>(), size) };
            return Ok(Self {
                repr: Repr::Inline(slot),
            });
        }

        if initialized
            && policy.share_zero_values
            && size <= ZERO_VALUE_SIZE
            && ty.align() <= ZERO_VALUE_ALIGN
            // SAFETY: all size bytes are initialized
            && unsafe { is_zeroed(src, size) }
        {
            let zeroes = NonNull::from(&ZERO_VALUES.0).cast::<u8>();
            return Ok(Self::shared(StorageKind::ZeroValue, zeroes));
        }

        let layout = Layout::from_size_align(size, ty.align()).map_err(|_| {
            BoxError::OutOfMemory {
                size,
                align: ty.align(),
            }
        })?;
        let ptr = policy.allocator.allocate(layout)?;
        // SAFETY: fresh allocation of size bytes, src readable for size bytes
        unsafe { ptr::copy_nonoverlapping(src, ptr.as_ptr(), size) };
        trace!("allocated {size} bytes for `{}`", ty.name());
        Ok(Self {
            repr: Repr::Allocated(Allocation {
                ptr,
                layout,
                allocator: policy.allocator.clone(),
            }),
        })
    }

    #[inline]
    fn shared(kind: StorageKind, ptr: NonNull<u8>) -> Self {
        Self {
            repr: Repr::Shared(kind, ptr),
        }
    }

    #[inline]
    pub fn kind(&self) -> StorageKind {
        match &self.repr {
            Repr::Inline(_) => StorageKind::Inline,
            Repr::Allocated(_) => StorageKind::Allocated,
            Repr::Shared(kind, _) => *kind,
        }
    }

    /// Address of the stored value. For inline storage this points into the
    /// storage itself and moves with it.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        match &self.repr {
            Repr::Inline(slot) => NonNull::from(slot).cast(),
            Repr::Allocated(allocation) => allocation.ptr,
            Repr::Shared(_, ptr) => *ptr,
        }
    }

    /// Whether the value lives in memory exclusively owned by this storage.
    #[inline]
    pub fn is_owned(&self) -> bool {
        matches!(self.repr, Repr::Inline(_) | Repr::Allocated(_))
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("kind", &self.kind())
            .field("ptr", &self.as_ptr())
            .finish()
    }
}

/// # Safety
/// `src` must be valid for reads of `size` initialized bytes
unsafe fn is_zeroed(src: *const u8, size: usize) -> bool {
    // SAFETY: forwarded contract
    let bytes = unsafe { std::slice::from_raw_parts(src, size) };
    bytes.iter().all(|&b| b == 0)
}
