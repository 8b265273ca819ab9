use std::{any, marker::PhantomData, mem, ptr::NonNull, slice};

use crate::{BoxError, Result, TypeDescriptor};

/// A method entry point. The receiver is the boxed (or direct) value, the
/// arguments and the result travel as raw words.
pub type MethodFn = fn(Receiver<'_>, &[Word]) -> Word;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    I32,
    I64,
    U32,
    U64,
    F64,
    Bool,
    Ptr,
}

/// A 64 bit argument or return slot.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Word(u64);

impl Word {
    pub const ZERO: Word = Word(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    #[inline]
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    #[inline]
    pub const fn from_i32(value: i32) -> Self {
        Self::from_i64(value as i64)
    }

    /// Truncates to the low 32 bits.
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self.0 as i32
    }

    #[inline]
    pub const fn from_u32(value: u32) -> Self {
        Self(value as u64)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn from_f64(value: f64) -> Self {
        Self(value.to_bits())
    }

    #[inline]
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    #[inline]
    pub const fn from_bool(value: bool) -> Self {
        Self(value as u64)
    }

    #[inline]
    pub const fn as_bool(self) -> bool {
        self.0 != 0
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }
}

impl From<i32> for Word {
    fn from(value: i32) -> Self {
        Self::from_i32(value)
    }
}

impl From<i64> for Word {
    fn from(value: i64) -> Self {
        Self::from_i64(value)
    }
}

impl From<u32> for Word {
    fn from(value: u32) -> Self {
        Self::from_u32(value)
    }
}

impl From<u64> for Word {
    fn from(value: u64) -> Self {
        Self::from_raw(value)
    }
}

impl From<f64> for Word {
    fn from(value: f64) -> Self {
        Self::from_f64(value)
    }
}

impl From<bool> for Word {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    name: Box<str>,
    params: Box<[ValueKind]>,
    returns: Option<ValueKind>,
}

impl MethodSignature {
    pub fn new(name: &str, params: &[ValueKind], returns: Option<ValueKind>) -> Self {
        Self {
            name: name.into(),
            params: params.into(),
            returns,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    #[inline]
    pub fn returns(&self) -> Option<ValueKind> {
        self.returns
    }
}

/// Borrowed view of a value handed to a method.
///
/// Points either into a box's storage or at a caller-owned value for direct
/// calls. The concrete type is always known, so methods bound for one type
/// may read the receiver with `read_unchecked`.
#[derive(Debug, Clone, Copy)]
pub struct Receiver<'a> {
    data: NonNull<u8>,
    ty: &'static TypeDescriptor,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> Receiver<'a> {
    #[inline]
    pub(crate) fn new(data: NonNull<u8>, ty: &'static TypeDescriptor) -> Self {
        Self {
            data,
            ty,
            _marker: PhantomData,
        }
    }

    /// Receiver for an unboxed Rust value.
    pub fn of<T: Copy + 'static>(value: &'a T, ty: &'static TypeDescriptor) -> Result<Self> {
        if !ty.is_rust_type::<T>() {
            return Err(BoxError::TypeMismatch {
                expected: ty.name(),
                found: any::type_name::<T>(),
            });
        }
        Ok(Self::new(NonNull::from(value).cast(), ty))
    }

    /// Receiver for an unboxed host value given as its byte image.
    pub fn of_bytes(bytes: &'a [u8], ty: &'static TypeDescriptor) -> Result<Self> {
        if ty.rust_type().is_some() {
            return Err(BoxError::TypeMismatch {
                expected: ty.name(),
                found: "[u8]",
            });
        }
        if bytes.len() != ty.size() {
            return Err(BoxError::SizeMismatch {
                name: ty.name(),
                expected: ty.size(),
                actual: bytes.len(),
            });
        }
        Ok(Self::new(NonNull::from(bytes).cast(), ty))
    }

    #[inline]
    pub fn concrete_type(&self) -> &'static TypeDescriptor {
        self.ty
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Copy the value out if the receiver holds a `T`.
    #[inline]
    pub fn downcast<T: Copy + 'static>(&self) -> Option<T> {
        if !self.ty.is_rust_type::<T>() {
            return None;
        }
        // SAFETY: the descriptor was registered for T
        Some(unsafe { self.read_unchecked() })
    }

    /// Copy the value out without checking its type.
    /// # Safety
    /// the receiver must hold a `T`
    #[inline]
    pub unsafe fn read_unchecked<T: Copy>(&self) -> T {
        debug_assert_eq!(mem::size_of::<T>(), self.ty.size());
        // SAFETY: by contract the data is a T, storage may be unaligned
        unsafe { self.data.cast::<T>().as_ptr().read_unaligned() }
    }

    /// Byte image of a host value. `None` for Rust types, whose padding may
    /// be uninitialized.
    pub fn bytes(&self) -> Option<&'a [u8]> {
        if self.ty.rust_type().is_some() {
            return None;
        }
        if self.ty.size() == 0 {
            return Some(&[]);
        }
        // SAFETY: host values are stored as fully initialized byte images
        // of exactly `size` bytes
        Some(unsafe { slice::from_raw_parts(self.data.as_ptr(), self.ty.size()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PointerLayout, TypeRegistry};

    #[test]
    fn word_conversions() {
        assert_eq!(Word::from(-7i32).as_i32(), -7);
        assert_eq!(Word::from(-7i32).as_i64(), -7);
        assert_eq!(Word::from(u32::MAX).as_u32(), u32::MAX);
        assert_eq!(Word::from(1.5f64).as_f64(), 1.5);
        assert!(Word::from(true).as_bool());
        assert!(!Word::ZERO.as_bool());

        let value = 42u8;
        let word = Word::from_ptr(&value);
        assert_eq!(unsafe { *word.as_ptr::<u8>() }, 42);
    }

    #[test]
    fn receiver_downcast_checks_the_rust_type() {
        let registry = TypeRegistry::new();
        let ty = registry.register_type::<u32>("u32", PointerLayout::none()).unwrap();
        let value = 42u32;
        let receiver = Receiver::of(&value, ty).unwrap();
        assert_eq!(receiver.downcast::<u32>(), Some(42));
        assert_eq!(receiver.downcast::<i32>(), None);
        assert!(receiver.bytes().is_none());

        let err = Receiver::of(&7u16, ty).unwrap_err();
        assert!(matches!(err, BoxError::TypeMismatch { .. }));
    }

    #[test]
    fn receiver_over_host_bytes() {
        let registry = TypeRegistry::new();
        let ty = registry.register("rgb", 3, PointerLayout::none()).unwrap();
        let pixel = [1u8, 2, 3];
        let receiver = Receiver::of_bytes(&pixel, ty).unwrap();
        assert_eq!(receiver.bytes(), Some(&pixel[..]));

        let err = Receiver::of_bytes(&pixel[..2], ty).unwrap_err();
        assert_eq!(
            err,
            BoxError::SizeMismatch {
                name: "rgb",
                expected: 3,
                actual: 2
            }
        );
    }
}
