use std::{any, fmt, ptr};

use crate::{
    BoxError, CapabilitySet, DispatchTable, Receiver, Result, Storage, TypeDescriptor, Word,
    same_type,
};

/// Operations shared by both box kinds.
pub trait ValueBox {
    fn concrete_type(&self) -> &'static TypeDescriptor;

    fn storage(&self) -> &Storage;

    #[inline]
    fn receiver(&self) -> Receiver<'_> {
        Receiver::new(self.storage().as_ptr(), self.concrete_type())
    }

    #[inline]
    fn has_type(&self, expected: &TypeDescriptor) -> bool {
        same_type(self.concrete_type(), expected)
    }

    /// Copy the value out. Succeeds only if the box holds exactly
    /// `expected` and `expected` was registered for `T`.
    fn unbox<T: Copy + 'static>(&self, expected: &'static TypeDescriptor) -> Result<T> {
        let actual = self.concrete_type();
        if !same_type(actual, expected) {
            return Err(BoxError::TypeMismatch {
                expected: expected.name(),
                found: actual.name(),
            });
        }
        if !expected.is_rust_type::<T>() {
            return Err(BoxError::TypeMismatch {
                expected: expected.name(),
                found: any::type_name::<T>(),
            });
        }
        // SAFETY: the box holds an `expected`, which is a T
        Ok(unsafe { self.receiver().read_unchecked() })
    }

    /// Copy a host value's bytes into `out`.
    fn unbox_into(&self, expected: &'static TypeDescriptor, out: &mut [u8]) -> Result<()> {
        let actual = self.concrete_type();
        if !same_type(actual, expected) {
            return Err(BoxError::TypeMismatch {
                expected: expected.name(),
                found: actual.name(),
            });
        }
        let bytes = self.receiver().bytes().ok_or(BoxError::TypeMismatch {
            expected: expected.name(),
            found: "[u8]",
        })?;
        if out.len() != bytes.len() {
            return Err(BoxError::SizeMismatch {
                name: expected.name(),
                expected: bytes.len(),
                actual: out.len(),
            });
        }
        out.copy_from_slice(bytes);
        Ok(())
    }
}

/// A box that only knows its value's concrete type.
pub struct TypeBox {
    ty: &'static TypeDescriptor,
    data: Storage,
}

impl TypeBox {
    #[inline]
    pub(crate) fn new(ty: &'static TypeDescriptor, data: Storage) -> Self {
        Self { ty, data }
    }

    pub(crate) fn into_parts(self) -> (&'static TypeDescriptor, Storage) {
        (self.ty, self.data)
    }
}

impl ValueBox for TypeBox {
    #[inline]
    fn concrete_type(&self) -> &'static TypeDescriptor {
        self.ty
    }

    #[inline]
    fn storage(&self) -> &Storage {
        &self.data
    }
}

impl fmt::Debug for TypeBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeBox")
            .field("type", &self.ty.name())
            .field("data", &self.data)
            .finish()
    }
}

/// A box bound to a capability: its dispatch table plus the value.
pub struct CapabilityBox {
    table: &'static DispatchTable,
    data: Storage,
}

impl CapabilityBox {
    #[inline]
    pub(crate) fn new(table: &'static DispatchTable, data: Storage) -> Self {
        Self { table, data }
    }

    #[inline]
    pub fn table(&self) -> &'static DispatchTable {
        self.table
    }

    #[inline]
    pub fn capability(&self) -> &'static CapabilitySet {
        self.table.capability()
    }

    /// Call the method in `slot` with the boxed value as receiver.
    #[inline]
    pub fn invoke(&self, slot: usize, args: &[Word]) -> Result<Word> {
        let method = self.table.method(slot).ok_or(BoxError::SlotOutOfRange {
            slot,
            slots: self.table.len(),
        })?;
        Ok(method(self.receiver(), args))
    }

    /// Resolves the slot by name first; prefer `invoke` on hot paths.
    pub fn invoke_named(&self, method: &str, args: &[Word]) -> Result<Word> {
        let capability = self.capability();
        let slot = capability
            .slot_index(method)
            .ok_or_else(|| BoxError::UnknownMethod {
                owner: capability.name().to_owned(),
                method: method.to_owned(),
            })?;
        self.invoke(slot, args)
    }

    /// Drop the table, keep the value.
    pub fn into_type_box(self) -> TypeBox {
        TypeBox::new(self.table.concrete_type(), self.data)
    }

    pub(crate) fn into_parts(self) -> (&'static DispatchTable, Storage) {
        (self.table, self.data)
    }
}

impl ValueBox for CapabilityBox {
    #[inline]
    fn concrete_type(&self) -> &'static TypeDescriptor {
        self.table.concrete_type()
    }

    #[inline]
    fn storage(&self) -> &Storage {
        &self.data
    }
}

impl fmt::Debug for CapabilityBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityBox")
            .field("capability", &self.table.capability().name())
            .field("type", &self.table.concrete_type().name())
            .field("data", &self.data)
            .finish()
    }
}

/// Whether two boxes share the same storage address, as zero sized and
/// shared small values do.
#[inline]
pub fn same_storage(a: &impl ValueBox, b: &impl ValueBox) -> bool {
    ptr::eq(a.storage().as_ptr().as_ptr(), b.storage().as_ptr().as_ptr())
}
