use std::{any, mem, sync::Arc};

use log::debug;

use crate::{
    Allocator, Bindings, BoxError, CapabilityBox, CapabilityRegistry, CapabilitySetId,
    DispatchTable, DispatchTableCache, Escape, MethodFn, MethodSignature, PointerLayout, Result,
    Storage, StoragePolicy, SystemAllocator, TypeBox, TypeDescriptor, TypeRegistry,
};

#[derive(Debug, Clone)]
pub struct RuntimeCreateInfo {
    /// where escaping values are copied to, the system allocator if unset
    pub allocator: Option<Arc<dyn Allocator>>,
    /// let escaping all-zero host values share one static buffer
    pub share_zero_values: bool,
    /// box single byte host values as pointers into a static table
    pub share_small_bytes: bool,
}

impl Default for RuntimeCreateInfo {
    fn default() -> Self {
        Self {
            allocator: None,
            share_zero_values: true,
            share_small_bytes: true,
        }
    }
}

/// Registries, dispatch cache and allocator bundled together. Shareable
/// across threads; boxes themselves stay on the thread that made them.
pub struct Runtime {
    pub types: TypeRegistry,
    pub capabilities: CapabilityRegistry,
    pub tables: DispatchTableCache,
    policy: StoragePolicy,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Self {
        let allocator = info
            .allocator
            .unwrap_or_else(|| Arc::new(SystemAllocator));
        debug!(
            "runtime created (allocator {allocator:?}, share zero values {}, share small bytes {})",
            info.share_zero_values, info.share_small_bytes
        );
        Self {
            types: TypeRegistry::new(),
            capabilities: CapabilityRegistry::new(),
            tables: DispatchTableCache::new(),
            policy: StoragePolicy {
                allocator,
                share_zero_values: info.share_zero_values,
                share_small_bytes: info.share_small_bytes,
            },
        }
    }

    #[inline]
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.policy.allocator
    }

    pub fn register(
        &self,
        name: &str,
        size: usize,
        layout: PointerLayout,
    ) -> Result<&'static TypeDescriptor> {
        self.types.register(name, size, layout)
    }

    pub fn register_type<T: Copy + 'static>(
        &self,
        name: &str,
        layout: PointerLayout,
    ) -> Result<&'static TypeDescriptor> {
        self.types.register_type::<T>(name, layout)
    }

    pub fn declare(&self, name: &str, slots: Vec<MethodSignature>) -> Result<CapabilitySetId> {
        self.capabilities.declare(name, slots)
    }

    pub fn declare_compound(
        &self,
        name: &str,
        parts: &[CapabilitySetId],
    ) -> Result<CapabilitySetId> {
        self.capabilities.declare_compound(name, parts)
    }

    pub fn implement(
        &self,
        ty: &'static TypeDescriptor,
        capability: CapabilitySetId,
        bindings: Bindings,
    ) -> Result<()> {
        self.capabilities.implement(ty, capability, bindings)
    }

    #[inline]
    pub fn table(
        &self,
        capability: CapabilitySetId,
        ty: &'static TypeDescriptor,
    ) -> Result<&'static DispatchTable> {
        self.tables.get(&self.capabilities, capability, ty)
    }

    /// Resolve a method once for calls on unboxed values.
    pub fn direct_method(&self, ty: &TypeDescriptor, name: &str) -> Result<MethodFn> {
        self.capabilities.method(ty, name)
    }

    pub fn box_value<T: Copy + 'static>(
        &self,
        value: &T,
        ty: &'static TypeDescriptor,
        escape: Escape,
    ) -> Result<TypeBox> {
        let data = self.place_value(value, ty, escape)?;
        Ok(TypeBox::new(ty, data))
    }

    /// Box a host value from its byte image.
    pub fn box_bytes(
        &self,
        bytes: &[u8],
        ty: &'static TypeDescriptor,
        escape: Escape,
    ) -> Result<TypeBox> {
        let data = self.place_bytes(bytes, ty, escape)?;
        Ok(TypeBox::new(ty, data))
    }

    pub fn box_capability<T: Copy + 'static>(
        &self,
        value: &T,
        ty: &'static TypeDescriptor,
        capability: CapabilitySetId,
        escape: Escape,
    ) -> Result<CapabilityBox> {
        let table = self.table(capability, ty)?;
        let data = self.place_value(value, ty, escape)?;
        Ok(CapabilityBox::new(table, data))
    }

    pub fn box_capability_bytes(
        &self,
        bytes: &[u8],
        ty: &'static TypeDescriptor,
        capability: CapabilitySetId,
        escape: Escape,
    ) -> Result<CapabilityBox> {
        let table = self.table(capability, ty)?;
        let data = self.place_bytes(bytes, ty, escape)?;
        Ok(CapabilityBox::new(table, data))
    }

    /// Bind a type-only box to `capability`. On failure the box is handed
    /// back with the error.
    pub fn assert_capability(
        &self,
        value: TypeBox,
        capability: CapabilitySetId,
    ) -> Result<CapabilityBox, (TypeBox, BoxError)> {
        let (ty, data) = value.into_parts();
        match self.table(capability, ty) {
            Ok(table) => Ok(CapabilityBox::new(table, data)),
            Err(err) => Err((TypeBox::new(ty, data), err)),
        }
    }

    /// Rebind a capability box to another capability of the same value.
    pub fn convert(
        &self,
        value: CapabilityBox,
        capability: CapabilitySetId,
    ) -> Result<CapabilityBox, (CapabilityBox, BoxError)> {
        let (from, data) = value.into_parts();
        match self.table(capability, from.concrete_type()) {
            Ok(table) => Ok(CapabilityBox::new(table, data)),
            Err(err) => Err((CapabilityBox::new(from, data), err)),
        }
    }

    fn place_value<T: Copy + 'static>(
        &self,
        value: &T,
        ty: &'static TypeDescriptor,
        escape: Escape,
    ) -> Result<Storage> {
        if !ty.is_rust_type::<T>() {
            return Err(BoxError::TypeMismatch {
                expected: ty.name(),
                found: any::type_name::<T>(),
            });
        }
        debug_assert_eq!(ty.size(), mem::size_of::<T>());
        // SAFETY: `value` is readable for size_of::<T>() == ty.size() bytes.
        // Padding may be uninitialized, so the bytes are not inspected.
        unsafe {
            Storage::place(
                (value as *const T).cast(),
                ty,
                escape,
                false,
                &self.policy,
            )
        }
    }

    fn place_bytes(
        &self,
        bytes: &[u8],
        ty: &'static TypeDescriptor,
        escape: Escape,
    ) -> Result<Storage> {
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
        // SAFETY: `bytes` is an initialized slice of exactly ty.size() bytes
        unsafe { Storage::place(bytes.as_ptr(), ty, escape, true, &self.policy) }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeCreateInfo::default())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;
    use crate::{
        CountingAllocator, Receiver, StorageKind, ValueBox, ValueKind, Word, same_storage,
    };

    fn add(receiver: Receiver<'_>, args: &[Word]) -> Word {
        let base = receiver.downcast::<i64>().unwrap_or(0);
        Word::from(base + args[0].as_i64())
    }

    fn sub(receiver: Receiver<'_>, args: &[Word]) -> Word {
        let base = receiver.downcast::<i64>().unwrap_or(0);
        Word::from(base - args[0].as_i64())
    }

    fn counted() -> (Runtime, Arc<CountingAllocator>) {
        let counter = Arc::new(CountingAllocator::new(SystemAllocator));
        let runtime = Runtime::new(RuntimeCreateInfo {
            allocator: Some(counter.clone()),
            ..Default::default()
        });
        (runtime, counter)
    }

    fn adder_subber(runtime: &Runtime) -> (CapabilitySetId, CapabilitySetId) {
        let adder = runtime
            .declare(
                "Adder",
                vec![MethodSignature::new("add", &[ValueKind::I64], Some(ValueKind::I64))],
            )
            .unwrap();
        let subber = runtime
            .declare(
                "Subber",
                vec![MethodSignature::new("sub", &[ValueKind::I64], Some(ValueKind::I64))],
            )
            .unwrap();
        (adder, subber)
    }

    #[test]
    fn boxing_checks_the_descriptor_kind() {
        let runtime = Runtime::default();
        let typed = runtime.register_type::<u32>("u32", PointerLayout::none()).unwrap();
        let host = runtime.register("word", 4, PointerLayout::none()).unwrap();

        assert!(matches!(
            runtime.box_value(&1u16, typed, Escape::Local),
            Err(BoxError::TypeMismatch { .. })
        ));
        assert!(matches!(
            runtime.box_bytes(&[0; 4], typed, Escape::Local),
            Err(BoxError::TypeMismatch { .. })
        ));
        assert!(matches!(
            runtime.box_value(&1u32, host, Escape::Local),
            Err(BoxError::TypeMismatch { .. })
        ));
        assert_eq!(
            runtime.box_bytes(&[0; 3], host, Escape::Local).unwrap_err(),
            BoxError::SizeMismatch {
                name: "word",
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn zero_sized_values_never_allocate() {
        #[derive(Clone, Copy)]
        struct Unit;
        #[derive(Clone, Copy)]
        struct Empty([u64; 0]);

        let (runtime, counter) = counted();
        let unit = runtime.register_type::<Unit>("Unit", PointerLayout::none()).unwrap();
        let empty = runtime.register_type::<Empty>("Empty", PointerLayout::none()).unwrap();

        let a = runtime.box_value(&Unit, unit, Escape::Heap).unwrap();
        let b = runtime.box_value(&Empty([]), empty, Escape::Heap).unwrap();
        assert_eq!(a.storage().kind(), StorageKind::ZeroBase);
        assert!(same_storage(&a, &b));
        assert_eq!(counter.allocations(), 0);
    }

    #[test]
    fn escaping_values_are_freed_with_their_box() {
        let (runtime, counter) = counted();
        let triple = runtime
            .register_type::<[u64; 3]>("Triple", PointerLayout::none())
            .unwrap();

        let boxed = runtime.box_value(&[1u64, 2, 3], triple, Escape::Local).unwrap();
        assert_eq!(boxed.storage().kind(), StorageKind::Allocated);
        assert_eq!(boxed.unbox::<[u64; 3]>(triple).unwrap(), [1, 2, 3]);
        assert_eq!(counter.live(), 1);
        drop(boxed);
        assert_eq!(counter.live(), 0);
    }

    #[test]
    fn failed_capability_boxing_does_not_allocate() {
        let (runtime, counter) = counted();
        let triple = runtime
            .register_type::<[u64; 3]>("Triple", PointerLayout::none())
            .unwrap();
        let (adder, _) = adder_subber(&runtime);

        let err = runtime
            .box_capability(&[0u64; 3], triple, adder, Escape::Heap)
            .unwrap_err();
        assert!(matches!(err, BoxError::CapabilityNotImplemented { .. }));
        assert_eq!(counter.allocations(), 0);
    }

    #[test]
    fn compound_capability_through_the_method_set() {
        let runtime = Runtime::default();
        let int = runtime.register_type::<i64>("int", PointerLayout::none()).unwrap();
        let (adder, subber) = adder_subber(&runtime);
        let mather = runtime.declare_compound("Mather", &[adder, subber]).unwrap();

        runtime.implement(int, adder, Bindings::new().bind("add", add)).unwrap();
        runtime.implement(int, subber, Bindings::new().bind("sub", sub)).unwrap();
        runtime.implement(int, mather, Bindings::new()).unwrap();

        let boxed = runtime.box_capability(&40i64, int, mather, Escape::Heap).unwrap();
        assert_eq!(boxed.invoke_named("add", &[Word::from(2i64)]).unwrap().as_i64(), 42);
        assert_eq!(boxed.invoke_named("sub", &[Word::from(2i64)]).unwrap().as_i64(), 38);

        // narrow to one of the parts
        let narrowed = runtime.convert(boxed, subber).unwrap();
        assert_eq!(narrowed.capability().name(), "Subber");
        assert_eq!(narrowed.invoke(0, &[Word::from(50i64)]).unwrap().as_i64(), -10);
    }

    #[test]
    fn assert_capability_hands_the_box_back_on_failure() {
        let runtime = Runtime::default();
        let int = runtime.register_type::<i64>("int", PointerLayout::none()).unwrap();
        let (adder, subber) = adder_subber(&runtime);
        runtime.implement(int, adder, Bindings::new().bind("add", add)).unwrap();

        let plain = runtime.box_value(&5i64, int, Escape::Local).unwrap();
        let (plain, err) = runtime.assert_capability(plain, subber).unwrap_err();
        assert!(matches!(err, BoxError::CapabilityNotImplemented { .. }));
        assert_eq!(plain.unbox::<i64>(int).unwrap(), 5);

        let bound = runtime.assert_capability(plain, adder).unwrap();
        assert_eq!(bound.invoke(0, &[Word::from(1i64)]).unwrap().as_i64(), 6);
    }

    #[test]
    fn direct_and_boxed_calls_agree() {
        let runtime = Runtime::default();
        let int = runtime.register_type::<i64>("int", PointerLayout::none()).unwrap();
        let (adder, _) = adder_subber(&runtime);
        runtime.implement(int, adder, Bindings::new().bind("add", add)).unwrap();

        let direct = runtime.direct_method(int, "add").unwrap();
        let value = 100i64;
        let receiver = Receiver::of(&value, int).unwrap();
        let boxed = runtime.box_capability(&value, int, adder, Escape::Local).unwrap();
        let args = [Word::from(-58i64)];
        assert_eq!(direct(receiver, &args), boxed.invoke(0, &args).unwrap());

        assert!(matches!(
            runtime.direct_method(int, "mul"),
            Err(BoxError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn runtime_is_shared_across_threads() {
        const THREADS: usize = 8;

        let runtime = Runtime::default();
        let int = runtime.register_type::<i64>("int", PointerLayout::none()).unwrap();
        let (adder, _) = adder_subber(&runtime);
        runtime.implement(int, adder, Bindings::new().bind("add", add)).unwrap();

        let barrier = Barrier::new(THREADS);
        thread::scope(|scope| {
            for i in 0..THREADS as i64 {
                let runtime = &runtime;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    let boxed = runtime.box_capability(&i, int, adder, Escape::Heap).unwrap();
                    assert_eq!(boxed.invoke(0, &[Word::from(1i64)]).unwrap().as_i64(), i + 1);
                });
            }
        });
        assert_eq!(runtime.tables.builds(), 1);
    }
}
