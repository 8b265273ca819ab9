//! Ordered type tests over a single box.
//!
//! Each case caches its expected type's identity hash, so evaluating a
//! switch is a linear walk comparing `u32`s. A hash match is only a
//! candidate: the case is taken after the descriptors compare identical.
use std::any;

use log::trace;

use crate::{BoxError, Receiver, Result, TypeDescriptor, ValueBox, same_type};

type Handler<'h, R> = Box<dyn FnMut(Receiver<'_>) -> R + 'h>;

struct Case<'h, R> {
    expected: &'static TypeDescriptor,
    hash: u32,
    handler: Handler<'h, R>,
}

pub struct TypeSwitch<'h, R> {
    cases: Vec<Case<'h, R>>,
    otherwise: Option<Handler<'h, R>>,
}

impl<'h, R> TypeSwitch<'h, R> {
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            otherwise: None,
        }
    }

    /// Add a case receiving the matched value as a `Receiver`.
    pub fn case(
        mut self,
        expected: &'static TypeDescriptor,
        handler: impl FnMut(Receiver<'_>) -> R + 'h,
    ) -> Self {
        self.cases.push(Case {
            expected,
            hash: expected.identity_hash(),
            handler: Box::new(handler),
        });
        self
    }

    /// Add a case receiving the unboxed value. `expected` must have been
    /// registered for `T`.
    pub fn case_value<T: Copy + 'static>(
        self,
        expected: &'static TypeDescriptor,
        mut handler: impl FnMut(T) -> R + 'h,
    ) -> Result<Self> {
        if !expected.is_rust_type::<T>() {
            return Err(BoxError::TypeMismatch {
                expected: expected.name(),
                found: any::type_name::<T>(),
            });
        }
        Ok(self.case(expected, move |receiver| {
            // SAFETY: the case only runs for values of `expected`, a T
            handler(unsafe { receiver.read_unchecked::<T>() })
        }))
    }

    /// Runs when no case matches.
    pub fn otherwise(mut self, handler: impl FnMut(Receiver<'_>) -> R + 'h) -> Self {
        self.otherwise = Some(Box::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Index of the first case whose type is identical to the box's.
    pub fn matching_case(&self, value: &impl ValueBox) -> Option<usize> {
        let actual = value.concrete_type();
        let hash = actual.identity_hash();
        for (index, case) in self.cases.iter().enumerate() {
            if case.hash != hash {
                continue;
            }
            if same_type(case.expected, actual) {
                return Some(index);
            }
            trace!(
                "identity hash {hash:#010x} shared by `{}` and `{}`",
                case.expected.name(),
                actual.name()
            );
        }
        None
    }

    /// Run the first matching case, or the fallback. `None` when nothing ran.
    pub fn evaluate(&mut self, value: &impl ValueBox) -> Option<R> {
        let receiver = value.receiver();
        match self.matching_case(value) {
            Some(index) => Some((self.cases[index].handler)(receiver)),
            None => self.otherwise.as_mut().map(|handler| handler(receiver)),
        }
    }
}

impl<R> Default for TypeSwitch<'_, R> {
    fn default() -> Self {
        Self::new()
    }
}
