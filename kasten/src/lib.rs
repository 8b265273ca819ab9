mod boxes;
mod capability;
mod dispatch;
mod error;
mod method;
mod runtime;
mod storage;
mod switch;
mod types;

pub use boxes::*;
pub use capability::{
    Bindings, CapabilityKey, CapabilityRegistry, CapabilitySet, CapabilitySetId,
};
pub use dispatch::*;
pub use error::*;
pub use method::*;
pub use runtime::*;
pub use storage::*;
pub use switch::TypeSwitch;
pub use types::{
    PointerLayout, TypeDescriptor, TypeFlags, TypeKey, TypeRegistry, TypeSpec, WORD_SIZE,
    identity_hash_of, same_type,
};
