//! Heap and garbage collection for the Kestrel engine.
//!
//! - [`Arena`] - typed block arenas with freelist allocation
//! - [`Heap`] - arenas + string heap + root lists, with the property
//!   operations of the object model
//! - [`StringHeap`] - inline/dictionary/owned/foreign string storage with
//!   ASN validation and compaction
//! - [`GcRoots`] / [`Heap::gc`] - precise mark-sweep with string
//!   relocation
//!
//! The optional `gc_logging` feature emits a `tracing` event per cycle.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod arena;
pub mod gc;
pub mod heap;
pub mod object;
pub mod string_heap;

pub use arena::Arena;
pub use gc::{GcRoots, GcStats};
pub use heap::{Heap, HeapOptions, HeapStat, OwnedRef};
pub use object::{
    FuncCell, GetResult, ObjCell, PropCell, RegexpCell, SetResult, ATTR_GETTER, ATTR_HIDDEN,
    ATTR_NON_CONFIGURABLE, ATTR_NON_ENUMERABLE, ATTR_NON_WRITABLE, ATTR_OFF_HEAP, ATTR_SETTER,
    DESTRUCTOR_NAME, MAX_PROTO_DEPTH, OBJ_DENSE_ARRAY, OBJ_FUNCTION, OBJ_HAS_DESTRUCTOR,
    OBJ_NOT_EXTENSIBLE, OBJ_OFF_HEAP,
};
pub use string_heap::{StrBytes, StringError, StringHeap, DICTIONARY};
