//! The heap facade: typed arenas, the string heap, and the root lists
//! shared by every engine entry point.

use core_types::Val;

use crate::arena::Arena;
use crate::object::{FuncCell, ObjCell, PropCell, RegexpCell};
use crate::string_heap::StringHeap;

/// Initial arena sizes, in cells. Each value is also the growth increment
/// for its arena.
#[derive(Debug, Clone, Copy)]
pub struct HeapOptions {
    /// Generic-object arena size.
    pub object_arena_size: usize,
    /// Function arena size.
    pub function_arena_size: usize,
    /// Property arena size.
    pub property_arena_size: usize,
}

impl Default for HeapOptions {
    fn default() -> HeapOptions {
        HeapOptions {
            object_arena_size: 200,
            function_arena_size: 100,
            property_arena_size: 500,
        }
    }
}

/// A LIFO token returned by [`Heap::own`]; values are re-read through
/// [`Heap::owned_value`] after a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedRef(pub(crate) usize);

/// The engine heap: object/function/property/regexp arenas plus the
/// string heap and the explicit root lists.
#[derive(Debug)]
pub struct Heap {
    /// Generic-object arena.
    pub objects: Arena<ObjCell>,
    /// JS-function arena.
    pub functions: Arena<FuncCell>,
    /// Property-cell arena.
    pub properties: Arena<PropCell>,
    /// Regexp arena.
    pub regexps: Arena<RegexpCell>,
    /// String storage.
    pub strings: StringHeap,
    /// Shared `Function.prototype`; the prototype of every JS function
    /// value. Set by the engine during initialization.
    pub function_prototype: Val,
    /// Stack of temporary roots pushed inside arena-allocating helpers.
    pub tmp_roots: Vec<Val>,
    /// User-owned values (`own`/`disown`), LIFO.
    pub owned: Vec<Val>,
    /// Set when the string heap wants a collection; observed by the VM
    /// loop between instructions.
    pub need_gc: bool,
    /// Whether automatic collection is enabled.
    pub gc_enabled: bool,
    /// Completed GC cycles.
    pub gc_count: u64,
}

impl Heap {
    /// Creates a heap with the given arena sizes.
    pub fn new(opts: HeapOptions) -> Heap {
        Heap {
            objects: Arena::new("object", opts.object_arena_size),
            functions: Arena::new("function", opts.function_arena_size),
            properties: Arena::new("property", opts.property_arena_size),
            regexps: Arena::new("regexp", opts.function_arena_size.max(1)),
            strings: StringHeap::new(),
            function_prototype: Val::UNDEFINED,
            tmp_roots: Vec::new(),
            owned: Vec::new(),
            need_gc: false,
            gc_enabled: true,
            gc_count: 0,
        }
    }

    /// Whether any arena or the string heap wants a collection before the
    /// next allocation.
    pub fn wants_gc(&self) -> bool {
        self.need_gc
            || self.strings.need_gc
            || self.objects.is_full()
            || self.functions.is_full()
            || self.properties.is_full()
            || self.regexps.is_full()
    }

    /// Pushes a value onto the user-owned root list.
    pub fn own(&mut self, v: Val) -> OwnedRef {
        self.owned.push(v);
        OwnedRef(self.owned.len() - 1)
    }

    /// Pops the most recently owned value. Returns `false` when `r` is
    /// not the top of the LIFO list.
    pub fn disown(&mut self, r: OwnedRef) -> bool {
        if r.0 + 1 != self.owned.len() {
            return false;
        }
        self.owned.pop();
        true
    }

    /// Reads an owned value back; this is the post-GC re-fetch point.
    pub fn owned_value(&self, r: OwnedRef) -> Option<Val> {
        self.owned.get(r.0).copied()
    }

    /// Replaces an owned value in place.
    pub fn set_owned_value(&mut self, r: OwnedRef, v: Val) {
        if let Some(slot) = self.owned.get_mut(r.0) {
            *slot = v;
        }
    }

    /// Memory report used by `heap_stat` and the CLI `-mm` flag.
    pub fn heap_stat(&self) -> HeapStat {
        HeapStat {
            object_used: self.objects.used_count(),
            object_capacity: self.objects.capacity(),
            function_used: self.functions.used_count(),
            function_capacity: self.functions.capacity(),
            property_used: self.properties.used_count(),
            property_capacity: self.properties.capacity(),
            regexp_used: self.regexps.used_count(),
            regexp_capacity: self.regexps.capacity(),
            string_len: self.strings.owned_len(),
            string_capacity: self.strings.owned_capacity(),
            gc_count: self.gc_count,
        }
    }
}

/// Snapshot of heap occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStat {
    /// Live generic-object cells.
    pub object_used: usize,
    /// Generic-object arena capacity.
    pub object_capacity: usize,
    /// Live function cells.
    pub function_used: usize,
    /// Function arena capacity.
    pub function_capacity: usize,
    /// Live property cells.
    pub property_used: usize,
    /// Property arena capacity.
    pub property_capacity: usize,
    /// Live regexp cells.
    pub regexp_used: usize,
    /// Regexp arena capacity.
    pub regexp_capacity: usize,
    /// Occupied bytes in the owned-string buffer.
    pub string_len: usize,
    /// Capacity of the owned-string buffer.
    pub string_capacity: usize,
    /// Completed GC cycles.
    pub gc_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_disown_lifo() {
        let mut h = Heap::new(HeapOptions::default());
        let a = h.own(Val::number(1.0));
        let b = h.own(Val::number(2.0));
        assert_eq!(h.owned_value(a), Some(Val::number(1.0)));
        assert!(!h.disown(a), "disown must be LIFO");
        assert!(h.disown(b));
        assert!(h.disown(a));
    }

    #[test]
    fn test_heap_stat_counts() {
        let mut h = Heap::new(HeapOptions::default());
        let obj = h.mk_object(Val::NULL);
        let name = h.strings.mk_string(b"k");
        h.def_prop(obj, name, 0, Val::TRUE);
        let stat = h.heap_stat();
        assert_eq!(stat.object_used, 1);
        assert_eq!(stat.property_used, 1);
        assert_eq!(stat.gc_count, 0);
    }
}
