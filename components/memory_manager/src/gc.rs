//! Mark-sweep collection with string-heap compaction.
//!
//! Marking starts from the engine's root slots (data stack, call frames,
//! engine values), the temporary and user-owned root lists, and the
//! literal tables of active bcodes. The sweep reclaims unmarked cells and
//! releases empty arena blocks; owned strings are then packed to the front
//! of their buffer and every surviving reference is rewritten with its new
//! offset and a fresh ASN.

use bytecode_system::Bcode;
use core_types::{Val, ValKind};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use crate::heap::Heap;
use crate::object::{DESTRUCTOR_NAME, OBJ_HAS_DESTRUCTOR};
use crate::string_heap::StringError;

/// External GC roots, implemented by the engine over its VM state.
pub trait GcRoots {
    /// Visits every root value slot mutably: the engine value table, the
    /// data stack, and every call frame's `this`, scope and try-stack.
    fn visit_slots(&mut self, f: &mut dyn FnMut(&mut Val));

    /// Visits the bcode of every active call frame plus any bcode pinned
    /// by an in-flight execution.
    fn visit_bcodes(&mut self, f: &mut dyn FnMut(&Rc<Bcode>));
}

/// Summary of one collection cycle.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Generic-object cells reclaimed.
    pub objects_freed: usize,
    /// Function cells reclaimed.
    pub functions_freed: usize,
    /// Property cells reclaimed.
    pub properties_freed: usize,
    /// Regexp cells reclaimed.
    pub regexps_freed: usize,
    /// Owned strings that survived compaction.
    pub strings_live: usize,
    /// `(destructor, user_data)` pairs of reclaimed objects that carried
    /// the has-destructor flag; the engine invokes them after the cycle.
    pub destructors: Vec<(Val, Val)>,
}

impl Heap {
    /// Runs a full collection cycle.
    pub fn gc(&mut self, roots: &mut dyn GcRoots) -> Result<GcStats, StringError> {
        let mut stats = GcStats::default();

        // Gather the initial worklist from every root.
        let mut work: Vec<Val> = Vec::with_capacity(64);
        roots.visit_slots(&mut |v| work.push(*v));
        work.extend_from_slice(&self.tmp_roots);
        work.extend_from_slice(&self.owned);
        work.push(self.function_prototype);

        let mut bcodes: Vec<Rc<Bcode>> = Vec::new();
        let mut seen_bcodes: HashSet<*const Bcode> = HashSet::new();
        roots.visit_bcodes(&mut |b| {
            if seen_bcodes.insert(Rc::as_ptr(b)) {
                bcodes.push(Rc::clone(b));
            }
        });
        for b in &bcodes {
            work.extend(b.lit.borrow().iter().copied());
        }

        // Mark phase: reachability over arena handles, collecting live
        // owned-string offsets along the way.
        let mut live_strings: BTreeSet<u32> = BTreeSet::new();
        while let Some(v) = work.pop() {
            match v.kind() {
                ValKind::Object(h) => {
                    if self.objects.mark(h) {
                        let cell = self.objects.get(h).expect("marked cell is live");
                        work.push(cell.proto);
                        if let Some(dense) = &cell.dense {
                            work.extend(dense.iter().copied());
                        }
                        let mut cur = cell.props;
                        while let Some(ph) = cur {
                            self.properties.mark(ph);
                            let p = self.properties.get(ph).expect("live prop cell");
                            work.push(p.name);
                            work.push(p.value);
                            cur = p.next;
                        }
                    }
                }
                ValKind::Function(h) => {
                    if self.functions.mark(h) {
                        let cell = self.functions.get(h).expect("marked cell is live");
                        work.push(cell.scope);
                        let bcode = Rc::clone(&cell.bcode);
                        let mut cur = cell.props;
                        while let Some(ph) = cur {
                            self.properties.mark(ph);
                            let p = self.properties.get(ph).expect("live prop cell");
                            work.push(p.name);
                            work.push(p.value);
                            cur = p.next;
                        }
                        if seen_bcodes.insert(Rc::as_ptr(&bcode)) {
                            work.extend(bcode.lit.borrow().iter().copied());
                            bcodes.push(bcode);
                        }
                    }
                }
                ValKind::Regexp(h) => {
                    if self.regexps.mark(h) {
                        let cell = self.regexps.get(h).expect("marked cell is live");
                        work.push(cell.source);
                    }
                }
                ValKind::StrOwned { offset, asn } => {
                    self.strings.validate_asn(asn)?;
                    live_strings.insert(offset);
                }
                _ => {}
            }
        }

        // Destructor pre-pass: dying objects still have intact property
        // lists here, so the (dtor, data) pair can be read out.
        let dtor_sentinel = Val::foreign(DESTRUCTOR_NAME);
        let mut doomed_with_dtor: Vec<Val> = Vec::new();
        self.objects.for_each_used(|h, cell| {
            if cell.flags & OBJ_HAS_DESTRUCTOR != 0 && !self.objects.is_marked(h) {
                doomed_with_dtor.push(Val::object(h));
            }
        });
        for obj in doomed_with_dtor {
            if let Some(ph) = self.get_own_prop(obj, dtor_sentinel) {
                let pair = self.prop(ph).expect("live prop cell").value;
                let dtor = self.array_get(pair, 0);
                let data = self.array_get(pair, 1);
                stats.destructors.push((dtor, data));
            }
        }

        // Sweep phase. Function cells drop their bcode reference here,
        // regexp cells free their compiled pattern, dense arrays their
        // backing storage.
        self.objects.sweep(|_, _| stats.objects_freed += 1);
        self.functions.sweep(|_, _| stats.functions_freed += 1);
        self.regexps.sweep(|_, _| stats.regexps_freed += 1);
        self.properties.sweep(|_, _| stats.properties_freed += 1);

        // String compaction: advance the ASN window, pack survivors, then
        // rewrite every reachable owned-string value exactly once.
        let live: Vec<u32> = live_strings.into_iter().collect();
        stats.strings_live = live.len();
        let reloc: HashMap<u32, (u32, u16)> = self.strings.compact(&live).into_iter().collect();

        let mut rewrite = |v: &mut Val| {
            if let ValKind::StrOwned { offset, .. } = v.kind() {
                if let Some(&(new_off, new_asn)) = reloc.get(&offset) {
                    *v = Val::owned_string(new_off, new_asn);
                }
            }
        };
        roots.visit_slots(&mut rewrite);
        for v in self.tmp_roots.iter_mut() {
            rewrite(v);
        }
        for v in self.owned.iter_mut() {
            rewrite(v);
        }
        for b in &bcodes {
            for v in b.lit.borrow_mut().iter_mut() {
                rewrite(v);
            }
        }
        self.properties.for_each_used_mut(|_, p| {
            rewrite(&mut p.name);
            rewrite(&mut p.value);
        });
        self.objects.for_each_used_mut(|_, c| {
            if let Some(dense) = &mut c.dense {
                for v in dense.iter_mut() {
                    rewrite(v);
                }
            }
        });
        self.regexps.for_each_used_mut(|_, c| rewrite(&mut c.source));

        self.need_gc = false;
        self.gc_count += 1;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            objects_freed = stats.objects_freed,
            functions_freed = stats.functions_freed,
            properties_freed = stats.properties_freed,
            strings_live = stats.strings_live,
            "gc cycle complete"
        );

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapOptions;

    /// Roots over a plain vector of slots, standing in for the VM.
    struct VecRoots {
        slots: Vec<Val>,
    }

    impl GcRoots for VecRoots {
        fn visit_slots(&mut self, f: &mut dyn FnMut(&mut Val)) {
            for v in self.slots.iter_mut() {
                f(v);
            }
        }
        fn visit_bcodes(&mut self, _f: &mut dyn FnMut(&Rc<Bcode>)) {}
    }

    #[test]
    fn test_unreachable_objects_are_collected() {
        let mut heap = Heap::new(HeapOptions::default());
        let kept = heap.mk_object(Val::NULL);
        let _lost = heap.mk_object(Val::NULL);
        let mut roots = VecRoots { slots: vec![kept] };
        let stats = heap.gc(&mut roots).unwrap();
        assert_eq!(stats.objects_freed, 1);
        assert!(heap.objects.get(kept.handle()).is_some());
    }

    #[test]
    fn test_props_keep_values_alive() {
        let mut heap = Heap::new(HeapOptions::default());
        let outer = heap.mk_object(Val::NULL);
        let inner = heap.mk_object(Val::NULL);
        let name = heap.strings.mk_string(b"inner");
        heap.def_prop(outer, name, 0, inner);
        let mut roots = VecRoots { slots: vec![outer] };
        let stats = heap.gc(&mut roots).unwrap();
        assert_eq!(stats.objects_freed, 0);
        assert!(heap.objects.get(inner.handle()).is_some());
    }

    #[test]
    fn test_prototype_cycles_are_handled() {
        let mut heap = Heap::new(HeapOptions::default());
        let a = heap.mk_object(Val::NULL);
        let b = heap.mk_object(a);
        heap.set_proto(a, b);
        let mut roots = VecRoots { slots: vec![a] };
        let stats = heap.gc(&mut roots).unwrap();
        assert_eq!(stats.objects_freed, 0);
        // Drop the root: the whole cycle dies despite the loop.
        let mut roots = VecRoots { slots: vec![] };
        let stats = heap.gc(&mut roots).unwrap();
        assert_eq!(stats.objects_freed, 2);
    }

    #[test]
    fn test_string_roundtrip_across_gc() {
        let mut heap = Heap::new(HeapOptions::default());
        let _garbage = heap.strings.mk_string(b"string that will be dropped");
        let keep = heap.strings.mk_string(b"string that must survive");
        let mut roots = VecRoots { slots: vec![keep] };
        heap.gc(&mut roots).unwrap();
        let survivor = roots.slots[0];
        assert_ne!(survivor, keep, "compaction re-stamps the value");
        assert_eq!(
            heap.strings.get(survivor).unwrap().bytes(),
            b"string that must survive"
        );
        // The pre-GC value is detectably stale.
        assert!(matches!(
            heap.strings.get(keep),
            Err(StringError::StaleAsn { .. })
        ));
    }

    #[test]
    fn test_strings_in_properties_survive() {
        let mut heap = Heap::new(HeapOptions::default());
        let obj = heap.mk_object(Val::NULL);
        let name = heap.strings.mk_string(b"property name over five");
        let value = heap.strings.mk_string(b"property value over five");
        heap.def_prop(obj, name, 0, value);
        let mut roots = VecRoots { slots: vec![obj] };
        heap.gc(&mut roots).unwrap();
        // Look the property up again by content; both the stored name and
        // value were rewritten by the compaction.
        let fresh = heap.strings.mk_string(b"property name over five");
        match heap.get_prop(obj, fresh) {
            crate::object::GetResult::Value(v) => {
                assert_eq!(heap.strings.get(v).unwrap().bytes(), b"property value over five");
            }
            other => panic!("unexpected get result {:?}", other),
        }
    }

    #[test]
    fn test_destructor_pairs_reported() {
        let mut heap = Heap::new(HeapOptions::default());
        let obj = heap.mk_object(Val::NULL);
        let pair = heap.mk_dense_array(Val::NULL);
        heap.array_push(pair, Val::cfunction(7));
        heap.array_push(pair, Val::foreign(0x1234));
        heap.set_destructor(obj, pair);
        let mut roots = VecRoots { slots: vec![] };
        let stats = heap.gc(&mut roots).unwrap();
        assert_eq!(stats.destructors, vec![(Val::cfunction(7), Val::foreign(0x1234))]);
    }

    #[test]
    fn test_tmp_roots_pin_values() {
        let mut heap = Heap::new(HeapOptions::default());
        let obj = heap.mk_object(Val::NULL);
        heap.tmp_roots.push(obj);
        let mut roots = VecRoots { slots: vec![] };
        let stats = heap.gc(&mut roots).unwrap();
        assert_eq!(stats.objects_freed, 0);
        heap.tmp_roots.pop();
        let stats = heap.gc(&mut roots).unwrap();
        assert_eq!(stats.objects_freed, 1);
    }
}
