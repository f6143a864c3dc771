//! Object, property, function and regexp cells, and the property
//! operations over them.
//!
//! An object owns a linked list of property cells in the property arena.
//! Property names are values: always strings, except the one hidden
//! foreign-pointer name used for destructor entries. Getter/setter
//! accessors live in the property value slot: a lone accessor is stored
//! directly, a getter/setter pair as a two-element dense array.

use bytecode_system::Bcode;
use core_types::{Handle, Val, ValKind};
use std::rc::Rc;

use crate::heap::Heap;

/// Property attribute: not writable.
pub const ATTR_NON_WRITABLE: u8 = 1 << 0;
/// Property attribute: not enumerable.
pub const ATTR_NON_ENUMERABLE: u8 = 1 << 1;
/// Property attribute: not configurable.
pub const ATTR_NON_CONFIGURABLE: u8 = 1 << 2;
/// Property attribute: hidden from user code (engine-internal entries).
pub const ATTR_HIDDEN: u8 = 1 << 3;
/// Property attribute: the value slot holds a getter.
pub const ATTR_GETTER: u8 = 1 << 4;
/// Property attribute: the value slot holds a setter.
pub const ATTR_SETTER: u8 = 1 << 5;
/// Property attribute: the cell resides in read-only memory.
pub const ATTR_OFF_HEAP: u8 = 1 << 6;

/// Object flag: no new properties may be added.
pub const OBJ_NOT_EXTENSIBLE: u8 = 1 << 0;
/// Object flag: the object is a dense array with a backing vector.
pub const OBJ_DENSE_ARRAY: u8 = 1 << 1;
/// Object flag: the cell resides outside the arena (frozen heap).
pub const OBJ_OFF_HEAP: u8 = 1 << 2;
/// Object flag: a destructor entry is present in the property list.
pub const OBJ_HAS_DESTRUCTOR: u8 = 1 << 3;
/// Object flag: the cell is a function.
pub const OBJ_FUNCTION: u8 = 1 << 4;

/// Foreign-pointer payload naming the hidden destructor property.
pub const DESTRUCTOR_NAME: usize = 1;

/// Upper bound on prototype-chain walks. Cycles in the prototype graph
/// are legal for the collector; lookups simply stop after this depth.
pub const MAX_PROTO_DEPTH: usize = 512;

/// A property cell.
#[derive(Debug, Clone)]
pub struct PropCell {
    /// Attribute flags (`ATTR_*`).
    pub attrs: u8,
    /// Property name: a string value, or a foreign value for hidden
    /// engine entries.
    pub name: Val,
    /// Property value, or accessor storage under `ATTR_GETTER`/`ATTR_SETTER`.
    pub value: Val,
    /// Next property in the owning object's list.
    pub next: Option<Handle>,
}

/// A generic object cell.
#[derive(Debug, Clone)]
pub struct ObjCell {
    /// Object flags (`OBJ_*`).
    pub flags: u8,
    /// Head of the property list.
    pub props: Option<Handle>,
    /// Prototype back-reference. Ownership is the arena's; cycles are
    /// legal and resolved by the reachability walk.
    pub proto: Val,
    /// Backing storage for dense arrays.
    pub dense: Option<Vec<Val>>,
}

/// A JS function cell. The scope value doubles as the outer-environment
/// pointer; there is no separate prototype slot.
#[derive(Debug, Clone)]
pub struct FuncCell {
    /// Object flags (`OBJ_*`); always contains [`OBJ_FUNCTION`].
    pub flags: u8,
    /// Head of the property list.
    pub props: Option<Handle>,
    /// Captured scope (a generic object), or `undefined` for half-done
    /// function literals awaiting instantiation.
    pub scope: Val,
    /// Shared compiled code.
    pub bcode: Rc<Bcode>,
}

/// A regexp cell wrapping compiled pattern state.
#[derive(Debug)]
pub struct RegexpCell {
    /// The source pattern as a string value.
    pub source: Val,
    /// Compiled pattern; freed with the cell.
    pub compiled: regex::Regex,
    /// `g` flag.
    pub global: bool,
    /// `i` flag.
    pub ignore_case: bool,
    /// `m` flag.
    pub multiline: bool,
    /// `lastIndex` state used by the (out-of-scope) matching built-ins.
    pub last_index: f64,
}

/// Result of a property read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GetResult {
    /// Plain data property value.
    Value(Val),
    /// An accessor was found; the VM must call this getter.
    CallGetter(Val),
    /// No own or inherited property.
    Missing,
}

/// Result of a property write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetResult {
    /// The value was stored.
    Done,
    /// An accessor was found; the VM must call this setter with the value.
    CallSetter(Val),
    /// A non-writable property blocked the write.
    NotWritable,
    /// The object is not extensible and the property does not exist.
    NotExtensible,
}

impl Heap {
    /// Allocates a generic object with the given prototype. A full arena
    /// requests a collection before growing.
    pub fn mk_object(&mut self, proto: Val) -> Val {
        self.need_gc |= self.objects.is_full();
        let h = self.objects.alloc(ObjCell {
            flags: 0,
            props: None,
            proto,
            dense: None,
        });
        Val::object(h)
    }

    /// Allocates a dense array with the given prototype.
    pub fn mk_dense_array(&mut self, proto: Val) -> Val {
        self.need_gc |= self.objects.is_full();
        let h = self.objects.alloc(ObjCell {
            flags: OBJ_DENSE_ARRAY,
            props: None,
            proto,
            dense: Some(Vec::new()),
        });
        Val::object(h)
    }

    /// Allocates a JS function cell sharing `bcode`, capturing `scope`.
    pub fn mk_function(&mut self, scope: Val, bcode: Rc<Bcode>) -> Val {
        self.need_gc |= self.functions.is_full();
        let h = self.functions.alloc(FuncCell {
            flags: OBJ_FUNCTION,
            props: None,
            scope,
            bcode,
        });
        Val::function(h)
    }

    /// Allocates a regexp cell; the compiled state is freed by the sweep.
    pub fn mk_regexp_cell(&mut self, cell: RegexpCell) -> Val {
        self.need_gc |= self.regexps.is_full();
        let h = self.regexps.alloc(cell);
        Val::regexp(h)
    }

    /// Compiles a regexp literal into a regexp value. Flags may contain
    /// each of `g`, `i`, `m` at most once; a compilation failure or a bad
    /// flag yields an error message for the caller to throw.
    pub fn mk_regexp(&mut self, source: &str, flags: &str) -> Result<Val, String> {
        let (mut global, mut ignore_case, mut multiline) = (false, false, false);
        for f in flags.chars() {
            let seen = match f {
                'g' => std::mem::replace(&mut global, true),
                'i' => std::mem::replace(&mut ignore_case, true),
                'm' => std::mem::replace(&mut multiline, true),
                other => return Err(format!("invalid regexp flag '{}'", other)),
            };
            if seen {
                return Err(format!("duplicate regexp flag '{}'", f));
            }
        }
        let mut pattern = String::new();
        if ignore_case {
            pattern.push_str("(?i)");
        }
        if multiline {
            pattern.push_str("(?m)");
        }
        pattern.push_str(source);
        let compiled =
            regex::Regex::new(&pattern).map_err(|e| format!("invalid regexp: {}", e))?;
        let source_val = self.strings.mk_string(source.as_bytes());
        Ok(self.mk_regexp_cell(RegexpCell {
            source: source_val,
            compiled,
            global,
            ignore_case,
            multiline,
            last_index: 0.0,
        }))
    }

    /// The prototype of a value, per the object graph: generic objects
    /// carry their own back-reference, functions alias the shared
    /// `Function.prototype` slot.
    pub fn proto_of(&self, v: Val) -> Val {
        match v.kind() {
            ValKind::Object(h) => self.objects.get(h).map_or(Val::NULL, |c| c.proto),
            ValKind::Function(_) => self.function_prototype,
            _ => Val::NULL,
        }
    }

    /// Replaces a generic object's prototype.
    pub fn set_proto(&mut self, obj: Val, proto: Val) {
        if let ValKind::Object(h) = obj.kind() {
            if let Some(cell) = self.objects.get_mut(h) {
                cell.proto = proto;
            }
        }
    }

    fn props_head(&self, obj: Val) -> Option<Handle> {
        match obj.kind() {
            ValKind::Object(h) => self.objects.get(h)?.props,
            ValKind::Function(h) => self.functions.get(h)?.props,
            _ => None,
        }
    }

    fn set_props_head(&mut self, obj: Val, head: Option<Handle>) {
        match obj.kind() {
            ValKind::Object(h) => {
                if let Some(c) = self.objects.get_mut(h) {
                    c.props = head;
                }
            }
            ValKind::Function(h) => {
                if let Some(c) = self.functions.get_mut(h) {
                    c.props = head;
                }
            }
            _ => {}
        }
    }

    /// Object flags of an object or function value, 0 otherwise.
    pub fn obj_flags(&self, obj: Val) -> u8 {
        match obj.kind() {
            ValKind::Object(h) => self.objects.get(h).map_or(0, |c| c.flags),
            ValKind::Function(h) => self.functions.get(h).map_or(0, |c| c.flags),
            _ => 0,
        }
    }

    /// Sets object flags on an object or function value.
    pub fn set_obj_flags(&mut self, obj: Val, flags: u8) {
        match obj.kind() {
            ValKind::Object(h) => {
                if let Some(c) = self.objects.get_mut(h) {
                    c.flags |= flags;
                }
            }
            ValKind::Function(h) => {
                if let Some(c) = self.functions.get_mut(h) {
                    c.flags |= flags;
                }
            }
            _ => {}
        }
    }

    fn names_equal(&self, a: Val, b: Val) -> bool {
        if a == b {
            return true;
        }
        if a.is_string() && b.is_string() {
            self.strings.str_eq(a, b)
        } else {
            false
        }
    }

    /// Finds an own property cell by name, skipping nothing: hidden
    /// entries are found too when their foreign name is presented.
    pub fn get_own_prop(&self, obj: Val, name: Val) -> Option<Handle> {
        let mut cur = self.props_head(obj);
        while let Some(ph) = cur {
            let p = self.properties.get(ph)?;
            if self.names_equal(p.name, name) {
                return Some(ph);
            }
            cur = p.next;
        }
        None
    }

    /// Borrows a property cell.
    pub fn prop(&self, ph: Handle) -> Option<&PropCell> {
        self.properties.get(ph)
    }

    /// Mutably borrows a property cell.
    pub fn prop_mut(&mut self, ph: Handle) -> Option<&mut PropCell> {
        self.properties.get_mut(ph)
    }

    /// Interprets a string value as an array index, per the usual
    /// all-digits rule.
    pub fn name_as_index(&self, name: Val) -> Option<usize> {
        let s = self.strings.get(name).ok()?;
        let bytes = s.bytes();
        if bytes.is_empty() || bytes.len() > 10 {
            return None;
        }
        if bytes.len() > 1 && bytes[0] == b'0' {
            return None;
        }
        let mut n: usize = 0;
        for &b in bytes {
            if !b.is_ascii_digit() {
                return None;
            }
            n = n.checked_mul(10)?.checked_add((b - b'0') as usize)?;
        }
        Some(n)
    }

    /// Number of elements in an array value. Dense arrays report their
    /// backing length; sparse arrays report max numeric key + 1.
    pub fn array_length(&self, arr: Val) -> usize {
        if let ValKind::Object(h) = arr.kind() {
            if let Some(cell) = self.objects.get(h) {
                if let Some(dense) = &cell.dense {
                    return dense.len();
                }
                let mut max = 0usize;
                let mut cur = cell.props;
                while let Some(ph) = cur {
                    let Some(p) = self.properties.get(ph) else { break };
                    if let Some(i) = self.name_as_index(p.name) {
                        max = max.max(i + 1);
                    }
                    cur = p.next;
                }
                return max;
            }
        }
        0
    }

    /// Reads an array element.
    pub fn array_get(&self, arr: Val, index: usize) -> Val {
        if let ValKind::Object(h) = arr.kind() {
            if let Some(cell) = self.objects.get(h) {
                if let Some(dense) = &cell.dense {
                    return dense.get(index).copied().unwrap_or(Val::UNDEFINED);
                }
            }
        }
        Val::UNDEFINED
    }

    /// Writes an array element, extending the dense backing with
    /// `undefined` holes as needed.
    pub fn array_set(&mut self, arr: Val, index: usize, value: Val) {
        if let ValKind::Object(h) = arr.kind() {
            if let Some(cell) = self.objects.get_mut(h) {
                if let Some(dense) = &mut cell.dense {
                    if index >= dense.len() {
                        dense.resize(index + 1, Val::UNDEFINED);
                    }
                    dense[index] = value;
                }
            }
        }
    }

    /// Appends to a dense array, returning the new length.
    pub fn array_push(&mut self, arr: Val, value: Val) -> usize {
        if let ValKind::Object(h) = arr.kind() {
            if let Some(cell) = self.objects.get_mut(h) {
                if let Some(dense) = &mut cell.dense {
                    dense.push(value);
                    return dense.len();
                }
            }
        }
        0
    }

    /// Removes the element at `index` from a dense array (shifting later
    /// elements down), as used by try-stack pops.
    pub fn array_del(&mut self, arr: Val, index: usize) {
        if let ValKind::Object(h) = arr.kind() {
            if let Some(cell) = self.objects.get_mut(h) {
                if let Some(dense) = &mut cell.dense {
                    if index < dense.len() {
                        dense.remove(index);
                    }
                }
            }
        }
    }

    /// Whether the value is a dense array object.
    pub fn is_array(&self, v: Val) -> bool {
        self.obj_flags(v) & OBJ_DENSE_ARRAY != 0
    }

    /// Defines or redefines an own property directly, bypassing setters
    /// and writability (the `def` primitive).
    pub fn def_prop(&mut self, obj: Val, name: Val, attrs: u8, value: Val) {
        if self.is_array(obj) {
            if let Some(i) = name.is_string().then(|| self.name_as_index(name)).flatten() {
                self.array_set(obj, i, value);
                return;
            }
        }
        if let Some(ph) = self.get_own_prop(obj, name) {
            let p = self.properties.get_mut(ph).expect("live prop cell");
            p.attrs = attrs;
            p.value = value;
            return;
        }
        self.need_gc |= self.properties.is_full();
        let head = self.props_head(obj);
        let ph = self.properties.alloc(PropCell {
            attrs,
            name,
            value,
            next: head,
        });
        self.set_props_head(obj, Some(ph));
    }

    /// Reads a property along the prototype chain. Dense-array elements
    /// and the computed `length` of arrays are handled here; accessors
    /// surface as [`GetResult::CallGetter`] for the VM to complete.
    pub fn get_prop(&self, obj: Val, name: Val) -> GetResult {
        if self.is_array(obj) && name.is_string() {
            if let Some(i) = self.name_as_index(name) {
                if let ValKind::Object(h) = obj.kind() {
                    if let Some(dense) = self.objects.get(h).and_then(|c| c.dense.as_ref()) {
                        if i < dense.len() {
                            return GetResult::Value(dense[i]);
                        }
                    }
                }
            } else if let Ok(s) = self.strings.get(name) {
                if s.bytes() == b"length" {
                    return GetResult::Value(Val::number(self.array_length(obj) as f64));
                }
            }
        }
        let mut cur = obj;
        let mut depth = 0;
        loop {
            depth += 1;
            if depth > MAX_PROTO_DEPTH {
                return GetResult::Missing;
            }
            if let Some(ph) = self.get_own_prop(cur, name) {
                let p = self.properties.get(ph).expect("live prop cell");
                if p.attrs & ATTR_HIDDEN != 0 {
                    return GetResult::Missing;
                }
                if p.attrs & ATTR_GETTER != 0 {
                    return GetResult::CallGetter(self.accessor_getter(p.value, p.attrs));
                }
                if p.attrs & ATTR_SETTER != 0 {
                    // Setter without getter reads as undefined.
                    return GetResult::Value(Val::UNDEFINED);
                }
                return GetResult::Value(p.value);
            }
            let proto = self.proto_of(cur);
            if proto.is_object() || proto.is_function() {
                cur = proto;
            } else {
                return GetResult::Missing;
            }
        }
    }

    fn accessor_getter(&self, storage: Val, attrs: u8) -> Val {
        if attrs & ATTR_GETTER != 0 && attrs & ATTR_SETTER != 0 {
            self.array_get(storage, 0)
        } else {
            storage
        }
    }

    fn accessor_setter(&self, storage: Val, attrs: u8) -> Val {
        if attrs & ATTR_GETTER != 0 && attrs & ATTR_SETTER != 0 {
            self.array_get(storage, 1)
        } else {
            storage
        }
    }

    /// Writes a property with assignment semantics: own setters and
    /// non-writable properties are honored, then the prototype chain is
    /// consulted for inherited accessors, and finally an own property is
    /// created on an extensible object.
    pub fn set_prop(&mut self, obj: Val, name: Val, value: Val) -> SetResult {
        if self.is_array(obj) && name.is_string() {
            if let Some(i) = self.name_as_index(name) {
                self.array_set(obj, i, value);
                return SetResult::Done;
            }
        }
        let mut cur = obj;
        let mut depth = 0;
        loop {
            depth += 1;
            if depth > MAX_PROTO_DEPTH {
                break;
            }
            if let Some(ph) = self.get_own_prop(cur, name) {
                let p = self.properties.get(ph).expect("live prop cell");
                let attrs = p.attrs;
                let stored = p.value;
                if attrs & ATTR_SETTER != 0 {
                    return SetResult::CallSetter(self.accessor_setter(stored, attrs));
                }
                if attrs & ATTR_GETTER != 0 || attrs & ATTR_NON_WRITABLE != 0 {
                    return SetResult::NotWritable;
                }
                if cur == obj {
                    self.properties.get_mut(ph).expect("live prop cell").value = value;
                    return SetResult::Done;
                }
                // Writable data property on the prototype: shadow it.
                break;
            }
            let proto = self.proto_of(cur);
            if proto.is_object() || proto.is_function() {
                cur = proto;
            } else {
                break;
            }
        }
        if self.obj_flags(obj) & OBJ_NOT_EXTENSIBLE != 0 {
            return SetResult::NotExtensible;
        }
        self.def_prop(obj, name, 0, value);
        SetResult::Done
    }

    /// Deletes an own property. Returns `false` for non-configurable
    /// properties, `true` otherwise (including missing properties).
    pub fn del_prop(&mut self, obj: Val, name: Val) -> bool {
        if self.is_array(obj) && name.is_string() {
            if let Some(i) = self.name_as_index(name) {
                if let ValKind::Object(h) = obj.kind() {
                    if let Some(dense) = self.objects.get_mut(h).and_then(|c| c.dense.as_mut()) {
                        if i < dense.len() {
                            dense[i] = Val::UNDEFINED;
                        }
                        return true;
                    }
                }
            }
        }
        let mut prev: Option<Handle> = None;
        let mut cur = self.props_head(obj);
        while let Some(ph) = cur {
            let p = self.properties.get(ph).expect("live prop cell");
            let next = p.next;
            if self.names_equal(p.name, name) {
                if p.attrs & ATTR_NON_CONFIGURABLE != 0 {
                    return false;
                }
                match prev {
                    Some(pp) => self.properties.get_mut(pp).expect("live prop cell").next = next,
                    None => self.set_props_head(obj, next),
                }
                return true;
            }
            prev = Some(ph);
            cur = next;
        }
        true
    }

    /// Registers a destructor for an object: a hidden property whose name
    /// is a foreign sentinel and whose value is a `[dtor, user_data]`
    /// pair. The collector reports the pair when the object dies.
    pub fn set_destructor(&mut self, obj: Val, pair: Val) {
        self.def_prop(
            obj,
            Val::foreign(DESTRUCTOR_NAME),
            ATTR_HIDDEN | ATTR_NON_ENUMERABLE | ATTR_NON_CONFIGURABLE,
            pair,
        );
        self.set_obj_flags(obj, OBJ_HAS_DESTRUCTOR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn mk_name(h: &mut Heap, s: &str) -> Val {
        h.strings.mk_string(s.as_bytes())
    }

    #[test]
    fn test_object_props() {
        let mut h = Heap::new(Default::default());
        let obj = h.mk_object(Val::NULL);
        let name = mk_name(&mut h, "answer");
        h.def_prop(obj, name, 0, Val::number(42.0));
        assert_eq!(h.get_prop(obj, name), GetResult::Value(Val::number(42.0)));
        assert_eq!(h.set_prop(obj, name, Val::number(43.0)), SetResult::Done);
        assert_eq!(h.get_prop(obj, name), GetResult::Value(Val::number(43.0)));
    }

    #[test]
    fn test_prototype_chain_lookup() {
        let mut h = Heap::new(Default::default());
        let proto = h.mk_object(Val::NULL);
        let obj = h.mk_object(proto);
        let name = mk_name(&mut h, "shared");
        h.def_prop(proto, name, 0, Val::TRUE);
        assert_eq!(h.get_prop(obj, name), GetResult::Value(Val::TRUE));
        // Shadowing write lands on the receiver, not the prototype.
        assert_eq!(h.set_prop(obj, name, Val::FALSE), SetResult::Done);
        assert_eq!(h.get_prop(obj, name), GetResult::Value(Val::FALSE));
        assert_eq!(h.get_prop(proto, name), GetResult::Value(Val::TRUE));
    }

    #[test]
    fn test_non_writable_blocks_set() {
        let mut h = Heap::new(Default::default());
        let obj = h.mk_object(Val::NULL);
        let name = mk_name(&mut h, "ro");
        h.def_prop(obj, name, ATTR_NON_WRITABLE, Val::ZERO);
        assert_eq!(h.set_prop(obj, name, Val::TRUE), SetResult::NotWritable);
        assert_eq!(h.get_prop(obj, name), GetResult::Value(Val::ZERO));
    }

    #[test]
    fn test_not_extensible() {
        let mut h = Heap::new(Default::default());
        let obj = h.mk_object(Val::NULL);
        h.set_obj_flags(obj, OBJ_NOT_EXTENSIBLE);
        let name = mk_name(&mut h, "nope");
        assert_eq!(h.set_prop(obj, name, Val::TRUE), SetResult::NotExtensible);
    }

    #[test]
    fn test_delete() {
        let mut h = Heap::new(Default::default());
        let obj = h.mk_object(Val::NULL);
        let a = mk_name(&mut h, "a");
        let b = mk_name(&mut h, "b");
        h.def_prop(obj, a, 0, Val::number(1.0));
        h.def_prop(obj, b, ATTR_NON_CONFIGURABLE, Val::number(2.0));
        assert!(h.del_prop(obj, a));
        assert_eq!(h.get_prop(obj, a), GetResult::Missing);
        assert!(!h.del_prop(obj, b), "non-configurable survives delete");
        assert_eq!(h.get_prop(obj, b), GetResult::Value(Val::number(2.0)));
    }

    #[test]
    fn test_dense_array() {
        let mut h = Heap::new(Default::default());
        let arr = h.mk_dense_array(Val::NULL);
        assert!(h.is_array(arr));
        h.array_push(arr, Val::number(10.0));
        h.array_push(arr, Val::number(20.0));
        assert_eq!(h.array_length(arr), 2);
        assert_eq!(h.array_get(arr, 1), Val::number(20.0));
        h.array_set(arr, 4, Val::TRUE);
        assert_eq!(h.array_length(arr), 5);
        assert_eq!(h.array_get(arr, 3), Val::UNDEFINED);
        // Indexed access through the generic property path.
        let idx = mk_name(&mut h, "1");
        assert_eq!(h.get_prop(arr, idx), GetResult::Value(Val::number(20.0)));
        let len = mk_name(&mut h, "length");
        assert_eq!(h.get_prop(arr, len), GetResult::Value(Val::number(5.0)));
    }

    #[test]
    fn test_name_as_index() {
        let mut h = Heap::new(Default::default());
        let zero = mk_name(&mut h, "0");
        let one23 = mk_name(&mut h, "123");
        let leading = mk_name(&mut h, "01");
        let alpha = mk_name(&mut h, "x1");
        assert_eq!(h.name_as_index(zero), Some(0));
        assert_eq!(h.name_as_index(one23), Some(123));
        assert_eq!(h.name_as_index(leading), None);
        assert_eq!(h.name_as_index(alpha), None);
    }

    #[test]
    fn test_hidden_destructor_entry() {
        let mut h = Heap::new(Default::default());
        let obj = h.mk_object(Val::NULL);
        let pair = h.mk_dense_array(Val::NULL);
        h.set_destructor(obj, pair);
        assert!(h.obj_flags(obj) & OBJ_HAS_DESTRUCTOR != 0);
        // Hidden entries never surface through get_prop by string name.
        let name = mk_name(&mut h, "anything");
        assert_eq!(h.get_prop(obj, name), GetResult::Missing);
        // The sentinel finds it.
        assert!(h.get_own_prop(obj, Val::foreign(DESTRUCTOR_NAME)).is_some());
    }
}
