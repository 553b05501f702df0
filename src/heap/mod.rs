//! Object model collaborator for the IC and JIT subsystems
//!
//! The compilers in this crate do not own an object heap. They consume a
//! small set of primitives: "get shape of object", "get property offset in
//! shape", "is object in the young generation", "record a write barrier".
//! This module provides those primitives over a compact in-process object
//! model that is rich enough to exercise every stub generator.
//!
//! ## Layout
//!
//! Objects use a fixed header of three pointer-sized slots (shape, property
//! overflow array, elements) followed by in-object property slots. A shape
//! with `N` in-object properties therefore has
//! `instance_size = 24 + N * POINTER_SIZE` and field `k < N` lives at byte
//! offset `instance_size + (k - N) * POINTER_SIZE`. Fields at index `>= N`
//! live in the overflow array, one header slot ahead of the data.

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use string_interner::backend::StringBackend;
use string_interner::symbol::SymbolU32;
use string_interner::{StringInterner, Symbol};

use crate::code::CodeHandle;
use crate::error::{Error, Result};

/// Size of a tagged pointer on the reference architecture, in bytes.
pub const POINTER_SIZE: u32 = 8;

/// Byte offset of the shape pointer in every heap object.
pub const OFFSET_SHAPE: i32 = 0;

/// Byte offset of the property overflow array pointer.
pub const OFFSET_PROPERTIES: i32 = 8;

/// Byte offset of the elements pointer.
pub const OFFSET_ELEMENTS: i32 = 16;

/// Size of the fixed object header (shape, properties, elements).
pub const OBJECT_HEADER_SIZE: u32 = 24;

/// Byte offset of the value slot inside a property cell.
pub const CELL_VALUE_OFFSET: i32 = 8;

/// Slots reserved at the front of a backing array (the length word).
pub const ARRAY_HEADER_SLOTS: u32 = 1;

/// Probes attempted by the inline negative dictionary lookup before giving up.
pub const DICT_NEGATIVE_LOOKUP_PROBES: u32 = 4;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            /// Raw index into the owning table.
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

handle_type!(
    /// Handle to a heap object.
    ObjectRef
);
handle_type!(
    /// Handle to a shape (map). Shapes are immutable and shared.
    ShapeId
);
handle_type!(
    /// Handle to a property cell on a global-like object.
    CellId
);
handle_type!(
    /// Handle to a function object (may be relocated by the collector).
    FunctionId
);
handle_type!(
    /// Handle to a shared function descriptor (stable across relocation).
    SharedId
);
handle_type!(
    /// Handle to a backing array (property overflow or dictionary storage).
    ArrayRef
);
handle_type!(
    /// Handle to a registered native accessor pair.
    AccessorId
);

impl ShapeId {
    /// Identity bits used when hashing a shape into the stub cache.
    #[inline]
    pub fn identity_hash(self) -> u32 {
        self.0.wrapping_mul(0x9e37_79b9)
    }
}

/// Interned property name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId(SymbolU32);

impl NameId {
    /// Raw index of the interned symbol.
    #[inline]
    pub fn index(self) -> usize {
        self.0.to_usize()
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A tagged value as seen by generated code and the object model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Undefined,
    /// Sentinel stored in property cells that have been declared but never
    /// assigned. Generated guards compare against it directly.
    TheHole,
    Bool(bool),
    Smi(i32),
    Number(f64),
    /// Untagged machine integer, only produced by generated code scratch math.
    Int(i64),
    Object(ObjectRef),
    Function(FunctionId),
    Shared(SharedId),
    Cell(CellId),
    Shape(ShapeId),
    Array(ArrayRef),
    Name(NameId),
    Code(CodeHandle),
}

impl Value {
    /// True for values the write barrier must record after a store.
    pub fn is_heap_value(&self) -> bool {
        matches!(
            self,
            Value::Object(_) | Value::Function(_) | Value::Array(_) | Value::Cell(_)
        )
    }

    /// Untagged integer payload, if this is a machine integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Smi(i) => Some(*i as i64),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Interner for property names with precomputed hashes.
///
/// The stub cache keys on name identity, so every name is interned once and
/// carries a stable 32-bit hash computed at intern time.
pub struct NameTable {
    interner: StringInterner<StringBackend>,
    hashes: Vec<u32>,
}

impl NameTable {
    pub fn new() -> Self {
        Self {
            interner: StringInterner::new(),
            hashes: Vec::new(),
        }
    }

    /// Intern a name, computing its hash on first sight.
    pub fn intern(&mut self, name: &str) -> NameId {
        let sym = self.interner.get_or_intern(name);
        let idx = sym.to_usize();
        if idx >= self.hashes.len() {
            self.hashes.resize(idx + 1, 0);
            self.hashes[idx] = hash_name(name);
        }
        NameId(sym)
    }

    /// Resolve a name back to its string.
    pub fn resolve(&self, name: NameId) -> &str {
        self.interner.resolve(name.0).unwrap_or("<unknown>")
    }

    /// Stable hash of an interned name.
    #[inline]
    pub fn hash(&self, name: NameId) -> u32 {
        self.hashes[name.index()]
    }
}

impl Default for NameTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash function for property names (djb2 variant).
#[inline]
pub fn hash_name(name: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in name.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

bitflags! {
    /// Bits carried by a shape describing special receiver behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShapeFlags: u8 {
        /// Property access must consult a named interceptor first.
        const HAS_NAMED_INTERCEPTOR = 1 << 0;
        /// Access checks apply before any specialized path.
        const NEEDS_ACCESS_CHECK = 1 << 1;
        /// The object is a shared namespace object; property presence is
        /// tracked through property cells, not the shape.
        const GLOBAL_LIKE = 1 << 2;
        /// Properties live in a flat dictionary, not shape-described slots.
        const DICTIONARY_MODE = 1 << 3;
        /// The constructor using this as its initial shape has finished its
        /// sequence of `this.x =` assignments.
        const CONSTRUCTION_FINALIZED = 1 << 4;
    }
}

/// Instance type tag stored in every shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceType {
    Object,
    GlobalObject,
    Function,
    Array,
}

impl InstanceType {
    /// Dense discriminant for packing into code flags.
    pub fn discriminant(self) -> u32 {
        match self {
            InstanceType::Object => 0,
            InstanceType::GlobalObject => 1,
            InstanceType::Function => 2,
            InstanceType::Array => 3,
        }
    }

    pub fn from_discriminant(bits: u32) -> Self {
        match bits {
            1 => InstanceType::GlobalObject,
            2 => InstanceType::Function,
            3 => InstanceType::Array,
            _ => InstanceType::Object,
        }
    }
}

/// How a property is stored, as recorded in a shape descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyDetails {
    /// Ordinary data field at the given field index.
    Field { index: u32 },
    /// Compile-time-known function value.
    ConstantFunction(FunctionId),
    /// Native accessor pair invoked through the callback trampoline.
    Callbacks(AccessorId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Descriptor {
    name: NameId,
    details: PropertyDetails,
}

/// Immutable layout descriptor shared by all objects with identical layout.
///
/// Shapes form a transition graph: adding a property to an object with shape
/// `S` either reuses an existing successor or creates a new one. Stubs hold
/// comparison-only references; nothing here is mutated after creation except
/// the transition table, which only grows.
#[derive(Debug, Clone)]
pub struct Shape {
    pub instance_type: InstanceType,
    /// Total instance size in bytes, header included.
    pub instance_size: u32,
    /// Number of property slots stored inside the object itself.
    pub inobject_properties: u32,
    pub flags: ShapeFlags,
    pub prototype: Option<ObjectRef>,
    descriptors: Vec<Descriptor>,
    transitions: FxHashMap<NameId, ShapeId>,
}

impl Shape {
    /// Total number of described properties (in-object and overflow).
    pub fn property_count(&self) -> u32 {
        self.descriptors.len() as u32
    }
}

/// Resolved storage location of a field index under a given shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOffset {
    /// Byte offset from the object start; always within the instance.
    InObject(i32),
    /// Index into the overflow array (before the header adjustment).
    External(u32),
}

/// Compute where field `index` lives under `shape`.
///
/// In-object fields fill the tail of the instance: field `k` of `N` sits at
/// `instance_size + (k - N) * POINTER_SIZE`. Everything past `N` spills to
/// the overflow array.
pub fn field_offset(shape: &Shape, index: u32) -> FieldOffset {
    if index < shape.inobject_properties {
        let offset = shape.instance_size as i64
            + (index as i64 - shape.inobject_properties as i64) * POINTER_SIZE as i64;
        FieldOffset::InObject(offset as i32)
    } else {
        FieldOffset::External(index - shape.inobject_properties)
    }
}

// ---------------------------------------------------------------------------
// Property lookup
// ---------------------------------------------------------------------------

/// Transient result of searching a shape (or dictionary) for a name.
///
/// Created and consumed within one stub-compilation call; never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LookupResult {
    Field { index: u32 },
    ConstantFunction(FunctionId),
    Callbacks(AccessorId),
    /// The receiver's shape carries a named interceptor; what lies behind it
    /// is resolved separately via [`Heap::lookup_behind_interceptor`].
    Interceptor,
    /// Adding this property transitions to the given shape.
    Transition(ShapeId),
    NotFound,
}

impl LookupResult {
    pub fn is_found(&self) -> bool {
        !matches!(self, LookupResult::NotFound | LookupResult::Transition(_))
    }

    /// True if an interceptor's fallback can be compiled inline.
    pub fn is_simple_for_interceptor(&self) -> bool {
        matches!(
            self,
            LookupResult::Field { .. } | LookupResult::Callbacks(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Objects, cells, functions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct JsObject {
    shape: ShapeId,
    inobject: Vec<Value>,
    /// Overflow property storage, or dictionary storage in dictionary mode.
    properties: Option<ArrayRef>,
    in_young: bool,
}

/// Indirection box for a named property on a global-like object.
#[derive(Debug, Clone, Copy)]
pub struct PropertyCell {
    pub value: Value,
}

#[derive(Debug, Clone, Copy)]
struct JsFunction {
    shared: SharedId,
    in_young: bool,
}

/// What a constructor assigns to one `this.x` slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThisAssignment {
    /// `this.x = arguments[k]`.
    Argument(u8),
    /// `this.x = <constant>`.
    Constant(Value),
}

/// Stable descriptor of a function: survives relocation of the function
/// object itself, so specialized call sites compare this identity instead of
/// the (movable) function pointer.
#[derive(Debug, Clone)]
pub struct SharedFunctionInfo {
    pub name: NameId,
    pub arity: u8,
    /// Currently installed code (baseline or optimized).
    pub code: Option<CodeHandle>,
    /// Baseline code kept as the fallback when optimized code is discarded.
    pub baseline_code: Option<CodeHandle>,
    /// Initial shape used by the inline construct stub, when finalized.
    pub initial_shape: Option<ShapeId>,
    /// The statically-known `this.x = ...` assignments, in program order.
    pub this_assignments: Vec<(NameId, ThisAssignment)>,
}

/// Native accessor callbacks, invoked through the callback trampoline.
#[derive(Clone, Copy)]
pub struct NativeAccessor {
    pub getter: fn(&mut Heap, ObjectRef, NameId) -> Value,
    pub setter: fn(&mut Heap, ObjectRef, NameId, Value),
}

/// User-supplied named property trap. Returning `None` means the interceptor
/// declines and lookup falls through to the ordinary path.
#[derive(Clone, Copy)]
pub struct NamedInterceptor {
    pub getter: fn(&mut Heap, ObjectRef, NameId) -> Option<Value>,
}

/// One recorded write-barrier entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub object: ObjectRef,
    pub offset: i32,
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

/// The object model the compilers compile against.
///
/// This is deliberately small: enough structure to observe shapes, walk
/// prototype chains, store fields, and invoke accessors, with explicit
/// capacity limits so allocation-failure paths are exercisable.
pub struct Heap {
    shapes: Vec<Shape>,
    objects: Vec<JsObject>,
    arrays: Vec<Vec<Value>>,
    cells: Vec<PropertyCell>,
    functions: Vec<JsFunction>,
    shared: Vec<SharedFunctionInfo>,
    accessors: Vec<NativeAccessor>,
    interceptors: FxHashMap<ShapeId, NamedInterceptor>,
    global_cells: FxHashMap<(ObjectRef, NameId), CellId>,
    global_proxies: FxHashMap<ObjectRef, ObjectRef>,
    write_barrier: Vec<WriteRecord>,
    pub names: NameTable,
    /// Remaining young-generation allocation budget, in objects.
    young_budget: usize,
    /// Remaining property-cell budget.
    cell_budget: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            shapes: Vec::new(),
            objects: Vec::new(),
            arrays: Vec::new(),
            cells: Vec::new(),
            functions: Vec::new(),
            shared: Vec::new(),
            accessors: Vec::new(),
            interceptors: FxHashMap::default(),
            global_cells: FxHashMap::default(),
            global_proxies: FxHashMap::default(),
            write_barrier: Vec::new(),
            names: NameTable::new(),
            young_budget: 1 << 16,
            cell_budget: 1 << 16,
        }
    }

    /// Restrict the young-generation budget (used to force allocation
    /// failures in tests).
    pub fn set_young_budget(&mut self, objects: usize) {
        self.young_budget = objects;
    }

    /// Restrict the property-cell budget.
    pub fn set_cell_budget(&mut self, cells: usize) {
        self.cell_budget = cells;
    }

    // -- shapes ------------------------------------------------------------

    /// Create a root shape with `inobject` in-object slots.
    pub fn new_shape(&mut self, instance_type: InstanceType, inobject: u32) -> ShapeId {
        self.new_shape_with_flags(instance_type, inobject, ShapeFlags::empty())
    }

    pub fn new_shape_with_flags(
        &mut self,
        instance_type: InstanceType,
        inobject: u32,
        flags: ShapeFlags,
    ) -> ShapeId {
        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(Shape {
            instance_type,
            instance_size: OBJECT_HEADER_SIZE + inobject * POINTER_SIZE,
            inobject_properties: inobject,
            flags,
            prototype: None,
            descriptors: Vec::new(),
            transitions: FxHashMap::default(),
        });
        id
    }

    pub fn shape(&self, id: ShapeId) -> &Shape {
        &self.shapes[id.index()]
    }

    /// Set the prototype link of a shape. Used while wiring up test chains;
    /// live shapes are never re-linked.
    pub fn set_prototype(&mut self, shape: ShapeId, proto: ObjectRef) {
        self.shapes[shape.index()].prototype = proto.into();
    }

    pub fn set_shape_flags(&mut self, shape: ShapeId, flags: ShapeFlags) {
        self.shapes[shape.index()].flags |= flags;
    }

    /// Describe an existing property on `shape` without transitioning.
    pub fn add_descriptor(&mut self, shape: ShapeId, name: NameId, details: PropertyDetails) {
        self.shapes[shape.index()]
            .descriptors
            .push(Descriptor { name, details });
    }

    /// Find or create the successor shape for adding a data field `name`.
    ///
    /// Structural sharing: repeated additions of the same name to the same
    /// base shape yield the same successor.
    pub fn transition_add_field(&mut self, base: ShapeId, name: NameId) -> ShapeId {
        if let Some(&existing) = self.shapes[base.index()].transitions.get(&name) {
            return existing;
        }
        let (instance_type, inobject, flags, prototype, mut descriptors) = {
            let s = &self.shapes[base.index()];
            (
                s.instance_type,
                s.inobject_properties,
                s.flags,
                s.prototype,
                s.descriptors.clone(),
            )
        };
        let index = descriptors.len() as u32;
        descriptors.push(Descriptor {
            name,
            details: PropertyDetails::Field { index },
        });
        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(Shape {
            instance_type,
            instance_size: OBJECT_HEADER_SIZE + inobject * POINTER_SIZE,
            inobject_properties: inobject,
            flags,
            prototype,
            descriptors,
            transitions: FxHashMap::default(),
        });
        self.shapes[base.index()].transitions.insert(name, id);
        id
    }

    /// The transition target for adding `name` to `shape`, if one exists.
    pub fn lookup_transition(&self, shape: ShapeId, name: NameId) -> Option<ShapeId> {
        self.shapes[shape.index()].transitions.get(&name).copied()
    }

    // -- objects -----------------------------------------------------------

    /// Allocate an object with the given shape in the old generation.
    pub fn new_object(&mut self, shape: ShapeId) -> ObjectRef {
        self.allocate_object(shape, false)
    }

    /// Allocate in the young generation, observing the allocation budget.
    pub fn allocate_young(&mut self, shape: ShapeId) -> Result<ObjectRef> {
        if self.young_budget == 0 {
            return Err(Error::AllocationFailed("young generation exhausted"));
        }
        self.young_budget -= 1;
        Ok(self.allocate_object(shape, true))
    }

    fn allocate_object(&mut self, shape: ShapeId, in_young: bool) -> ObjectRef {
        let inobject = self.shapes[shape.index()].inobject_properties as usize;
        let id = ObjectRef(self.objects.len() as u32);
        self.objects.push(JsObject {
            shape,
            inobject: vec![Value::Undefined; inobject],
            properties: None,
            in_young,
        });
        id
    }

    pub fn shape_of(&self, object: ObjectRef) -> ShapeId {
        self.objects[object.index()].shape
    }

    pub fn instance_size_of(&self, shape: ShapeId) -> u32 {
        self.shapes[shape.index()].instance_size
    }

    pub fn in_object_property_count_of(&self, shape: ShapeId) -> u32 {
        self.shapes[shape.index()].inobject_properties
    }

    pub fn is_in_young_generation(&self, object: ObjectRef) -> bool {
        self.objects[object.index()].in_young
    }

    /// Promote an object out of the young generation (simulating a scavenge).
    pub fn promote(&mut self, object: ObjectRef) {
        self.objects[object.index()].in_young = false;
    }

    pub fn prototype_of(&self, shape: ShapeId) -> Option<ObjectRef> {
        self.shapes[shape.index()].prototype
    }

    // -- raw field access (the view generated code has) --------------------

    /// Load a header or in-object slot by byte offset.
    pub fn load_raw_field(&mut self, object: ObjectRef, offset: i32) -> Value {
        match offset {
            OFFSET_SHAPE => Value::Shape(self.objects[object.index()].shape),
            OFFSET_PROPERTIES => {
                let arr = self.ensure_properties_array(object, 4);
                Value::Array(arr)
            }
            OFFSET_ELEMENTS => Value::Undefined,
            _ => {
                let slot = Self::inobject_slot(offset);
                self.objects[object.index()].inobject[slot]
            }
        }
    }

    /// Store a header or in-object slot by byte offset. Storing a shape at
    /// offset 0 is how transition stores rewrite the object's layout.
    pub fn store_raw_field(&mut self, object: ObjectRef, offset: i32, value: Value) {
        match offset {
            OFFSET_SHAPE => {
                if let Value::Shape(s) = value {
                    self.objects[object.index()].shape = s;
                    let inobject = self.shapes[s.index()].inobject_properties as usize;
                    let slots = &mut self.objects[object.index()].inobject;
                    if slots.len() < inobject {
                        slots.resize(inobject, Value::Undefined);
                    }
                }
            }
            OFFSET_PROPERTIES => {
                if let Value::Array(a) = value {
                    self.objects[object.index()].properties = Some(a);
                }
            }
            OFFSET_ELEMENTS => {}
            _ => {
                let slot = Self::inobject_slot(offset);
                let slots = &mut self.objects[object.index()].inobject;
                if slot >= slots.len() {
                    slots.resize(slot + 1, Value::Undefined);
                }
                slots[slot] = value;
            }
        }
    }

    #[inline]
    fn inobject_slot(offset: i32) -> usize {
        debug_assert!(offset >= OBJECT_HEADER_SIZE as i32);
        ((offset - OBJECT_HEADER_SIZE as i32) / POINTER_SIZE as i32) as usize
    }

    // -- backing arrays ----------------------------------------------------

    /// Allocate a backing array with the given number of data slots.
    pub fn new_array(&mut self, data_slots: u32) -> ArrayRef {
        let id = ArrayRef(self.arrays.len() as u32);
        let mut storage = vec![Value::Undefined; (ARRAY_HEADER_SLOTS + data_slots) as usize];
        storage[0] = Value::Smi(data_slots as i32);
        self.arrays.push(storage);
        id
    }

    pub fn array_len(&self, array: ArrayRef) -> u32 {
        match self.arrays[array.index()][0] {
            Value::Smi(n) => n as u32,
            _ => 0,
        }
    }

    pub fn load_array_slot(&self, array: ArrayRef, slot: u32) -> Value {
        self.arrays[array.index()]
            .get(slot as usize)
            .copied()
            .unwrap_or(Value::Undefined)
    }

    pub fn store_array_slot(&mut self, array: ArrayRef, slot: u32, value: Value) {
        let storage = &mut self.arrays[array.index()];
        if (slot as usize) < storage.len() {
            storage[slot as usize] = value;
        }
    }

    /// Get the object's overflow array, allocating one with room for
    /// `min_slots` data slots if absent.
    pub fn ensure_properties_array(&mut self, object: ObjectRef, min_slots: u32) -> ArrayRef {
        if let Some(existing) = self.objects[object.index()].properties {
            return existing;
        }
        let arr = self.new_array(min_slots);
        self.objects[object.index()].properties = Some(arr);
        arr
    }

    /// Overflow-array capacity currently available to the object.
    pub fn properties_capacity(&self, object: ObjectRef) -> u32 {
        self.objects[object.index()]
            .properties
            .map(|a| self.array_len(a))
            .unwrap_or(0)
    }

    /// Grow the overflow array to hold at least `min_slots` data slots,
    /// copying existing values. This is the slow path behind transition
    /// stores that run out of spare storage.
    pub fn grow_properties(&mut self, object: ObjectRef, min_slots: u32) -> ArrayRef {
        let old = self.objects[object.index()].properties;
        let new_slots = min_slots.max(4).next_power_of_two();
        let new_arr = self.new_array(new_slots);
        if let Some(old_arr) = old {
            let len = self.array_len(old_arr);
            for i in 0..len {
                let v = self.load_array_slot(old_arr, ARRAY_HEADER_SLOTS + i);
                self.store_array_slot(new_arr, ARRAY_HEADER_SLOTS + i, v);
            }
        }
        self.objects[object.index()].properties = Some(new_arr);
        new_arr
    }

    // -- typed field access (host-side convenience over the raw view) ------

    /// Read field `index` of `object` under its current shape.
    pub fn load_field(&mut self, object: ObjectRef, index: u32) -> Value {
        let shape = self.shape_of(object);
        match field_offset(self.shape(shape), index) {
            FieldOffset::InObject(offset) => self.load_raw_field(object, offset),
            FieldOffset::External(ext) => {
                let arr = self.ensure_properties_array(object, ext + 1);
                self.load_array_slot(arr, ARRAY_HEADER_SLOTS + ext)
            }
        }
    }

    /// Write field `index` of `object`, recording a write barrier for heap
    /// values.
    pub fn store_field(&mut self, object: ObjectRef, index: u32, value: Value) {
        let shape = self.shape_of(object);
        match field_offset(self.shape(shape), index) {
            FieldOffset::InObject(offset) => {
                self.store_raw_field(object, offset, value);
                if value.is_heap_value() {
                    self.record_write(object, offset);
                }
            }
            FieldOffset::External(ext) => {
                let arr = self.ensure_properties_array(object, ext + 1);
                self.store_array_slot(arr, ARRAY_HEADER_SLOTS + ext, value);
                if value.is_heap_value() {
                    self.record_write(object, OFFSET_PROPERTIES);
                }
            }
        }
    }

    /// Record that `object` now references a heap value at `offset`.
    pub fn record_write(&mut self, object: ObjectRef, offset: i32) {
        self.write_barrier.push(WriteRecord { object, offset });
    }

    /// Drain the write-barrier log (tests inspect this).
    pub fn take_write_records(&mut self) -> Vec<WriteRecord> {
        std::mem::take(&mut self.write_barrier)
    }

    // -- property lookup ---------------------------------------------------

    /// Search `shape` for `name`.
    pub fn lookup_property(&self, shape: ShapeId, name: NameId) -> LookupResult {
        let s = &self.shapes[shape.index()];
        if s.flags.contains(ShapeFlags::HAS_NAMED_INTERCEPTOR) {
            return LookupResult::Interceptor;
        }
        self.lookup_own(shape, name)
    }

    /// Search `shape`'s own descriptors, ignoring any interceptor. This is
    /// the "what would be found if the interceptor declines" follow-up.
    pub fn lookup_behind_interceptor(&self, shape: ShapeId, name: NameId) -> LookupResult {
        self.lookup_own(shape, name)
    }

    fn lookup_own(&self, shape: ShapeId, name: NameId) -> LookupResult {
        let s = &self.shapes[shape.index()];
        for desc in &s.descriptors {
            if desc.name == name {
                return match desc.details {
                    PropertyDetails::Field { index } => LookupResult::Field { index },
                    PropertyDetails::ConstantFunction(f) => LookupResult::ConstantFunction(f),
                    PropertyDetails::Callbacks(a) => LookupResult::Callbacks(a),
                };
            }
        }
        if let Some(&target) = s.transitions.get(&name) {
            return LookupResult::Transition(target);
        }
        LookupResult::NotFound
    }

    /// Walk the prototype chain from `object` looking for `name`; returns the
    /// holder and lookup result on success.
    pub fn lookup_on_chain(
        &self,
        object: ObjectRef,
        name: NameId,
    ) -> Option<(ObjectRef, LookupResult)> {
        let mut current = object;
        loop {
            let shape = self.shape_of(current);
            let result = self.lookup_property(shape, name);
            if result.is_found() {
                return Some((current, result));
            }
            // Dictionary-held properties are not shape-described and thus
            // not specializable; the generic path serves them.
            current = self.prototype_of(shape)?;
        }
    }

    // -- property cells ----------------------------------------------------

    /// Get or lazily create the property cell for `name` on a global-like
    /// object. Cell creation can fail when the cell budget is exhausted.
    pub fn ensure_property_cell(&mut self, object: ObjectRef, name: NameId) -> Result<CellId> {
        if let Some(&cell) = self.global_cells.get(&(object, name)) {
            return Ok(cell);
        }
        if self.cell_budget == 0 {
            return Err(Error::AllocationFailed("property cell space exhausted"));
        }
        self.cell_budget -= 1;
        let id = CellId(self.cells.len() as u32);
        self.cells.push(PropertyCell {
            value: Value::TheHole,
        });
        self.global_cells.insert((object, name), id);
        Ok(id)
    }

    pub fn cell_value(&self, cell: CellId) -> Value {
        self.cells[cell.index()].value
    }

    pub fn set_cell_value(&mut self, cell: CellId, value: Value) {
        self.cells[cell.index()].value = value;
    }

    // -- dictionary-mode storage -------------------------------------------
    //
    // Dictionary storage is a flat array: [capacity, k0, v0, k1, v1, ...]
    // probed with triangular steps from the name hash. The layout is shared
    // with generated code: the inline negative-lookup guard probes the same
    // slots the host-side insert fills.

    /// Put `object` in dictionary mode with the given initial capacity
    /// (rounded up to a power of two).
    pub fn make_dictionary(&mut self, object: ObjectRef, capacity: u32) {
        let capacity = capacity.max(4).next_power_of_two();
        let arr = self.new_dictionary_array(capacity);
        self.objects[object.index()].properties = Some(arr);
        let shape = self.shape_of(object);
        self.shapes[shape.index()].flags |= ShapeFlags::DICTIONARY_MODE;
    }

    fn new_dictionary_array(&mut self, capacity: u32) -> ArrayRef {
        let id = ArrayRef(self.arrays.len() as u32);
        let mut storage = vec![Value::Undefined; (1 + capacity * 2) as usize];
        storage[0] = Value::Smi(capacity as i32);
        self.arrays.push(storage);
        id
    }

    fn dictionary_array(&self, object: ObjectRef) -> Option<ArrayRef> {
        self.objects[object.index()].properties
    }

    /// Slot index for probe `i` of `hash` within `capacity` slots.
    #[inline]
    pub fn dictionary_probe(hash: u32, probe: u32, capacity: u32) -> u32 {
        // Triangular probing: hash, hash+1, hash+3, hash+6, ...
        (hash.wrapping_add(probe * (probe + 1) / 2)) & (capacity - 1)
    }

    /// Insert into the object's dictionary, growing on high load.
    pub fn dictionary_insert(&mut self, object: ObjectRef, name: NameId, value: Value) {
        let arr = match self.dictionary_array(object) {
            Some(a) => a,
            None => {
                self.make_dictionary(object, 4);
                self.dictionary_array(object).unwrap()
            }
        };
        let capacity = match self.load_array_slot(arr, 0) {
            Value::Smi(c) => c as u32,
            _ => 0,
        };
        let hash = self.names.hash(name);
        for probe in 0..capacity {
            let slot = Self::dictionary_probe(hash, probe, capacity);
            let key_slot = 1 + slot * 2;
            match self.load_array_slot(arr, key_slot) {
                Value::Name(existing) if existing == name => {
                    self.store_array_slot(arr, key_slot + 1, value);
                    return;
                }
                Value::Undefined => {
                    self.store_array_slot(arr, key_slot, Value::Name(name));
                    self.store_array_slot(arr, key_slot + 1, value);
                    return;
                }
                _ => {}
            }
        }
        // Table full: rehash into a doubled table, then retry.
        self.grow_dictionary(object, capacity * 2);
        self.dictionary_insert(object, name, value);
    }

    fn grow_dictionary(&mut self, object: ObjectRef, new_capacity: u32) {
        let old_arr = self.dictionary_array(object).unwrap();
        let old_capacity = match self.load_array_slot(old_arr, 0) {
            Value::Smi(c) => c as u32,
            _ => 0,
        };
        let entries: Vec<(NameId, Value)> = (0..old_capacity)
            .filter_map(|slot| {
                let key_slot = 1 + slot * 2;
                match self.load_array_slot(old_arr, key_slot) {
                    Value::Name(n) => {
                        Some((n, self.load_array_slot(old_arr, key_slot + 1)))
                    }
                    _ => None,
                }
            })
            .collect();
        let new_arr = self.new_dictionary_array(new_capacity.max(4).next_power_of_two());
        self.objects[object.index()].properties = Some(new_arr);
        for (name, value) in entries {
            self.dictionary_insert(object, name, value);
        }
    }

    /// Host-side dictionary lookup, mirroring the probing sequence the
    /// generated negative-lookup guard uses.
    pub fn dictionary_lookup(&self, object: ObjectRef, name: NameId) -> Option<Value> {
        let arr = self.dictionary_array(object)?;
        let capacity = match self.load_array_slot(arr, 0) {
            Value::Smi(c) => c as u32,
            _ => return None,
        };
        let hash = self.names.hash(name);
        for probe in 0..capacity {
            let slot = Self::dictionary_probe(hash, probe, capacity);
            let key_slot = 1 + slot * 2;
            match self.load_array_slot(arr, key_slot) {
                Value::Name(existing) if existing == name => {
                    return Some(self.load_array_slot(arr, key_slot + 1));
                }
                Value::Undefined => return None,
                _ => {}
            }
        }
        None
    }

    // -- functions ---------------------------------------------------------

    /// Register a shared function descriptor.
    pub fn new_shared_function(&mut self, name: &str, arity: u8) -> SharedId {
        let name = self.names.intern(name);
        let id = SharedId(self.shared.len() as u32);
        self.shared.push(SharedFunctionInfo {
            name,
            arity,
            code: None,
            baseline_code: None,
            initial_shape: None,
            this_assignments: Vec::new(),
        });
        id
    }

    /// Instantiate a function object for a shared descriptor.
    pub fn new_function(&mut self, shared: SharedId, in_young: bool) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(JsFunction { shared, in_young });
        id
    }

    pub fn shared_of(&self, function: FunctionId) -> SharedId {
        self.functions[function.index()].shared
    }

    pub fn function_in_young(&self, function: FunctionId) -> bool {
        self.functions[function.index()].in_young
    }

    pub fn shared_info(&self, shared: SharedId) -> &SharedFunctionInfo {
        &self.shared[shared.index()]
    }

    pub fn shared_info_mut(&mut self, shared: SharedId) -> &mut SharedFunctionInfo {
        &mut self.shared[shared.index()]
    }

    /// All shared descriptors (the debugger iterates these to discard
    /// optimized code).
    pub fn shared_ids(&self) -> impl Iterator<Item = SharedId> {
        (0..self.shared.len() as u32).map(SharedId)
    }

    // -- accessors and interceptors ----------------------------------------

    pub fn register_accessor(&mut self, accessor: NativeAccessor) -> AccessorId {
        let id = AccessorId(self.accessors.len() as u32);
        self.accessors.push(accessor);
        id
    }

    pub fn accessor(&self, id: AccessorId) -> NativeAccessor {
        self.accessors[id.index()]
    }

    /// The distinguished receiver proxy substituted for a namespace object
    /// when it is used as a call receiver. Created lazily, one per global.
    pub fn global_receiver_proxy(&mut self, global: ObjectRef) -> ObjectRef {
        if let Some(&proxy) = self.global_proxies.get(&global) {
            return proxy;
        }
        let shape = self.new_shape(InstanceType::Object, 0);
        let proxy = self.new_object(shape);
        self.global_proxies.insert(global, proxy);
        proxy
    }

    /// Attach a named interceptor to every object with `shape`.
    pub fn register_interceptor(&mut self, shape: ShapeId, interceptor: NamedInterceptor) {
        self.shapes[shape.index()].flags |= ShapeFlags::HAS_NAMED_INTERCEPTOR;
        self.interceptors.insert(shape, interceptor);
    }

    pub fn interceptor_for(&self, shape: ShapeId) -> Option<NamedInterceptor> {
        self.interceptors.get(&shape).copied()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
