//! The object registry: every heap object a VM ever allocates lives here,
//! in a slot vector indexed by [`ObjRef`]. Freed slots go on a free list
//! and are reused by later allocations.
//!
//! The registry also keeps the allocated-byte counter the collector's
//! trigger is based on. Compile-time allocations (code objects, constant
//! strings, compile-time functions) go through [`Heap::alloc`] directly and
//! never trigger a collection; the VM's runtime allocation helper checks
//! [`Heap::should_collect`] first, assembles roots, and runs the collector
//! before the allocation lands.

use crate::Error;
use crate::GC_THRESHOLD;
use crate::value::{
    ClassObject, CodeObject, FunctionObject, InstanceObject, NativeObject, ObjRef, ObjectKind,
    Value,
};

/// A registered heap object: the traceable header plus the payload.
#[derive(Debug)]
pub struct HeapObject {
    /// Set during the mark phase, cleared by sweep on survivors.
    pub marked: bool,
    /// Bytes charged to the allocation counter for this object.
    pub size: usize,
    pub kind: ObjectKind,
}

/// The per-VM object registry.
#[derive(Debug)]
pub struct Heap {
    pub(crate) slots: Vec<Option<HeapObject>>,
    pub(crate) free: Vec<usize>,
    bytes_allocated: usize,
    threshold: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_threshold(GC_THRESHOLD)
    }

    /// A heap with a custom GC trigger threshold. Tests use tiny thresholds
    /// to force collections on small programs.
    pub fn with_threshold(threshold: usize) -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            threshold,
        }
    }

    /// Registers a new object and returns its handle.
    ///
    /// This never collects; the VM decides when to run the collector (see
    /// the module docs).
    pub fn alloc(&mut self, kind: ObjectKind) -> ObjRef {
        let size = std::mem::size_of::<HeapObject>() + kind.payload_bytes();
        self.bytes_allocated += size;
        let object = HeapObject {
            marked: false,
            size,
            kind,
        };

        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(object);
            ObjRef(index as u32)
        } else {
            let index = self.slots.len();
            self.slots.push(Some(object));
            ObjRef(index as u32)
        }
    }

    /// Whether allocating `kind` next would push the byte counter over the
    /// collection threshold.
    pub fn should_collect(&self, kind: &ObjectKind) -> bool {
        let size = std::mem::size_of::<HeapObject>() + kind.payload_bytes();
        self.bytes_allocated + size > self.threshold
    }

    /// Frees one slot, releasing its bytes. Used by the sweep phase.
    pub(crate) fn free_slot(&mut self, index: usize) {
        if let Some(object) = self.slots[index].take() {
            self.bytes_allocated -= object.size;
            self.free.push(index);
        }
    }

    /// Number of live objects in the registry.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Total bytes currently charged to live objects.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // ----------------------------------------------------------------
    // Accessors. A stale handle here means root assembly missed an edge;
    // it surfaces as a fatal error rather than silent corruption.

    pub fn object(&self, obj: ObjRef) -> Result<&HeapObject, Error> {
        self.slots
            .get(obj.index())
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| Error::IndexOutOfRange(format!("dead object handle {}", obj.0)))
    }

    pub fn object_mut(&mut self, obj: ObjRef) -> Result<&mut HeapObject, Error> {
        self.slots
            .get_mut(obj.index())
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| Error::IndexOutOfRange(format!("dead object handle {}", obj.0)))
    }

    fn wrong_kind(expected: &'static str, actual: &'static str) -> Error {
        Error::TypeError(format!("expected a {expected} object, found {actual}"))
    }

    pub fn string(&self, obj: ObjRef) -> Result<&str, Error> {
        match &self.object(obj)?.kind {
            ObjectKind::Str(s) => Ok(s),
            other => Err(Self::wrong_kind("STRING", other.kind_name())),
        }
    }

    pub fn code(&self, obj: ObjRef) -> Result<&CodeObject, Error> {
        match &self.object(obj)?.kind {
            ObjectKind::Code(co) => Ok(co),
            other => Err(Self::wrong_kind("CODE", other.kind_name())),
        }
    }

    pub fn code_mut(&mut self, obj: ObjRef) -> Result<&mut CodeObject, Error> {
        match &mut self.object_mut(obj)?.kind {
            ObjectKind::Code(co) => Ok(co),
            other => Err(Self::wrong_kind("CODE", other.kind_name())),
        }
    }

    pub fn native(&self, obj: ObjRef) -> Result<&NativeObject, Error> {
        match &self.object(obj)?.kind {
            ObjectKind::Native(native) => Ok(native),
            other => Err(Self::wrong_kind("NATIVE", other.kind_name())),
        }
    }

    pub fn function(&self, obj: ObjRef) -> Result<&FunctionObject, Error> {
        match &self.object(obj)?.kind {
            ObjectKind::Function(function) => Ok(function),
            other => Err(Self::wrong_kind("FUNCTION", other.kind_name())),
        }
    }

    pub fn function_mut(&mut self, obj: ObjRef) -> Result<&mut FunctionObject, Error> {
        match &mut self.object_mut(obj)?.kind {
            ObjectKind::Function(function) => Ok(function),
            other => Err(Self::wrong_kind("FUNCTION", other.kind_name())),
        }
    }

    pub fn cell(&self, obj: ObjRef) -> Result<Value, Error> {
        match &self.object(obj)?.kind {
            ObjectKind::Cell(value) => Ok(*value),
            other => Err(Self::wrong_kind("CELL", other.kind_name())),
        }
    }

    pub fn cell_mut(&mut self, obj: ObjRef) -> Result<&mut Value, Error> {
        match &mut self.object_mut(obj)?.kind {
            ObjectKind::Cell(value) => Ok(value),
            other => Err(Self::wrong_kind("CELL", other.kind_name())),
        }
    }

    pub fn class(&self, obj: ObjRef) -> Result<&ClassObject, Error> {
        match &self.object(obj)?.kind {
            ObjectKind::Class(class) => Ok(class),
            other => Err(Self::wrong_kind("CLASS", other.kind_name())),
        }
    }

    pub fn class_mut(&mut self, obj: ObjRef) -> Result<&mut ClassObject, Error> {
        match &mut self.object_mut(obj)?.kind {
            ObjectKind::Class(class) => Ok(class),
            other => Err(Self::wrong_kind("CLASS", other.kind_name())),
        }
    }

    pub fn instance(&self, obj: ObjRef) -> Result<&InstanceObject, Error> {
        match &self.object(obj)?.kind {
            ObjectKind::Instance(instance) => Ok(instance),
            other => Err(Self::wrong_kind("INSTANCE", other.kind_name())),
        }
    }

    pub fn instance_mut(&mut self, obj: ObjRef) -> Result<&mut InstanceObject, Error> {
        match &mut self.object_mut(obj)?.kind {
            ObjectKind::Instance(instance) => Ok(instance),
            other => Err(Self::wrong_kind("INSTANCE", other.kind_name())),
        }
    }

    // ----------------------------------------------------------------
    // Presentation, shared by the disassembler and the REPL.

    /// Short tag for a value's runtime type.
    pub fn value_type_string(&self, value: Value) -> String {
        match value {
            Value::Number(_) => "NUMBER".to_owned(),
            Value::Boolean(_) => "BOOLEAN".to_owned(),
            Value::Object(obj) => match self.object(obj) {
                Ok(object) => object.kind.kind_name().to_owned(),
                Err(_) => "DEAD".to_owned(),
            },
        }
    }

    /// Human-readable rendering of a value, used for constants in
    /// disassembly and for REPL results.
    pub fn constant_to_string(&self, value: Value) -> String {
        match value {
            Value::Number(n) => format!("{n}"),
            Value::Boolean(b) => format!("{b}"),
            Value::Object(obj) => match self.object(obj) {
                Err(_) => format!("<dead object {}>", obj.0),
                Ok(object) => match &object.kind {
                    ObjectKind::Str(s) => format!("\"{s}\""),
                    ObjectKind::Code(co) => format!("code: {}/{}", co.name, co.arity),
                    ObjectKind::Native(native) => {
                        format!("{}/{}", native.name, native.arity)
                    }
                    ObjectKind::Function(function) => match self.code(function.co) {
                        Ok(co) => format!("{}/{}", co.name, co.arity),
                        Err(_) => "<function>".to_owned(),
                    },
                    ObjectKind::Cell(inner) => {
                        format!("cell: {}", self.constant_to_string(*inner))
                    }
                    ObjectKind::Class(class) => format!("class: {}", class.name),
                    ObjectKind::Instance(instance) => match self.class(instance.class) {
                        Ok(class) => format!("instance: {}", class.name),
                        Err(_) => "<instance>".to_owned(),
                    },
                },
            },
        }
    }
}
