//! The tagged value and the heap-object model shared by the compiler, the
//! VM, and the collector.
//!
//! A [`Value`] is a small `Copy` union: numbers and booleans are immediate,
//! everything else is an [`ObjRef`] handle into the [`crate::heap::Heap`].
//! Ownership of every object lives in the heap's registry; handles held by
//! the stack, globals, constant pools, cells, and instances are non-owning
//! borrows that the collector traces.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::Error;

/// Handle to a heap object: an index into the owning VM's object registry.
///
/// Handles are only meaningful for the heap that issued them. A handle is
/// kept alive by being reachable from a GC root; a stale handle after a
/// collection is a bug in root assembly, not a recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// An Eva value: a tagged union of the three runtime shapes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// IEEE-754 double.
    Number(f64),
    /// True / false.
    Boolean(bool),
    /// Handle to a heap object (string, code, function, cell, class, …).
    Object(ObjRef),
}

impl Value {
    pub fn as_number(self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_boolean(self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_object(self) -> Option<ObjRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub(crate) fn expect_number(self, what: &str) -> Result<f64, Error> {
        self.as_number()
            .ok_or_else(|| Error::TypeError(format!("{what} expects a number")))
    }
}

/// A compile-time local variable slot, tagged with the block nesting level
/// that declared it. `CodeObject::locals` is a scratch stack: entries at the
/// exiting level are popped by the compiler on scope exit.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVar {
    pub name: String,
    pub scope_level: usize,
}

/// The compiled artifact for one function (or the top-level script).
#[derive(Debug, Clone, Default)]
pub struct CodeObject {
    /// Unit name, usually the function name ("main" for the script).
    pub name: String,
    /// Number of parameters.
    pub arity: usize,
    /// Constant pool.
    pub constants: Vec<Value>,
    /// Bytecode.
    pub code: Vec<u8>,
    /// Current block nesting level (compile-time only).
    pub scope_level: usize,
    /// Local variable scratch stack (compile-time only).
    pub locals: Vec<LocalVar>,
    /// Cell names: `[0..free_count)` are free variables captured from the
    /// enclosing scope, the rest are own cells (locals that inner closures
    /// capture).
    pub cell_names: Vec<String>,
    /// Number of leading free variables in `cell_names`.
    pub free_count: usize,
}

impl CodeObject {
    pub fn new(name: impl Into<String>, arity: usize) -> Self {
        CodeObject {
            name: name.into(),
            arity,
            ..Default::default()
        }
    }

    /// Registers a local at the current scope level.
    pub fn add_local(&mut self, name: impl Into<String>) {
        self.locals.push(LocalVar {
            name: name.into(),
            scope_level: self.scope_level,
        });
    }

    /// Resolves a local slot by name, last declaration first so inner
    /// shadowing declarations win.
    pub fn get_local_index(&self, name: &str) -> Option<usize> {
        self.locals.iter().rposition(|local| local.name == name)
    }

    /// Resolves a cell slot by name, last declaration first.
    pub fn get_cell_index(&self, name: &str) -> Option<usize> {
        self.cell_names.iter().rposition(|cell| cell == name)
    }
}

/// A native function reads its arguments from the VM stack via `peek` and
/// pushes its result; the calling convention (dropping the arguments and the
/// callee, re-pushing the result) is handled by `OP_CALL`.
pub type NativeFn = fn(&mut crate::vm::Vm) -> Result<(), Error>;

/// A built-in function installed in the global table at VM startup.
#[derive(Debug, Clone)]
pub struct NativeObject {
    pub name: String,
    pub arity: usize,
    pub function: NativeFn,
}

/// A callable function: a code object plus captured cells.
///
/// `cells[0..co.free_count)` are the captured free-variable cells, in
/// `cell_names` order; entries past `free_count` are own cells created
/// lazily by `OP_SET_CELL` and truncated away on every call.
#[derive(Debug, Clone)]
pub struct FunctionObject {
    pub co: ObjRef,
    pub cells: SmallVec<[ObjRef; 4]>,
}

/// A class: shared properties (methods, mostly) and an optional superclass.
#[derive(Debug, Clone)]
pub struct ClassObject {
    pub name: String,
    pub properties: HashMap<String, Value>,
    pub super_class: Option<ObjRef>,
}

/// An instance: its class and its own property map.
#[derive(Debug, Clone)]
pub struct InstanceObject {
    pub class: ObjRef,
    pub properties: HashMap<String, Value>,
}

/// The payload of a heap object.
#[derive(Debug, Clone)]
pub enum ObjectKind {
    /// UTF-8 string.
    Str(String),
    /// Compiled function body.
    Code(CodeObject),
    /// Built-in function.
    Native(NativeObject),
    /// Function with captured cells.
    Function(FunctionObject),
    /// Single-slot box shared between a function and its closures.
    Cell(Value),
    /// Class with single inheritance.
    Class(ClassObject),
    /// Instance of a class.
    Instance(InstanceObject),
}

impl ObjectKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjectKind::Str(_) => "STRING",
            ObjectKind::Code(_) => "CODE",
            ObjectKind::Native(_) => "NATIVE",
            ObjectKind::Function(_) => "FUNCTION",
            ObjectKind::Cell(_) => "CELL",
            ObjectKind::Class(_) => "CLASS",
            ObjectKind::Instance(_) => "INSTANCE",
        }
    }

    /// Approximate payload size in bytes, charged against the GC threshold.
    pub(crate) fn payload_bytes(&self) -> usize {
        match self {
            ObjectKind::Str(s) => s.len(),
            ObjectKind::Code(co) => {
                co.code.len()
                    + co.constants.len() * std::mem::size_of::<Value>()
                    + co.cell_names.iter().map(String::len).sum::<usize>()
            }
            ObjectKind::Native(native) => native.name.len(),
            ObjectKind::Function(function) => {
                function.cells.len() * std::mem::size_of::<ObjRef>()
            }
            ObjectKind::Cell(_) => std::mem::size_of::<Value>(),
            ObjectKind::Class(class) => {
                class.name.len() + class.properties.len() * std::mem::size_of::<Value>()
            }
            ObjectKind::Instance(instance) => {
                instance.properties.len() * std::mem::size_of::<Value>()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_resolution_prefers_innermost() {
        let mut co = CodeObject::new("main", 0);
        co.add_local("x");
        co.scope_level = 1;
        co.add_local("y");
        co.add_local("x"); // shadows the outer x

        assert_eq!(co.get_local_index("x"), Some(2));
        assert_eq!(co.get_local_index("y"), Some(1));
        assert_eq!(co.get_local_index("z"), None);
    }

    #[test]
    fn test_cell_resolution() {
        let mut co = CodeObject::new("f", 1);
        co.cell_names = vec!["a".to_owned(), "b".to_owned()];
        co.free_count = 1;

        assert_eq!(co.get_cell_index("a"), Some(0));
        assert_eq!(co.get_cell_index("b"), Some(1));
        assert_eq!(co.get_cell_index("c"), None);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Number(2.5).as_number(), Some(2.5));
        assert_eq!(Value::Boolean(true).as_boolean(), Some(true));
        assert_eq!(Value::Number(1.0).as_boolean(), None);
        assert_eq!(Value::Object(ObjRef(3)).as_object(), Some(ObjRef(3)));
        assert!(Value::Boolean(false).expect_number("OP_ADD").is_err());
    }
}
