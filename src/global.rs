//! The global table: an append-only vector of named slots with stable
//! indices. Bytecode refers to globals by index, so entries are never
//! removed or reordered; name lookup scans last-to-first so redefinitions
//! shadow earlier entries.

use crate::Error;
use crate::heap::Heap;
use crate::value::{NativeFn, NativeObject, ObjectKind, Value};

/// One global slot.
#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub name: String,
    pub value: Value,
}

/// Global variables and functions.
#[derive(Debug, Default)]
pub struct GlobalTable {
    globals: Vec<GlobalVar>,
}

impl GlobalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a global by index.
    pub fn get(&self, index: usize) -> Result<&GlobalVar, Error> {
        self.globals
            .get(index)
            .ok_or_else(|| Error::ReferenceError(format!("global {index}")))
    }

    /// Sets a global by index.
    pub fn set(&mut self, index: usize, value: Value) -> Result<(), Error> {
        match self.globals.get_mut(index) {
            Some(var) => {
                var.value = value;
                Ok(())
            }
            None => Err(Error::ReferenceError(format!("global {index}"))),
        }
    }

    /// Registers a global, defaulting its value to 0. Re-defining an
    /// existing name is a no-op.
    pub fn define(&mut self, name: &str) -> Result<(), Error> {
        if self.exists(name) {
            return Ok(());
        }
        if self.globals.len() >= 256 {
            return Err(Error::CapacityExceeded("globals"));
        }
        self.globals.push(GlobalVar {
            name: name.to_owned(),
            value: Value::Number(0.0),
        });
        Ok(())
    }

    /// Index of a name, scanning last-to-first.
    pub fn get_index(&self, name: &str) -> Option<usize> {
        self.globals.iter().rposition(|var| var.name == name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get_index(name).is_some()
    }

    /// Installs a native function. No-op if the name is taken.
    pub fn add_native(
        &mut self,
        heap: &mut Heap,
        name: &str,
        function: NativeFn,
        arity: usize,
    ) -> Result<(), Error> {
        if self.exists(name) {
            return Ok(());
        }
        if self.globals.len() >= 256 {
            return Err(Error::CapacityExceeded("globals"));
        }
        let native = heap.alloc(ObjectKind::Native(NativeObject {
            name: name.to_owned(),
            arity,
            function,
        }));
        self.globals.push(GlobalVar {
            name: name.to_owned(),
            value: Value::Object(native),
        });
        Ok(())
    }

    /// Installs a numeric constant. No-op if the name is taken.
    pub fn add_const(&mut self, name: &str, value: f64) -> Result<(), Error> {
        if self.exists(name) {
            return Ok(());
        }
        if self.globals.len() >= 256 {
            return Err(Error::CapacityExceeded("globals"));
        }
        self.globals.push(GlobalVar {
            name: name.to_owned(),
            value: Value::Number(value),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    /// All current values, for GC root assembly.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.globals.iter().map(|var| var.value)
    }

    /// All current names, for seeding the scope analyzer's root scope.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.globals.iter().map(|var| var.name.as_str())
    }
}
