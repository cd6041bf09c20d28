//! Mark-and-sweep collection over the object registry.
//!
//! The collector is stateless: the VM assembles the root set (operand
//! stack, globals table, compiler constant set) and calls [`collect`],
//! which runs to completion before the triggering allocation proceeds.
//! Mark is an explicit-worklist DFS over per-variant successor edges;
//! sweep frees every unmarked slot and clears the mark bit on survivors
//! for the next cycle.

use smallvec::SmallVec;

use crate::heap::Heap;
use crate::value::{ObjRef, ObjectKind, Value};

/// One collection cycle. Returns the number of objects freed.
pub fn collect(heap: &mut Heap, roots: impl IntoIterator<Item = ObjRef>) -> usize {
    mark(heap, roots);
    sweep(heap)
}

/// Mark phase: trace every object reachable from the roots.
fn mark(heap: &mut Heap, roots: impl IntoIterator<Item = ObjRef>) {
    let mut worklist: Vec<ObjRef> = roots.into_iter().collect();

    while let Some(obj) = worklist.pop() {
        let Some(object) = heap.slots.get_mut(obj.index()).and_then(|slot| slot.as_mut())
        else {
            continue;
        };
        if object.marked {
            continue;
        }
        object.marked = true;
        worklist.extend(successors(&object.kind));
    }
}

/// The outgoing object edges of one heap object.
fn successors(kind: &ObjectKind) -> SmallVec<[ObjRef; 8]> {
    let mut edges = SmallVec::new();
    let mut push_value = |edges: &mut SmallVec<[ObjRef; 8]>, value: Value| {
        if let Value::Object(obj) = value {
            edges.push(obj);
        }
    };

    match kind {
        ObjectKind::Str(_) | ObjectKind::Native(_) => {}
        ObjectKind::Code(co) => {
            for constant in &co.constants {
                push_value(&mut edges, *constant);
            }
        }
        ObjectKind::Function(function) => {
            edges.push(function.co);
            edges.extend(function.cells.iter().copied());
        }
        ObjectKind::Cell(value) => push_value(&mut edges, *value),
        ObjectKind::Class(class) => {
            if let Some(super_class) = class.super_class {
                edges.push(super_class);
            }
            for value in class.properties.values() {
                push_value(&mut edges, *value);
            }
        }
        ObjectKind::Instance(instance) => {
            edges.push(instance.class);
            for value in instance.properties.values() {
                push_value(&mut edges, *value);
            }
        }
    }

    edges
}

/// Sweep phase: free unmarked objects, clear marks on survivors.
fn sweep(heap: &mut Heap) -> usize {
    let mut freed = 0;
    for index in 0..heap.slots.len() {
        match &mut heap.slots[index] {
            Some(object) if object.marked => object.marked = false,
            Some(_) => {
                heap.free_slot(index);
                freed += 1;
            }
            None => {}
        }
    }
    freed
}
