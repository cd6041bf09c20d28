//! The stack-based virtual machine.
//!
//! State: a fixed-capacity operand stack with stack pointer `sp` (the
//! vector length), a base pointer `bp` marking the current frame's slot 0,
//! an instruction pointer `ip` into the current code object's bytes, the
//! currently executing function, and a call-frame stack of saved
//! `{ip, bp, fn}` triples.
//!
//! The VM owns the heap and the global table; the compiler borrows both
//! for the duration of [`Vm::exec`], and the objects it allocates (code,
//! constant strings, classes, compile-time functions) stay rooted for the
//! life of the program. Runtime allocations go through [`Vm::alloc`], which
//! runs a GC cycle first when the byte counter crosses the threshold —
//! allocation sites keep their operands on the stack until after the
//! allocation so the collector sees them as roots.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::compiler::Compiler;
use crate::disassembler::Disassembler;
use crate::gc;
use crate::global::GlobalTable;
use crate::heap::Heap;
use crate::opcode::*;
use crate::parser;
use crate::value::{FunctionObject, InstanceObject, ObjRef, ObjectKind, Value};
use crate::{Error, GC_THRESHOLD, STACK_LIMIT};

/// Saved execution context of a caller, restored on `OP_RETURN`.
#[derive(Debug, Clone, Copy)]
struct Frame {
    ret_ip: usize,
    bp: usize,
    fn_ref: ObjRef,
}

/// The Eva virtual machine.
pub struct Vm {
    heap: Heap,
    globals: GlobalTable,
    stack: Vec<Value>,
    bp: usize,
    ip: usize,
    frames: Vec<Frame>,
    /// Compile-time objects, rooted for the life of the program.
    constant_roots: Vec<ObjRef>,
    /// All code objects from the last compilation, for disassembly.
    code_objects: Vec<ObjRef>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_gc_threshold(GC_THRESHOLD)
    }

    /// A VM whose collector triggers at a custom byte threshold. Tests use
    /// tiny thresholds to force collection on small programs.
    pub fn with_gc_threshold(threshold: usize) -> Self {
        let mut vm = Vm {
            heap: Heap::with_threshold(threshold),
            globals: GlobalTable::new(),
            stack: Vec::with_capacity(STACK_LIMIT),
            bp: 0,
            ip: 0,
            frames: Vec::new(),
            constant_roots: Vec::new(),
            code_objects: Vec::new(),
        };
        vm.install_globals();
        vm
    }

    /// Preinstalled globals: `native-square/1`, `sum/2`, `VERSION`.
    fn install_globals(&mut self) {
        // A fresh table cannot exceed capacity here
        _ = self
            .globals
            .add_native(&mut self.heap, "native-square", native_square, 1);
        _ = self.globals.add_native(&mut self.heap, "sum", native_sum, 2);
        _ = self.globals.add_const("VERSION", 1.0);
    }

    /// Parses, compiles, and runs a program, returning the final value
    /// (the operand of `OP_HALT`).
    ///
    /// The source is wrapped as `(begin …)` first, so any sequence of
    /// expressions is a program. Globals persist across calls on the same
    /// VM; a failed execution leaves the VM unusable.
    pub fn exec(&mut self, program: &str) -> Result<Value, Error> {
        let ast = parser::parse(&format!("(begin {program})"))?;
        let output = Compiler::new(&mut self.heap, &mut self.globals).compile(&ast)?;
        self.constant_roots = output.constant_roots;
        self.code_objects = output.code_objects;

        self.stack.clear();
        self.frames.clear();
        self.bp = 0;
        self.ip = 0;
        self.run(output.main)
    }

    /// The fetch-decode-execute loop.
    fn run(&mut self, main: ObjRef) -> Result<Value, Error> {
        let mut fn_ref = main;
        let mut co_ref = self.heap.function(fn_ref)?.co;

        loop {
            let opcode = self.read_byte(co_ref)?;
            match opcode {
                OP_HALT => return self.pop(),

                OP_CONST => {
                    let idx = self.read_byte(co_ref)? as usize;
                    let value = self.constant(co_ref, idx)?;
                    self.push(value)?;
                }

                OP_ADD => {
                    let op2 = self.peek(0)?;
                    let op1 = self.peek(1)?;
                    match (op1, op2) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop_n(2)?;
                            self.push(Value::Number(a + b))?;
                        }
                        (Value::Object(r1), Value::Object(r2)) => {
                            // Concatenation allocates; the operands stay on
                            // the stack until the new string exists
                            let concat =
                                format!("{}{}", self.heap.string(r1)?, self.heap.string(r2)?);
                            let result = self.alloc(ObjectKind::Str(concat))?;
                            self.pop_n(2)?;
                            self.push(Value::Object(result))?;
                        }
                        _ => {
                            return Err(Error::TypeError(
                                "ADD expects two numbers or two strings".to_owned(),
                            ));
                        }
                    }
                }

                OP_SUB => self.binary_numeric("SUB", |a, b| a - b)?,
                OP_MUL => self.binary_numeric("MUL", |a, b| a * b)?,
                OP_DIV => self.binary_numeric("DIV", |a, b| a / b)?,

                OP_COMPARE => {
                    let code = self.read_byte(co_ref)?;
                    let op2 = self.pop()?;
                    let op1 = self.pop()?;
                    let result = match (op1, op2) {
                        (Value::Number(a), Value::Number(b)) => comparison(code, &a, &b)?,
                        (Value::Object(r1), Value::Object(r2)) => {
                            let s1 = self.heap.string(r1)?;
                            let s2 = self.heap.string(r2)?;
                            comparison(code, &s1, &s2)?
                        }
                        _ => {
                            return Err(Error::TypeError(
                                "COMPARE expects two numbers or two strings".to_owned(),
                            ));
                        }
                    };
                    self.push(Value::Boolean(result))?;
                }

                OP_JMP_IF_FALSE => {
                    let address = self.read_short(co_ref)? as usize;
                    let condition = self
                        .pop()?
                        .as_boolean()
                        .ok_or_else(|| Error::TypeError("JMP_IF_FALSE expects a boolean".to_owned()))?;
                    if !condition {
                        self.ip = address;
                    }
                }

                OP_JMP => {
                    self.ip = self.read_short(co_ref)? as usize;
                }

                OP_GET_GLOBAL => {
                    let idx = self.read_byte(co_ref)? as usize;
                    let value = self.globals.get(idx)?.value;
                    self.push(value)?;
                }

                OP_SET_GLOBAL => {
                    let idx = self.read_byte(co_ref)? as usize;
                    let value = self.peek(0)?;
                    self.globals.set(idx, value)?;
                }

                OP_POP => {
                    self.pop()?;
                }

                OP_GET_LOCAL => {
                    let idx = self.read_byte(co_ref)? as usize;
                    let value = *self
                        .stack
                        .get(self.bp + idx)
                        .ok_or_else(|| Error::IndexOutOfRange(format!("local {idx}")))?;
                    self.push(value)?;
                }

                OP_SET_LOCAL => {
                    let idx = self.read_byte(co_ref)? as usize;
                    let value = self.peek(0)?;
                    let slot = self
                        .stack
                        .get_mut(self.bp + idx)
                        .ok_or_else(|| Error::IndexOutOfRange(format!("local {idx}")))?;
                    *slot = value;
                }

                OP_SCOPE_EXIT => {
                    let count = self.read_byte(co_ref)? as usize;
                    // Preserve the block result above the popped slots
                    let result = self.peek(0)?;
                    let len = self.stack.len();
                    if len < count + 1 {
                        return Err(Error::EmptyStack("SCOPE_EXIT"));
                    }
                    self.stack[len - 1 - count] = result;
                    self.pop_n(count)?;
                }

                OP_CALL => {
                    let arg_count = self.read_byte(co_ref)? as usize;
                    let callee = self
                        .peek(arg_count)?
                        .as_object()
                        .ok_or_else(|| Error::TypeError("calling a non-function".to_owned()))?;

                    let native = match &self.heap.object(callee)?.kind {
                        ObjectKind::Native(native) => Some(native.function),
                        ObjectKind::Function(_) => None,
                        other => {
                            return Err(Error::TypeError(format!(
                                "calling a non-function ({})",
                                other.kind_name()
                            )));
                        }
                    };

                    match native {
                        Some(function) => {
                            function(self)?;
                            let result = self.pop()?;
                            self.pop_n(arg_count + 1)?;
                            self.push(result)?;
                        }
                        None => {
                            self.frames.push(Frame {
                                ret_ip: self.ip,
                                bp: self.bp,
                                fn_ref,
                            });
                            // Own cells are per-invocation; only captured
                            // free-variable cells survive the call
                            let free_count = {
                                let function = self.heap.function(callee)?;
                                self.heap.code(function.co)?.free_count
                            };
                            self.heap.function_mut(callee)?.cells.truncate(free_count);

                            fn_ref = callee;
                            co_ref = self.heap.function(callee)?.co;
                            self.bp = self.stack.len() - arg_count - 1;
                            self.ip = 0;
                        }
                    }
                }

                OP_RETURN => {
                    let frame = self
                        .frames
                        .pop()
                        .ok_or(Error::EmptyStack("RETURN"))?;
                    self.ip = frame.ret_ip;
                    self.bp = frame.bp;
                    fn_ref = frame.fn_ref;
                    co_ref = self.heap.function(fn_ref)?.co;
                }

                OP_GET_CELL => {
                    let idx = self.read_byte(co_ref)? as usize;
                    let cell = self.cell_at(fn_ref, idx)?;
                    let value = self.heap.cell(cell)?;
                    self.push(value)?;
                }

                OP_SET_CELL => {
                    let idx = self.read_byte(co_ref)? as usize;
                    let value = self.peek(0)?;
                    let cell_count = self.heap.function(fn_ref)?.cells.len();
                    if cell_count <= idx {
                        // First store: the cell is created for this
                        // invocation. The value stays on the stack, rooting
                        // it across the allocation.
                        let cell = self.alloc(ObjectKind::Cell(value))?;
                        self.heap.function_mut(fn_ref)?.cells.push(cell);
                    } else {
                        let cell = self.cell_at(fn_ref, idx)?;
                        *self.heap.cell_mut(cell)? = value;
                    }
                }

                OP_LOAD_CELL => {
                    let idx = self.read_byte(co_ref)? as usize;
                    let cell = self.cell_at(fn_ref, idx)?;
                    self.push(Value::Object(cell))?;
                }

                OP_MAKE_FUNCTION => {
                    let cell_count = self.read_byte(co_ref)? as usize;
                    let code = self
                        .pop()?
                        .as_object()
                        .ok_or_else(|| Error::TypeError("MAKE_FUNCTION expects code".to_owned()))?;
                    // The cells are still on the stack while the function
                    // object is allocated
                    let function = self.alloc(ObjectKind::Function(FunctionObject {
                        co: code,
                        cells: Default::default(),
                    }))?;

                    let mut cells: SmallVec<[ObjRef; 4]> = SmallVec::new();
                    for _ in 0..cell_count {
                        let cell = self.pop()?.as_object().ok_or_else(|| {
                            Error::TypeError("MAKE_FUNCTION expects cells".to_owned())
                        })?;
                        cells.push(cell);
                    }
                    // Popped last-pushed-first; index 0 is the first free
                    // variable in cell_names order
                    cells.reverse();
                    self.heap.function_mut(function)?.cells = cells;
                    self.push(Value::Object(function))?;
                }

                OP_NEW => {
                    let class = self
                        .peek(0)?
                        .as_object()
                        .ok_or_else(|| Error::TypeError("NEW expects a class".to_owned()))?;
                    // Verify the tag before allocating
                    self.heap.class(class)?;
                    let instance = self.alloc(ObjectKind::Instance(InstanceObject {
                        class,
                        properties: HashMap::new(),
                    }))?;
                    let constructor = self.class_prop(class, "constructor")?;
                    self.pop()?;
                    self.push(constructor)?;
                    self.push(Value::Object(instance))?;
                }

                OP_GET_PROP => {
                    let idx = self.read_byte(co_ref)? as usize;
                    let prop = self.prop_name(co_ref, idx)?;
                    let target = self
                        .pop()?
                        .as_object()
                        .ok_or_else(|| Error::TypeError("GET_PROP expects an object".to_owned()))?;
                    let value = match &self.heap.object(target)?.kind {
                        ObjectKind::Instance(instance) => match instance.properties.get(&prop) {
                            Some(value) => *value,
                            None => {
                                let class = instance.class;
                                self.class_prop(class, &prop)?
                            }
                        },
                        ObjectKind::Class(_) => self.class_prop(target, &prop)?,
                        other => {
                            return Err(Error::TypeError(format!(
                                "GET_PROP on a {}",
                                other.kind_name()
                            )));
                        }
                    };
                    self.push(value)?;
                }

                OP_SET_PROP => {
                    let idx = self.read_byte(co_ref)? as usize;
                    let prop = self.prop_name(co_ref, idx)?;
                    let target = self
                        .pop()?
                        .as_object()
                        .ok_or_else(|| Error::TypeError("SET_PROP expects an object".to_owned()))?;
                    let value = self.pop()?;
                    match &mut self.heap.object_mut(target)?.kind {
                        ObjectKind::Instance(instance) => {
                            instance.properties.insert(prop, value);
                        }
                        ObjectKind::Class(class) => {
                            class.properties.insert(prop, value);
                        }
                        other => {
                            return Err(Error::TypeError(format!(
                                "SET_PROP on a {}",
                                other.kind_name()
                            )));
                        }
                    }
                    self.push(value)?;
                }

                unknown => return Err(Error::UnknownOpcode(unknown)),
            }
        }
    }

    // ----------------------------------------------------------------
    // Stack operations.

    fn push(&mut self, value: Value) -> Result<(), Error> {
        if self.stack.len() == STACK_LIMIT {
            return Err(Error::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Error> {
        self.stack.pop().ok_or(Error::EmptyStack("pop"))
    }

    /// The value `offset` slots below the top, without popping.
    pub fn peek(&self, offset: usize) -> Result<Value, Error> {
        let len = self.stack.len();
        if len <= offset {
            return Err(Error::EmptyStack("peek"));
        }
        Ok(self.stack[len - 1 - offset])
    }

    fn pop_n(&mut self, count: usize) -> Result<(), Error> {
        if self.stack.len() < count {
            return Err(Error::EmptyStack("popN"));
        }
        self.stack.truncate(self.stack.len() - count);
        Ok(())
    }

    /// Pushes a value produced by a native function.
    pub fn push_result(&mut self, value: Value) -> Result<(), Error> {
        self.push(value)
    }

    // ----------------------------------------------------------------
    // Fetch helpers.

    fn read_byte(&mut self, co_ref: ObjRef) -> Result<u8, Error> {
        let byte = self
            .heap
            .code(co_ref)?
            .code
            .get(self.ip)
            .copied()
            .ok_or_else(|| Error::IndexOutOfRange(format!("ip {}", self.ip)))?;
        self.ip += 1;
        Ok(byte)
    }

    fn read_short(&mut self, co_ref: ObjRef) -> Result<u16, Error> {
        let hi = self.read_byte(co_ref)? as u16;
        let lo = self.read_byte(co_ref)? as u16;
        Ok((hi << 8) | lo)
    }

    fn constant(&self, co_ref: ObjRef, idx: usize) -> Result<Value, Error> {
        self.heap
            .code(co_ref)?
            .constants
            .get(idx)
            .copied()
            .ok_or_else(|| Error::IndexOutOfRange(format!("constant {idx}")))
    }

    fn prop_name(&self, co_ref: ObjRef, idx: usize) -> Result<String, Error> {
        let constant = self.constant(co_ref, idx)?;
        let obj = constant
            .as_object()
            .ok_or_else(|| Error::TypeError("property name must be a string".to_owned()))?;
        Ok(self.heap.string(obj)?.to_owned())
    }

    fn cell_at(&self, fn_ref: ObjRef, idx: usize) -> Result<ObjRef, Error> {
        self.heap
            .function(fn_ref)?
            .cells
            .get(idx)
            .copied()
            .ok_or_else(|| Error::IndexOutOfRange(format!("cell {idx}")))
    }

    fn binary_numeric(&mut self, what: &str, op: fn(f64, f64) -> f64) -> Result<(), Error> {
        let op2 = self.pop()?.expect_number(what)?;
        let op1 = self.pop()?.expect_number(what)?;
        self.push(Value::Number(op(op1, op2)))
    }

    /// Resolves a property through the class chain.
    fn class_prop(&self, class_ref: ObjRef, prop: &str) -> Result<Value, Error> {
        let mut current = class_ref;
        loop {
            let class = self.heap.class(current)?;
            if let Some(value) = class.properties.get(prop) {
                return Ok(*value);
            }
            match class.super_class {
                Some(super_class) => current = super_class,
                None => {
                    return Err(Error::UnresolvedProperty {
                        class: class.name.clone(),
                        prop: prop.to_owned(),
                    });
                }
            }
        }
    }

    // ----------------------------------------------------------------
    // GC.

    /// Runtime allocation: collects first if this allocation would cross
    /// the threshold. Allocation sites keep every live operand on the
    /// stack until this returns.
    fn alloc(&mut self, kind: ObjectKind) -> Result<ObjRef, Error> {
        if self.heap.should_collect(&kind) {
            let roots = self.gc_roots();
            gc::collect(&mut self.heap, roots);
        }
        Ok(self.heap.alloc(kind))
    }

    /// Runs a full collection cycle immediately, returning the number of
    /// objects freed. Exposed for inspection; normal collection happens
    /// automatically at the allocation threshold.
    pub fn collect_garbage(&mut self) -> usize {
        let roots = self.gc_roots();
        gc::collect(&mut self.heap, roots)
    }

    /// Roots: every object on the operand stack, in the globals table, and
    /// in the compiler's constant set.
    fn gc_roots(&self) -> Vec<ObjRef> {
        let mut roots: Vec<ObjRef> = self
            .stack
            .iter()
            .filter_map(|value| value.as_object())
            .collect();
        roots.extend(self.globals.values().filter_map(|value| value.as_object()));
        roots.extend(self.constant_roots.iter().copied());
        roots
    }

    // ----------------------------------------------------------------
    // Inspection.

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn globals(&self) -> &GlobalTable {
        &self.globals
    }

    /// Renders a result value for display.
    pub fn display_value(&self, value: Value) -> String {
        self.heap.constant_to_string(value)
    }

    /// Disassembles every code object from the last compilation.
    pub fn disassemble(&self) -> Result<String, Error> {
        let disassembler = Disassembler::new(&self.heap, &self.globals);
        let mut out = String::new();
        for co_ref in &self.code_objects {
            out.push_str(&disassembler.disassemble(*co_ref)?);
        }
        Ok(out)
    }
}

/// `(native-square x)`: x².
fn native_square(vm: &mut Vm) -> Result<(), Error> {
    let x = vm.peek(0)?.expect_number("native-square")?;
    vm.push_result(Value::Number(x * x))
}

/// `(sum a b)`: a + b.
fn native_sum(vm: &mut Vm) -> Result<(), Error> {
    let v2 = vm.peek(0)?.expect_number("sum")?;
    let v1 = vm.peek(1)?.expect_number("sum")?;
    vm.push_result(Value::Number(v1 + v2))
}

/// The k-th comparator over an ordered pair.
fn comparison<T: PartialOrd>(code: u8, v1: &T, v2: &T) -> Result<bool, Error> {
    Ok(match code {
        0 => v1 < v2,
        1 => v1 > v2,
        2 => v1 == v2,
        3 => v1 >= v2,
        4 => v1 <= v2,
        5 => v1 != v2,
        other => {
            return Err(Error::TypeError(format!("invalid comparison code {other}")));
        }
    })
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn run(src: &str) -> Result<Value, Error> {
        Vm::new().exec(src)
    }

    fn run_number(src: &str) -> f64 {
        run(src).unwrap().as_number().unwrap()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run_number("(+ 1 2)"), 3.0);
        assert_eq!(run_number("(- 10 4)"), 6.0);
        assert_eq!(run_number("(* 3 4)"), 12.0);
        assert_eq!(run_number("(/ 9 2)"), 4.5);
        assert_eq!(run_number("(+ (* 2 3) (- 10 8))"), 8.0);
    }

    #[test]
    fn test_type_error_reaches_arithmetic() {
        assert!(matches!(run("(+ 1 true)"), Err(Error::TypeError(_))));
        assert!(matches!(run("(* \"a\" 2)"), Err(Error::TypeError(_))));
    }

    #[test]
    fn test_string_concatenation() {
        let mut vm = Vm::new();
        let result = vm.exec("(+ \"hello\" \" world\")").unwrap();
        let obj = result.as_object().unwrap();
        assert_eq!(vm.heap().string(obj).unwrap(), "hello world");
    }

    #[test]
    fn test_comparisons() {
        for (src, expected) in [
            ("(< 1 2)", true),
            ("(> 1 2)", false),
            ("(== 3 3)", true),
            ("(>= 3 3)", true),
            ("(<= 4 3)", false),
            ("(!= 1 2)", true),
            ("(== \"a\" \"a\")", true),
            ("(< \"a\" \"b\")", true),
        ] {
            assert_eq!(
                run(src).unwrap().as_boolean(),
                Some(expected),
                "program: {src}"
            );
        }
    }

    #[test]
    fn test_if_branches() {
        assert_eq!(run_number("(if (> 5 3) 1 2)"), 1.0);
        assert_eq!(run_number("(if (< 5 3) 1 2)"), 2.0);
        // No alternate: false test yields false
        assert_eq!(run("(if (< 5 3) 1)").unwrap().as_boolean(), Some(false));
    }

    #[test]
    fn test_globals_and_preinstalled() {
        assert_eq!(run_number("(var x 10) (var y 20) (+ x y)"), 30.0);
        assert_eq!(run_number("VERSION"), 1.0);
        assert_eq!(run_number("(native-square 6)"), 36.0);
        assert_eq!(run_number("(sum 4 5)"), 9.0);
        assert_eq!(run_number("(sum (native-square 2) 1)"), 5.0);
    }

    #[test]
    fn test_set_global() {
        assert_eq!(run_number("(var x 1) (set x 42) x"), 42.0);
        // set is an expression: its value is the assigned value
        assert_eq!(run_number("(var x 1) (+ (set x 5) x)"), 10.0);
    }

    #[test]
    fn test_block_locals_and_shadowing() {
        assert_eq!(run_number("(var x 1) (begin (var x 10) x)"), 10.0);
        assert_eq!(run_number("(var x 1) (begin (var x 10) 0) x"), 1.0);
        assert_eq!(
            run_number("(begin (var a 2) (begin (var b 3) (* a b)))"),
            6.0
        );
    }

    #[test]
    fn test_while_loop() {
        assert_eq!(
            run_number(
                "(var i 0) (var s 0) \
                 (while (< i 10) (begin (set s (+ s i)) (set i (+ i 1)))) \
                 s"
            ),
            45.0
        );
    }

    #[test]
    fn test_function_calls_and_recursion() {
        assert_eq!(run_number("(def add1 (n) (+ n 1)) (add1 41)"), 42.0);
        assert_eq!(
            run_number("(def fact (n) (if (<= n 1) 1 (* n (fact (- n 1))))) (fact 5)"),
            120.0
        );
        // Inline lambda call
        assert_eq!(run_number("((lambda (x) (* x x)) 7)"), 49.0);
    }

    #[test]
    fn test_closures_capture_and_share() {
        assert_eq!(
            run_number(
                "(def make-adder (x) (lambda (y) (+ x y))) \
                 (var add3 (make-adder 3)) \
                 (add3 4)"
            ),
            7.0
        );
        // Two closures over the same invocation share one cell
        assert_eq!(
            run_number(
                "(def make-pair (x) \
                   (begin \
                     (var bump (lambda () (set x (+ x 1)))) \
                     (var read (lambda () x)) \
                     (begin (bump) (bump) (read)))) \
                 (make-pair 10)"
            ),
            12.0
        );
    }

    #[test]
    fn test_direct_reference_and_capture_agree_on_the_cell() {
        // x is referenced directly in the body and captured by the lambda;
        // both must go through the same cell
        assert_eq!(
            run_number(
                "(def f (x) (begin (+ x 0) (lambda () x))) \
                 (var get (f 5)) \
                 (get)"
            ),
            5.0
        );
    }

    #[test]
    fn test_closure_outlives_defining_scope() {
        assert_eq!(
            run_number(
                "(def make-counter () \
                   (begin \
                     (var count 0) \
                     (lambda () (set count (+ count 1))))) \
                 (var tick (make-counter)) \
                 (tick) (tick) (tick)"
            ),
            3.0
        );
    }

    #[test]
    fn test_stack_overflow_on_runaway_recursion() {
        assert!(matches!(
            run("(def f (n) (f (+ n 1))) (f 0)"),
            Err(Error::StackOverflow)
        ));
    }

    #[test]
    fn test_stack_limit_is_exactly_512() {
        let mut vm = Vm::new();
        for i in 0..STACK_LIMIT {
            vm.push(Value::Number(i as f64)).unwrap();
        }
        assert_eq!(vm.push(Value::Number(0.0)), Err(Error::StackOverflow));
    }

    #[test]
    fn test_pop_empty_stack() {
        let mut vm = Vm::new();
        assert_eq!(vm.pop(), Err(Error::EmptyStack("pop")));
        assert_eq!(vm.peek(0), Err(Error::EmptyStack("peek")));
    }

    #[test]
    fn test_def_before_halt_leaves_binding_unused() {
        let mut vm = Vm::new();
        let result = vm.exec("(var x 5) (def f (n) (* n x))").unwrap();
        // The def is the final statement; its value is the function
        let obj = result.as_object().unwrap();
        assert!(vm.heap().function(obj).is_ok());
        assert!(vm.globals().exists("f"));
    }

    #[test]
    fn test_gc_under_pressure_preserves_live_strings() {
        // A threshold small enough to force many collections while the
        // loop keeps allocating concatenated strings
        let mut vm = Vm::with_gc_threshold(2048);
        let result = vm
            .exec(
                "(var s \"\") (var i 0) \
                 (while (< i 50) (begin (set s (+ s \"x\")) (set i (+ i 1)))) \
                 s",
            )
            .unwrap();
        let obj = result.as_object().unwrap();
        assert_eq!(vm.heap().string(obj).unwrap().len(), 50);
    }

    #[test]
    fn test_gc_collects_garbage_strings() {
        let mut vm = Vm::with_gc_threshold(1024);
        vm.exec(
            "(var i 0) \
             (while (< i 100) (begin (+ \"dead\" \"beef\") (set i (+ i 1)))) \
             i",
        )
        .unwrap();
        // Far fewer than 100 concatenation results should remain
        assert!(
            vm.heap().object_count() < 50,
            "expected garbage to be collected, {} objects live",
            vm.heap().object_count()
        );
    }

    #[test]
    fn test_classes_end_to_end() {
        let mut vm = Vm::new();
        let result = vm
            .exec(
                "(class Point null \
                   (def constructor (self x y) \
                     (begin \
                       (set (prop self x) x) \
                       (set (prop self y) y) \
                       self)) \
                   (def calc (self) \
                     (+ (prop self x) (prop self y)))) \
                 (var p (new Point 10 20)) \
                 ((prop p calc) p)",
            )
            .unwrap();
        assert_eq!(result.as_number(), Some(30.0));
    }

    #[test]
    fn test_class_inheritance() {
        let mut vm = Vm::new();
        let result = vm
            .exec(
                "(class Base null \
                   (def constructor (self) self) \
                   (def version (self) 1)) \
                 (class Derived Base \
                   (def constructor (self) self)) \
                 (var d (new Derived)) \
                 ((prop d version) d)",
            )
            .unwrap();
        assert_eq!(result.as_number(), Some(1.0));
    }

    #[test]
    fn test_unresolved_property() {
        let mut vm = Vm::new();
        let result = vm.exec(
            "(class P null (def constructor (self) self)) \
             (var p (new P)) \
             (prop p missing)",
        );
        assert!(matches!(
            result,
            Err(Error::UnresolvedProperty { class, prop }) if class == "P" && prop == "missing"
        ));
    }

    #[test]
    fn test_unknown_opcode_aborts() {
        use crate::value::CodeObject;

        let mut vm = Vm::new();
        let mut co = CodeObject::new("bad", 0);
        co.code = vec![0xEE];
        let code_ref = vm.heap.alloc(ObjectKind::Code(co));
        let main = vm.heap.alloc(ObjectKind::Function(FunctionObject {
            co: code_ref,
            cells: Default::default(),
        }));
        assert_eq!(vm.run(main), Err(Error::UnknownOpcode(0xEE)));
    }

    #[test]
    fn test_numeric_literal_round_trip() {
        for n in [0.0, -0.5, 1.25, 1e10, -3.75, 42.0] {
            let mut vm = Vm::new();
            let result = vm.exec(&format!("{n}")).unwrap();
            assert_eq!(result.as_number(), Some(n));
        }
    }

    #[test]
    fn test_stack_is_balanced_after_halt() {
        let mut vm = Vm::new();
        vm.exec("(var x 10) (var y 20) (+ x y)").unwrap();
        assert!(
            vm.stack.is_empty(),
            "HALT pops the single remaining value; nothing may linger"
        );

        let mut vm = Vm::new();
        vm.exec(
            "(var i 0) (while (< i 3) (begin (var t i) (set i (+ t 1)))) i",
        )
        .unwrap();
        assert!(vm.stack.is_empty());
    }
}
