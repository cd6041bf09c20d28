//! The bytecode compiler: two passes over the AST, `analyze` (scope
//! classification, see [`crate::scope`]) and `gen` (code emission).
//!
//! `gen` is a recursive descent that maintains the currently-compiling
//! [`CodeObject`] and a scope stack kept in lockstep with the analyzer's
//! scope tree. One code object is produced per function plus the top-level
//! "main"; finished code objects, constant-pool strings, classes, and
//! compile-time functions are registered as GC roots for the lifetime of
//! the program.
//!
//! Stack discipline: every expression nets exactly one pushed value.
//! `begin` pops non-final statement values (except locals, whose value *is*
//! their stack slot, and cell declarations, which pop themselves); `if`
//! with no alternate behaves as if the alternate were `false`; `while`
//! pops the body value each iteration and evaluates to `false`.

use std::collections::HashMap;
use std::mem;

use crate::Error;
use crate::ast::{Expr, NodeId};
use crate::global::GlobalTable;
use crate::heap::Heap;
use crate::opcode::{self, *};
use crate::scope::{self, AllocType, ScopeMap, ScopeRef};
use crate::value::{ClassObject, CodeObject, FunctionObject, ObjRef, ObjectKind, Value};

/// The result of compiling one program.
pub struct CompileOutput {
    /// The entry-point function ("main").
    pub main: ObjRef,
    /// Every object allocated at compile time: code objects, constant
    /// strings, compile-time functions, classes. GC roots for the life of
    /// the program.
    pub constant_roots: Vec<ObjRef>,
    /// All code objects in creation order, for disassembly.
    pub code_objects: Vec<ObjRef>,
}

/// Compiler state. Borrows the VM's heap and global table for the duration
/// of one compilation.
pub struct Compiler<'a> {
    heap: &'a mut Heap,
    globals: &'a mut GlobalTable,
    scopes: ScopeMap,
    scope_stack: Vec<ScopeRef>,
    /// The currently-compiling code object; enclosing ones are parked on
    /// the call stack of `compile_function`.
    co: CodeObject,
    constant_roots: Vec<ObjRef>,
    code_objects: Vec<ObjRef>,
    /// Classes compiled so far, for superclass resolution.
    class_registry: HashMap<String, ObjRef>,
}

impl<'a> Compiler<'a> {
    pub fn new(heap: &'a mut Heap, globals: &'a mut GlobalTable) -> Self {
        Compiler {
            heap,
            globals,
            scopes: ScopeMap::new(),
            scope_stack: Vec::new(),
            co: CodeObject::new("main", 0),
            constant_roots: Vec::new(),
            code_objects: Vec::new(),
            class_registry: HashMap::new(),
        }
    }

    /// Compiles a whole program (the `(begin …)` wrapper) into a main
    /// function.
    pub fn compile(mut self, program: &Expr) -> Result<CompileOutput, Error> {
        self.scopes = scope::analyze(program, self.globals.names())?;
        self.r#gen(program)?;
        self.emit(OP_HALT);

        let main_co = mem::take(&mut self.co);
        let code_ref = self.register_code(main_co);
        let main = self.heap.alloc(ObjectKind::Function(FunctionObject {
            co: code_ref,
            cells: Default::default(),
        }));
        self.constant_roots.push(main);

        Ok(CompileOutput {
            main,
            constant_roots: self.constant_roots,
            code_objects: self.code_objects,
        })
    }

    // ----------------------------------------------------------------
    // Main generation dispatch.

    fn r#gen(&mut self, expr: &Expr) -> Result<(), Error> {
        match expr {
            Expr::Number(n) => {
                let idx = self.numeric_const_idx(*n)?;
                self.emit(OP_CONST);
                self.emit_idx(idx, "constants")?;
            }
            Expr::Str(s) => {
                let idx = self.string_const_idx(s)?;
                self.emit(OP_CONST);
                self.emit_idx(idx, "constants")?;
            }
            Expr::Symbol(name) => match name.as_str() {
                "true" | "false" => {
                    let idx = self.boolean_const_idx(name == "true")?;
                    self.emit(OP_CONST);
                    self.emit_idx(idx, "constants")?;
                }
                _ => self.gen_get(name)?,
            },
            Expr::List(id, items) => match expr.tag() {
                Some(op) if opcode::arithmetic_op(op).is_some() => {
                    self.gen_binary(op, items)?;
                }
                Some(op) if opcode::compare_op(op).is_some() => {
                    self.gen_compare(op, items)?;
                }
                Some("if") => self.gen_if(items)?,
                Some("while") => self.gen_while(items)?,
                Some("var") => self.gen_var(items)?,
                Some("set") => self.gen_set(items)?,
                Some("begin") => self.gen_begin(*id, items)?,
                Some("def") => self.gen_def(*id, items)?,
                Some("lambda") => {
                    let (params, body) = Self::function_parts(items, 1, "lambda")?;
                    self.compile_function(*id, "lambda", params, body)?;
                }
                Some("class") => self.gen_class(*id, items)?,
                Some("new") => self.gen_new(items)?,
                Some("prop") => self.gen_prop(items)?,
                _ => self.gen_call(items)?,
            },
        }
        Ok(())
    }

    /// Variable read: GET_LOCAL / GET_CELL / GET_GLOBAL per the analyzer's
    /// classification.
    fn gen_get(&mut self, name: &str) -> Result<(), Error> {
        match self.alloc_type(name)? {
            AllocType::Local => {
                let idx = self
                    .co
                    .get_local_index(name)
                    .ok_or_else(|| Error::ReferenceError(name.to_owned()))?;
                self.emit(OP_GET_LOCAL);
                self.emit_idx(idx, "locals")?;
            }
            AllocType::Cell => {
                let idx = self
                    .co
                    .get_cell_index(name)
                    .ok_or_else(|| Error::ReferenceError(name.to_owned()))?;
                self.emit(OP_GET_CELL);
                self.emit_idx(idx, "cells")?;
            }
            AllocType::Global => {
                let idx = self
                    .globals
                    .get_index(name)
                    .ok_or_else(|| Error::ReferenceError(name.to_owned()))?;
                self.emit(OP_GET_GLOBAL);
                self.emit_idx(idx, "globals")?;
            }
        }
        Ok(())
    }

    /// Variable write. The value stays on the stack (SET does not pop).
    fn gen_set_name(&mut self, name: &str) -> Result<(), Error> {
        match self.alloc_type(name)? {
            AllocType::Local => {
                let idx = self
                    .co
                    .get_local_index(name)
                    .ok_or_else(|| Error::ReferenceError(name.to_owned()))?;
                self.emit(OP_SET_LOCAL);
                self.emit_idx(idx, "locals")?;
            }
            AllocType::Cell => {
                let idx = self
                    .co
                    .get_cell_index(name)
                    .ok_or_else(|| Error::ReferenceError(name.to_owned()))?;
                self.emit(OP_SET_CELL);
                self.emit_idx(idx, "cells")?;
            }
            AllocType::Global => {
                let idx = self
                    .globals
                    .get_index(name)
                    .ok_or_else(|| Error::ReferenceError(name.to_owned()))?;
                self.emit(OP_SET_GLOBAL);
                self.emit_idx(idx, "globals")?;
            }
        }
        Ok(())
    }

    fn gen_binary(&mut self, op: &str, items: &[Expr]) -> Result<(), Error> {
        let [_, lhs, rhs] = items else {
            return Err(Error::TypeError(format!("{op} expects 2 operands")));
        };
        self.r#gen(lhs)?;
        self.r#gen(rhs)?;
        // Checked by the dispatch guard
        if let Some(byte) = opcode::arithmetic_op(op) {
            self.emit(byte);
        }
        Ok(())
    }

    fn gen_compare(&mut self, op: &str, items: &[Expr]) -> Result<(), Error> {
        let [_, lhs, rhs] = items else {
            return Err(Error::TypeError(format!("{op} expects 2 operands")));
        };
        self.r#gen(lhs)?;
        self.r#gen(rhs)?;
        self.emit(OP_COMPARE);
        if let Some(code) = opcode::compare_op(op) {
            self.emit(code);
        }
        Ok(())
    }

    /// `(if test consequent alternate?)`. A missing alternate behaves as
    /// the literal `false`.
    fn gen_if(&mut self, items: &[Expr]) -> Result<(), Error> {
        if items.len() != 3 && items.len() != 4 {
            return Err(Error::TypeError("if expects 2 or 3 operands".to_owned()));
        }
        self.r#gen(&items[1])?;

        // Else branch; 0-placeholder, patched below
        self.emit(OP_JMP_IF_FALSE);
        self.emit(0);
        self.emit(0);
        let else_jmp_addr = self.offset()? - 2;

        self.r#gen(&items[2])?;
        self.emit(OP_JMP);
        self.emit(0);
        self.emit(0);
        let end_jmp_addr = self.offset()? - 2;

        let else_branch_addr = self.offset()?;
        self.patch_jump_address(else_jmp_addr, else_branch_addr);

        match items.get(3) {
            Some(alternate) => self.r#gen(alternate)?,
            None => {
                let idx = self.boolean_const_idx(false)?;
                self.emit(OP_CONST);
                self.emit_idx(idx, "constants")?;
            }
        }

        let end_branch_addr = self.offset()?;
        self.patch_jump_address(end_jmp_addr, end_branch_addr);
        Ok(())
    }

    /// `(while test body)`. The body value is popped every iteration; the
    /// loop itself evaluates to `false`.
    fn gen_while(&mut self, items: &[Expr]) -> Result<(), Error> {
        let [_, test, body] = items else {
            return Err(Error::TypeError("while expects 2 operands".to_owned()));
        };

        let loop_start_addr = self.offset()?;
        self.r#gen(test)?;

        self.emit(OP_JMP_IF_FALSE);
        self.emit(0);
        self.emit(0);
        let loop_end_jmp_addr = self.offset()? - 2;

        self.r#gen(body)?;
        self.emit(OP_POP);

        self.emit(OP_JMP);
        self.emit(0);
        self.emit(0);
        let back_jmp_addr = self.offset()? - 2;
        self.patch_jump_address(back_jmp_addr, loop_start_addr);

        let loop_end_addr = self.offset()?;
        self.patch_jump_address(loop_end_jmp_addr, loop_end_addr);

        let idx = self.boolean_const_idx(false)?;
        self.emit(OP_CONST);
        self.emit_idx(idx, "constants")?;
        Ok(())
    }

    /// `(var name init)`.
    fn gen_var(&mut self, items: &[Expr]) -> Result<(), Error> {
        let name = Self::binding_name(items.get(1), "var")?.to_owned();
        let init = items
            .get(2)
            .ok_or_else(|| Error::TypeError("var requires an initializer".to_owned()))?;

        // (var f (lambda …)) captures the binding name as the function
        // name, so the function's slot-0 self reference matches
        if let Expr::List(id, lambda_items) = init
            && init.is_tagged("lambda")
        {
            let (params, body) = Self::function_parts(lambda_items, 1, "lambda")?;
            self.compile_function(*id, &name, params, body)?;
        } else {
            self.r#gen(init)?;
        }

        self.bind(&name)
    }

    /// Binds the value on the stack top to `name` per its classification.
    fn bind(&mut self, name: &str) -> Result<(), Error> {
        match self.alloc_type(name)? {
            AllocType::Global => {
                self.globals.define(name)?;
                let idx = self
                    .globals
                    .get_index(name)
                    .ok_or_else(|| Error::ReferenceError(name.to_owned()))?;
                self.emit(OP_SET_GLOBAL);
                self.emit_idx(idx, "globals")?;
            }
            AllocType::Local => {
                // The value's stack slot is the local; nothing to emit
                self.declare_local(name)?;
            }
            AllocType::Cell => {
                // The value lives in the cell, not on the stack
                let idx = self.cell_index_or_insert(name)?;
                self.emit(OP_SET_CELL);
                self.emit_idx(idx, "cells")?;
                self.emit(OP_POP);
            }
        }
        Ok(())
    }

    /// `(set name value)` or `(set (prop obj name) value)`.
    fn gen_set(&mut self, items: &[Expr]) -> Result<(), Error> {
        let target = items
            .get(1)
            .ok_or_else(|| Error::TypeError("set requires a target".to_owned()))?;
        let value = items
            .get(2)
            .ok_or_else(|| Error::TypeError("set requires a value".to_owned()))?;

        if let Expr::List(_, prop_items) = target
            && target.is_tagged("prop")
        {
            let object = prop_items
                .get(1)
                .ok_or_else(|| Error::TypeError("prop requires an object".to_owned()))?;
            let prop = Self::binding_name(prop_items.get(2), "prop")?.to_owned();
            self.r#gen(value)?;
            self.r#gen(object)?;
            let idx = self.string_const_idx(&prop)?;
            self.emit(OP_SET_PROP);
            self.emit_idx(idx, "constants")?;
            return Ok(());
        }

        let name = target
            .as_symbol()
            .ok_or_else(|| Error::TypeError("set target must be a symbol or (prop …)".to_owned()))?
            .to_owned();
        self.r#gen(value)?;
        self.gen_set_name(&name)
    }

    /// `(begin …)`: a block. The last expression's value is the block's
    /// value; intermediate statement values are popped unless the statement
    /// declared a stack-resident local (its value *is* the slot) or a cell
    /// (it already popped itself).
    fn gen_begin(&mut self, id: NodeId, items: &[Expr]) -> Result<(), Error> {
        self.scope_enter(id)?;
        let children = &items[1..];
        for (i, child) in children.iter().enumerate() {
            let is_last = i + 1 == children.len();
            self.r#gen(child)?;
            if !is_last && self.statement_pops(child)? {
                self.emit(OP_POP);
            }
        }
        self.scope_exit()?;
        Ok(())
    }

    /// Whether a non-final `begin` statement leaves a poppable value.
    fn statement_pops(&self, child: &Expr) -> Result<bool, Error> {
        if !matches!(child.tag(), Some("var") | Some("def")) {
            return Ok(true);
        }
        let Expr::List(_, items) = child else {
            return Ok(true);
        };
        let name = Self::binding_name(items.get(1), "declaration")?;
        Ok(match self.alloc_type(name)? {
            // SET_GLOBAL left the value; pop it like an expression
            AllocType::Global => true,
            // The value is the local's stack slot
            AllocType::Local => false,
            // SET_CELL + POP already ran
            AllocType::Cell => false,
        })
    }

    /// `(def name (params) body)`: compile the function, then bind it like
    /// a `var`.
    fn gen_def(&mut self, id: NodeId, items: &[Expr]) -> Result<(), Error> {
        let name = Self::binding_name(items.get(1), "def")?.to_owned();
        let (params, body) = Self::function_parts(items, 2, "def")?;
        self.compile_function(id, &name, params, body)?;
        self.bind(&name)
    }

    /// `(new Class args…)`: the class's `"constructor"` property is called
    /// with the fresh instance as its first argument.
    fn gen_new(&mut self, items: &[Expr]) -> Result<(), Error> {
        let class = items
            .get(1)
            .ok_or_else(|| Error::TypeError("new requires a class".to_owned()))?;
        self.r#gen(class)?;
        self.emit(OP_NEW);
        let args = &items[2..];
        for arg in args {
            self.r#gen(arg)?;
        }
        self.emit(OP_CALL);
        self.emit_idx(args.len() + 1, "call arguments")?;
        Ok(())
    }

    /// `(prop obj name)`.
    fn gen_prop(&mut self, items: &[Expr]) -> Result<(), Error> {
        let object = items
            .get(1)
            .ok_or_else(|| Error::TypeError("prop requires an object".to_owned()))?;
        let prop = Self::binding_name(items.get(2), "prop")?.to_owned();
        self.r#gen(object)?;
        let idx = self.string_const_idx(&prop)?;
        self.emit(OP_GET_PROP);
        self.emit_idx(idx, "constants")?;
        Ok(())
    }

    /// `(class Name Super members…)`. The class object is allocated at
    /// compile time and bound as a global; methods are compiled in a CLASS
    /// scope and installed at runtime via SET_PROP. The class is the
    /// statement's value.
    fn gen_class(&mut self, id: NodeId, items: &[Expr]) -> Result<(), Error> {
        let name = Self::binding_name(items.get(1), "class")?.to_owned();
        let super_name = Self::binding_name(items.get(2), "class")?;
        let super_class = match super_name {
            "null" => None,
            other => Some(
                self.class_registry
                    .get(other)
                    .copied()
                    .ok_or_else(|| Error::ReferenceError(other.to_owned()))?,
            ),
        };

        let class_ref = self.heap.alloc(ObjectKind::Class(ClassObject {
            name: name.clone(),
            properties: HashMap::new(),
            super_class,
        }));
        self.constant_roots.push(class_ref);
        self.class_registry.insert(name.clone(), class_ref);

        self.globals.define(&name)?;
        let global_idx = self
            .globals
            .get_index(&name)
            .ok_or_else(|| Error::ReferenceError(name.clone()))?;
        let class_const = self.add_const(Value::Object(class_ref))?;
        self.emit(OP_CONST);
        self.emit_idx(class_const, "constants")?;
        self.emit(OP_SET_GLOBAL);
        self.emit_idx(global_idx, "globals")?;

        let class_scope = self.scope_for(id)?;
        self.scope_stack.push(class_scope);
        for member in items.iter().skip(3) {
            let result = self.gen_method(member, class_const);
            if result.is_err() {
                self.scope_stack.pop();
                return result;
            }
        }
        self.scope_stack.pop();
        Ok(())
    }

    fn gen_method(&mut self, member: &Expr, class_const: usize) -> Result<(), Error> {
        let Expr::List(id, items) = member else {
            return Err(Error::TypeError(
                "class members must be (def …) forms".to_owned(),
            ));
        };
        if !member.is_tagged("def") {
            return Err(Error::TypeError(
                "class members must be (def …) forms".to_owned(),
            ));
        }
        let method_name = Self::binding_name(items.get(1), "def")?.to_owned();
        let (params, body) = Self::function_parts(items, 2, "def")?;

        self.compile_function(*id, &method_name, params, body)?;
        self.emit(OP_CONST);
        self.emit_idx(class_const, "constants")?;
        let prop_idx = self.string_const_idx(&method_name)?;
        self.emit(OP_SET_PROP);
        self.emit_idx(prop_idx, "constants")?;
        self.emit(OP_POP);
        Ok(())
    }

    /// A call: the callee lands in slot 0, arguments follow in order.
    fn gen_call(&mut self, items: &[Expr]) -> Result<(), Error> {
        if items.is_empty() {
            return Err(Error::TypeError("cannot call an empty list".to_owned()));
        }
        for item in items {
            self.r#gen(item)?;
        }
        self.emit(OP_CALL);
        self.emit_idx(items.len() - 1, "call arguments")?;
        Ok(())
    }

    // ----------------------------------------------------------------
    // Function compilation.

    /// Compiles one function body into its own code object and emits the
    /// code that produces the function value in the enclosing code.
    fn compile_function(
        &mut self,
        id: NodeId,
        name: &str,
        params: &Expr,
        body: &Expr,
    ) -> Result<(), Error> {
        let fn_scope = self.scope_for(id)?;
        self.scope_stack.push(fn_scope.clone());

        let Expr::List(_, param_list) = params else {
            return Err(Error::TypeError("parameter list must be a list".to_owned()));
        };
        let arity = param_list.len();

        let prev_co = mem::replace(&mut self.co, CodeObject::new(name, arity));

        // Free variables first, own cells after; the VM relies on this
        // prefix order when wiring captured cells
        let free = fn_scope.borrow().free_vars();
        let cells = fn_scope.borrow().own_cells();
        self.co.free_count = free.len();
        self.co.cell_names = free;
        self.co.cell_names.extend(cells);
        if self.co.cell_names.len() > 256 {
            return Err(Error::CapacityExceeded("cells"));
        }

        // Slot 0 is the function itself, so recursion by name works
        self.declare_local(name)?;
        for param in param_list {
            let param_name = param
                .as_symbol()
                .ok_or_else(|| Error::TypeError("parameters must be symbols".to_owned()))?
                .to_owned();
            self.declare_local(&param_name)?;
            // A captured parameter is stored into its cell on entry; the
            // stack slot is left in place for OP_SCOPE_EXIT
            if let Some(cell_idx) = self.co.get_cell_index(&param_name) {
                self.emit(OP_SET_CELL);
                self.emit_idx(cell_idx, "cells")?;
            }
        }

        let result = self.r#gen(body);
        if let Err(e) = result {
            self.co = prev_co;
            self.scope_stack.pop();
            return Err(e);
        }
        // A begin body emits its own scope exit; anything else cleans up
        // the arguments and the function slot here
        if !body.is_tagged("begin") {
            self.emit(OP_SCOPE_EXIT);
            self.emit_idx(arity + 1, "locals")?;
        }
        self.emit(OP_RETURN);

        let finished = mem::replace(&mut self.co, prev_co);
        let is_plain = finished.cell_names.is_empty();
        let free_count = finished.free_count;
        let free_names: Vec<String> = finished.cell_names[..free_count].to_vec();
        let code_ref = self.register_code(finished);
        let code_idx = self.add_const(Value::Object(code_ref))?;

        if is_plain {
            // No captures anywhere: the function value is a compile-time
            // constant
            let fn_ref = self.heap.alloc(ObjectKind::Function(FunctionObject {
                co: code_ref,
                cells: Default::default(),
            }));
            self.constant_roots.push(fn_ref);
            let fn_idx = self.add_const(Value::Object(fn_ref))?;
            self.emit(OP_CONST);
            self.emit_idx(fn_idx, "constants")?;
        } else {
            // Push the captured cells of the enclosing function, then build
            // the closure at runtime
            for free_name in &free_names {
                let parent_idx = self
                    .co
                    .get_cell_index(free_name)
                    .ok_or_else(|| Error::ReferenceError(free_name.clone()))?;
                self.emit(OP_LOAD_CELL);
                self.emit_idx(parent_idx, "cells")?;
            }
            self.emit(OP_CONST);
            self.emit_idx(code_idx, "constants")?;
            self.emit(OP_MAKE_FUNCTION);
            self.emit_idx(free_count, "cells")?;
        }

        self.scope_stack.pop();
        Ok(())
    }

    // ----------------------------------------------------------------
    // Scope bookkeeping.

    fn scope_for(&self, id: NodeId) -> Result<ScopeRef, Error> {
        self.scopes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::TypeError("internal: no scope recorded for node".to_owned()))
    }

    fn scope_enter(&mut self, id: NodeId) -> Result<(), Error> {
        let scope = self.scope_for(id)?;
        self.scope_stack.push(scope);
        self.co.scope_level += 1;
        Ok(())
    }

    /// Pops this level's locals from the compile-time scratch stack and
    /// emits the matching runtime cleanup.
    fn scope_exit(&mut self) -> Result<(), Error> {
        let level = self.co.scope_level;
        let mut vars_count = 0;
        while self
            .co
            .locals
            .last()
            .is_some_and(|local| local.scope_level == level)
        {
            self.co.locals.pop();
            vars_count += 1;
        }

        // Function-body exit also cleans up the arguments and slot 0
        if self.is_function_body() {
            vars_count += self.co.arity + 1;
        }
        if vars_count > 0 {
            self.emit(OP_SCOPE_EXIT);
            self.emit_idx(vars_count, "locals")?;
        }

        self.co.scope_level -= 1;
        self.scope_stack.pop();
        Ok(())
    }

    fn is_function_body(&self) -> bool {
        self.co.name != "main" && self.co.scope_level == 1
    }

    /// The analyzer's classification of a name, as seen from the current
    /// scope.
    fn alloc_type(&self, name: &str) -> Result<AllocType, Error> {
        let scope = self
            .scope_stack
            .last()
            .ok_or_else(|| Error::TypeError("internal: empty scope stack".to_owned()))?;
        scope
            .borrow()
            .lookup(name)
            .ok_or_else(|| Error::ReferenceError(name.to_owned()))
    }

    fn declare_local(&mut self, name: &str) -> Result<(), Error> {
        if self.co.locals.len() >= 256 {
            return Err(Error::CapacityExceeded("locals"));
        }
        self.co.add_local(name);
        Ok(())
    }

    /// The cell slot for a name, appending it for block-owned cells that
    /// were not part of the function's entry set.
    fn cell_index_or_insert(&mut self, name: &str) -> Result<usize, Error> {
        if let Some(idx) = self.co.get_cell_index(name) {
            return Ok(idx);
        }
        if self.co.cell_names.len() >= 256 {
            return Err(Error::CapacityExceeded("cells"));
        }
        self.co.cell_names.push(name.to_owned());
        Ok(self.co.cell_names.len() - 1)
    }

    // ----------------------------------------------------------------
    // Constants.

    fn add_const(&mut self, value: Value) -> Result<usize, Error> {
        if self.co.constants.len() >= 256 {
            return Err(Error::CapacityExceeded("constants"));
        }
        self.co.constants.push(value);
        Ok(self.co.constants.len() - 1)
    }

    fn numeric_const_idx(&mut self, value: f64) -> Result<usize, Error> {
        if let Some(idx) = self
            .co
            .constants
            .iter()
            .position(|c| matches!(c, Value::Number(n) if *n == value))
        {
            return Ok(idx);
        }
        self.add_const(Value::Number(value))
    }

    fn boolean_const_idx(&mut self, value: bool) -> Result<usize, Error> {
        if let Some(idx) = self
            .co
            .constants
            .iter()
            .position(|c| matches!(c, Value::Boolean(b) if *b == value))
        {
            return Ok(idx);
        }
        self.add_const(Value::Boolean(value))
    }

    /// String constants are deduplicated by content within one code object:
    /// they are heap objects, and duplicates waste allocation.
    fn string_const_idx(&mut self, value: &str) -> Result<usize, Error> {
        for (idx, constant) in self.co.constants.iter().enumerate() {
            if let Value::Object(obj) = constant
                && let Ok(existing) = self.heap.string(*obj)
                && existing == value
            {
                return Ok(idx);
            }
        }
        let obj = self.heap.alloc(ObjectKind::Str(value.to_owned()));
        self.constant_roots.push(obj);
        self.add_const(Value::Object(obj))
    }

    fn register_code(&mut self, co: CodeObject) -> ObjRef {
        let code_ref = self.heap.alloc(ObjectKind::Code(co));
        self.constant_roots.push(code_ref);
        self.code_objects.push(code_ref);
        code_ref
    }

    // ----------------------------------------------------------------
    // Emission.

    fn emit(&mut self, byte: u8) {
        self.co.code.push(byte);
    }

    fn emit_idx(&mut self, idx: usize, what: &'static str) -> Result<(), Error> {
        let byte = u8::try_from(idx).map_err(|_| Error::CapacityExceeded(what))?;
        self.emit(byte);
        Ok(())
    }

    fn offset(&self) -> Result<usize, Error> {
        if self.co.code.len() > u16::MAX as usize {
            return Err(Error::CapacityExceeded("bytecode bytes"));
        }
        Ok(self.co.code.len())
    }

    /// Writes a 16-bit big-endian jump target at a reserved offset.
    fn patch_jump_address(&mut self, offset: usize, target: usize) {
        self.co.code[offset] = ((target >> 8) & 0xff) as u8;
        self.co.code[offset + 1] = (target & 0xff) as u8;
    }

    // ----------------------------------------------------------------
    // Shared shape helpers.

    fn binding_name<'e>(expr: Option<&'e Expr>, form: &str) -> Result<&'e str, Error> {
        expr.and_then(Expr::as_symbol)
            .ok_or_else(|| Error::TypeError(format!("{form} requires a symbol name")))
    }

    fn function_parts<'e>(
        items: &'e [Expr],
        params_at: usize,
        form: &str,
    ) -> Result<(&'e Expr, &'e Expr), Error> {
        match (items.get(params_at), items.get(params_at + 1)) {
            (Some(params), Some(body)) => Ok((params, body)),
            _ => Err(Error::TypeError(format!(
                "{form} requires a parameter list and a body"
            ))),
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::parser::parse;

    struct Compiled {
        heap: Heap,
        globals: GlobalTable,
        output: CompileOutput,
    }

    fn compile(src: &str) -> Result<Compiled, Error> {
        let mut heap = Heap::new();
        let mut globals = GlobalTable::new();
        let program = parse(&format!("(begin {src})"))?;
        let output = Compiler::new(&mut heap, &mut globals).compile(&program)?;
        Ok(Compiled {
            heap,
            globals,
            output,
        })
    }

    fn main_code(compiled: &Compiled) -> &CodeObject {
        let main = compiled.heap.function(compiled.output.main).unwrap();
        compiled.heap.code(main.co).unwrap()
    }

    #[test]
    fn test_number_literal() {
        let compiled = compile("42").unwrap();
        let co = main_code(&compiled);
        assert_eq!(co.code, vec![OP_CONST, 0, OP_HALT]);
        assert_eq!(co.constants, vec![Value::Number(42.0)]);
    }

    #[test]
    fn test_constants_are_deduplicated() {
        let compiled = compile("(+ (+ 5 5) \"s\") \"s\"").unwrap();
        let co = main_code(&compiled);
        let numbers = co
            .constants
            .iter()
            .filter(|c| matches!(c, Value::Number(_)))
            .count();
        let strings = co
            .constants
            .iter()
            .filter(|c| matches!(c, Value::Object(_)))
            .count();
        assert_eq!(numbers, 1, "5 appears once in the pool");
        assert_eq!(strings, 1, "\"s\" appears once in the pool");
    }

    #[test]
    fn test_binary_and_compare_encoding() {
        let compiled = compile("(< (+ 1 2) 4)").unwrap();
        let co = main_code(&compiled);
        assert_eq!(
            co.code,
            vec![
                OP_CONST, 0, OP_CONST, 1, OP_ADD, OP_CONST, 2, OP_COMPARE, 0, OP_HALT
            ]
        );
    }

    #[test]
    fn test_if_patches_both_jumps() {
        let compiled = compile("(if true 1 2)").unwrap();
        let co = main_code(&compiled);
        // CONST true, JMP_IF_FALSE <else>, CONST 1, JMP <end>, CONST 2, HALT
        assert_eq!(co.code[0], OP_CONST);
        assert_eq!(co.code[2], OP_JMP_IF_FALSE);
        let else_target = ((co.code[3] as usize) << 8) | co.code[4] as usize;
        assert_eq!(co.code[5], OP_CONST);
        assert_eq!(co.code[7], OP_JMP);
        let end_target = ((co.code[8] as usize) << 8) | co.code[9] as usize;
        assert_eq!(else_target, 10, "false lands on the alternate");
        assert_eq!(co.code[10], OP_CONST);
        assert_eq!(end_target, 12, "end lands after the alternate");
        assert_eq!(co.code[12], OP_HALT);
    }

    #[test]
    fn test_if_without_alternate_pushes_false() {
        let compiled = compile("(if false 1)").unwrap();
        let co = main_code(&compiled);
        assert!(co.constants.contains(&Value::Boolean(false)));
    }

    #[test]
    fn test_while_jumps_back_to_test() {
        let compiled = compile("(var i 0) (while (< i 3) (set i (+ i 1)))").unwrap();
        let co = main_code(&compiled);
        // Find the unconditional back jump and check its target is the
        // loop test, not the loop body
        let mut back_target = None;
        let mut pc = 0;
        while pc < co.code.len() {
            let op = co.code[pc];
            match op {
                OP_JMP => {
                    back_target = Some(((co.code[pc + 1] as usize) << 8) | co.code[pc + 2] as usize);
                    pc += 3;
                }
                OP_JMP_IF_FALSE => pc += 3,
                OP_HALT | OP_ADD | OP_POP | OP_RETURN => pc += 1,
                _ => pc += 2,
            }
        }
        let target = back_target.unwrap();
        assert_eq!(co.code[target], OP_GET_GLOBAL, "back jump lands on the test");
    }

    #[test]
    fn test_global_var_defines_and_sets() {
        let compiled = compile("(var x 10) x").unwrap();
        let co = main_code(&compiled);
        let x_idx = compiled.globals.get_index("x").unwrap() as u8;
        assert_eq!(x_idx, 0, "first global in a bare table");
        // CONST 10, SET_GLOBAL x, POP, GET_GLOBAL x, HALT
        assert_eq!(
            co.code,
            vec![
                OP_CONST, 0, OP_SET_GLOBAL, x_idx, OP_POP, OP_GET_GLOBAL, x_idx, OP_HALT
            ]
        );
    }

    #[test]
    fn test_set_undefined_global_is_reference_error() {
        assert!(matches!(
            compile("(set nope 1)"),
            Err(Error::ReferenceError(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_block_locals_use_stack_slots() {
        let compiled = compile("(begin (var t 5) t)").unwrap();
        let co = main_code(&compiled);
        // Outer begin is main; inner begin: CONST 5 (slot), GET_LOCAL 0,
        // SCOPE_EXIT 1, HALT
        assert_eq!(
            co.code,
            vec![OP_CONST, 0, OP_GET_LOCAL, 0, OP_SCOPE_EXIT, 1, OP_HALT]
        );
    }

    #[test]
    fn test_plain_function_is_a_compile_time_constant() {
        let compiled = compile("(def square (x) (* x x)) (square 4)").unwrap();
        let co = main_code(&compiled);
        // Pool: code object for square, compile-time function, 4
        let kinds: Vec<String> = co
            .constants
            .iter()
            .map(|c| compiled.heap.value_type_string(*c))
            .collect();
        assert!(kinds.contains(&"CODE".to_owned()));
        assert!(kinds.contains(&"FUNCTION".to_owned()));

        let square_ref = compiled.output.code_objects[0];
        let square = compiled.heap.code(square_ref).unwrap();
        assert_eq!(square.name, "square");
        assert_eq!(square.arity, 1);
        assert_eq!(square.free_count, 0);
        assert!(square.cell_names.is_empty());
        // GET_LOCAL x, GET_LOCAL x, MUL, SCOPE_EXIT arity+1, RETURN
        assert_eq!(
            square.code,
            vec![
                OP_GET_LOCAL, 1, OP_GET_LOCAL, 1, OP_MUL, OP_SCOPE_EXIT, 2, OP_RETURN
            ]
        );
    }

    #[test]
    fn test_closure_emits_load_cell_and_make_function() {
        let compiled = compile("(def make-adder (x) (lambda (y) (+ x y)))").unwrap();

        let outer_ref = compiled
            .output
            .code_objects
            .iter()
            .find(|r| compiled.heap.code(**r).unwrap().name == "make-adder")
            .copied()
            .unwrap();
        let outer = compiled.heap.code(outer_ref).unwrap();
        assert_eq!(outer.cell_names, vec!["x".to_owned()]);
        assert_eq!(outer.free_count, 0, "x is make-adder's own cell");
        // Entry stores the captured param into its cell
        assert_eq!(&outer.code[..2], &[OP_SET_CELL, 0]);
        // The lambda is built at runtime from the parent cell
        let window: Vec<u8> = outer.code.to_vec();
        let pos = window
            .windows(2)
            .position(|w| w == [OP_LOAD_CELL, 0])
            .unwrap();
        assert_eq!(window[pos + 2], OP_CONST);
        assert_eq!(window[pos + 4], OP_MAKE_FUNCTION);
        assert_eq!(window[pos + 5], 1);

        let inner_ref = compiled
            .output
            .code_objects
            .iter()
            .find(|r| compiled.heap.code(**r).unwrap().name == "lambda")
            .copied()
            .unwrap();
        let inner = compiled.heap.code(inner_ref).unwrap();
        assert_eq!(inner.cell_names, vec!["x".to_owned()]);
        assert_eq!(inner.free_count, 1, "x is free in the lambda");
    }

    #[test]
    fn test_var_lambda_takes_binding_name() {
        let compiled = compile("(var twice (lambda (n) (* n 2)))").unwrap();
        let named = compiled
            .output
            .code_objects
            .iter()
            .any(|r| compiled.heap.code(*r).unwrap().name == "twice");
        assert!(named, "the lambda is named after the binding");
    }

    #[test]
    fn test_constant_pool_capacity() {
        let body: String = (0..300).map(|i| format!("(+ 0 {i}.5)")).collect::<Vec<_>>().join(" ");
        assert!(matches!(
            compile(&body),
            Err(Error::CapacityExceeded("constants"))
        ));
    }

    #[test]
    fn test_class_compiles_to_runtime_property_installs() {
        let compiled = compile(
            "(class Point null \
               (def constructor (self x) (begin (set (prop self x) x) self)))",
        )
        .unwrap();
        let co = main_code(&compiled);
        assert!(compiled.globals.exists("Point"));
        assert!(co.code.contains(&OP_SET_PROP));

        let class_const = co
            .constants
            .iter()
            .find_map(|c| c.as_object())
            .map(|r| compiled.heap.class(r));
        assert!(matches!(class_const, Some(Ok(class)) if class.name == "Point"));
    }

    #[test]
    fn test_unknown_superclass_is_reference_error() {
        assert!(matches!(
            compile("(class Dog Animal (def constructor (self) self))"),
            Err(Error::ReferenceError(name)) if name == "Animal"
        ));
    }
}
