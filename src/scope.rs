//! Scope analysis: decides, before any code is emitted, whether each
//! binding lives as a global, a stack-resident local, or a heap cell.
//!
//! The analyzer walks the AST top-down building a tree of scope records
//! (GLOBAL at the root, FUNCTION for `def`/`lambda`, BLOCK for `begin`,
//! CLASS for `class` bodies), keyed by the [`NodeId`] of the introducing
//! list node. Each symbol reference runs [`Scope::maybe_promote`]: if
//! resolution crosses a function boundary before finding the definition,
//! the name is promoted to a cell in its owning scope and threaded through
//! the `free` set of every intermediate scope, so an outer closure passes
//! it through even when it does not reference the name itself.
//!
//! The compiler consumes the result to translate every variable reference
//! into one of the six GET/SET × GLOBAL/LOCAL/CELL opcodes without
//! re-resolving anything.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::Error;
use crate::ast::{Expr, NodeId};
use crate::opcode;

/// What kind of binding region a scope record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeType {
    Global,
    Function,
    Block,
    Class,
}

/// Where a binding lives at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocType {
    Global,
    Local,
    Cell,
}

pub type ScopeRef = Rc<RefCell<Scope>>;

/// Scope records for one program, keyed by AST-node identity.
pub type ScopeMap = HashMap<NodeId, ScopeRef>;

/// One scope record.
#[derive(Debug)]
pub struct Scope {
    pub scope_type: ScopeType,
    parent: Option<ScopeRef>,
    /// Classification of every name declared or referenced in this scope.
    /// References cache their resolution here; only `declared` entries
    /// count as definitions during resolution.
    alloc_info: HashMap<String, AllocType>,
    /// Names actually bound in this scope (declarations, not references).
    declared: HashSet<String>,
    /// Free variables (captured from an enclosing function), insertion order.
    free: Vec<String>,
    /// Own cells (locals captured by inner closures), insertion order.
    cells: Vec<String>,
}

impl Scope {
    pub fn root() -> ScopeRef {
        Rc::new(RefCell::new(Scope {
            scope_type: ScopeType::Global,
            parent: None,
            alloc_info: HashMap::new(),
            declared: HashSet::new(),
            free: Vec::new(),
            cells: Vec::new(),
        }))
    }

    pub fn child(scope_type: ScopeType, parent: &ScopeRef) -> ScopeRef {
        Rc::new(RefCell::new(Scope {
            scope_type,
            parent: Some(Rc::clone(parent)),
            alloc_info: HashMap::new(),
            declared: HashSet::new(),
            free: Vec::new(),
            cells: Vec::new(),
        }))
    }

    /// Declares a name in this scope: GLOBAL in the global scope, LOCAL
    /// anywhere else.
    pub fn add_local(&mut self, name: &str) {
        let alloc = if self.scope_type == ScopeType::Global {
            AllocType::Global
        } else {
            AllocType::Local
        };
        self.alloc_info.insert(name.to_owned(), alloc);
        self.declared.insert(name.to_owned());
    }

    /// Registers an own cell (a local promoted to the heap).
    fn add_cell(&mut self, name: &str) {
        self.alloc_info.insert(name.to_owned(), AllocType::Cell);
        self.declared.insert(name.to_owned());
        if !self.cells.iter().any(|cell| cell == name) {
            self.cells.push(name.to_owned());
        }
    }

    /// Registers a free variable (a cell owned by an enclosing scope).
    fn add_free(&mut self, name: &str) {
        self.alloc_info.insert(name.to_owned(), AllocType::Cell);
        if !self.free.iter().any(|free| free == name) {
            self.free.push(name.to_owned());
        }
    }

    /// The recorded classification of a name in this scope, if any.
    pub fn lookup(&self, name: &str) -> Option<AllocType> {
        self.alloc_info.get(name).copied()
    }

    /// Free variables in recorded order.
    pub fn free_vars(&self) -> Vec<String> {
        self.free.clone()
    }

    /// Own cells in recorded order.
    pub fn own_cells(&self) -> Vec<String> {
        self.cells.clone()
    }

    /// Potentially promotes a referenced variable from local to cell.
    ///
    /// Resolution starts in `scope`; crossing any FUNCTION boundary before
    /// the definition is found turns the classification into CELL, and
    /// resolving into the global scope turns it into GLOBAL. Unresolved
    /// names are a compile-time reference error.
    pub fn maybe_promote(scope: &ScopeRef, name: &str) -> Result<(), Error> {
        let init = {
            let s = scope.borrow();
            s.lookup(name).unwrap_or(if s.scope_type == ScopeType::Global {
                AllocType::Global
            } else {
                AllocType::Local
            })
        };
        // Already promoted
        if init == AllocType::Cell {
            return Ok(());
        }

        let (owner, alloc) = Self::resolve(scope, name, init)?;
        scope.borrow_mut().alloc_info.insert(name.to_owned(), alloc);
        if alloc == AllocType::Cell {
            Self::promote(scope, name, &owner);
        }
        Ok(())
    }

    /// Resolves a name through the scope chain, tracking how the
    /// classification changes as boundaries are crossed.
    fn resolve(
        start: &ScopeRef,
        name: &str,
        mut alloc: AllocType,
    ) -> Result<(ScopeRef, AllocType), Error> {
        let mut current = Rc::clone(start);
        loop {
            if current.borrow().declared.contains(name) {
                return Ok((current, alloc));
            }
            // Leaving a function without resolving: the binding is free
            if current.borrow().scope_type == ScopeType::Function {
                alloc = AllocType::Cell;
            }
            let parent = current.borrow().parent.clone();
            match parent {
                None => return Err(Error::ReferenceError(name.to_owned())),
                Some(parent) => {
                    if parent.borrow().scope_type == ScopeType::Global {
                        alloc = AllocType::Global;
                    }
                    current = parent;
                }
            }
        }
    }

    /// Promotes a variable to a cell: the owner records it as an own cell
    /// and every intermediate scope down to the referencing one records it
    /// as free.
    fn promote(from: &ScopeRef, name: &str, owner: &ScopeRef) {
        owner.borrow_mut().add_cell(name);
        let mut current = Rc::clone(from);
        while !Rc::ptr_eq(&current, owner) {
            current.borrow_mut().add_free(name);
            let parent = current.borrow().parent.clone();
            match parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }
}

/// Analyzes a whole program (the top-level `(begin …)` wrapper) and returns
/// the scope records keyed by node identity.
///
/// `predefined` seeds the root scope with the names already present in the
/// global table (natives and constants installed at VM startup), so
/// references to them classify as GLOBAL instead of failing resolution.
pub fn analyze<'a>(
    program: &Expr,
    predefined: impl IntoIterator<Item = &'a str>,
) -> Result<ScopeMap, Error> {
    let mut analyzer = Analyzer {
        map: HashMap::new(),
    };
    let root = Scope::root();
    for name in predefined {
        root.borrow_mut().add_local(name);
    }
    match program {
        Expr::List(id, items) if program.is_tagged("begin") => {
            analyzer.map.insert(*id, Rc::clone(&root));
            for item in &items[1..] {
                analyzer.analyze_node(item, &root)?;
            }
        }
        other => analyzer.analyze_node(other, &root)?,
    }
    Ok(analyzer.map)
}

struct Analyzer {
    map: ScopeMap,
}

impl Analyzer {
    fn analyze_node(&mut self, expr: &Expr, scope: &ScopeRef) -> Result<(), Error> {
        match expr {
            Expr::Number(_) | Expr::Str(_) => Ok(()),
            Expr::Symbol(name) => {
                if name == "true" || name == "false" {
                    return Ok(());
                }
                Scope::maybe_promote(scope, name)
            }
            Expr::List(id, items) => match expr.tag() {
                Some("begin") => {
                    let block = Scope::child(ScopeType::Block, scope);
                    self.map.insert(*id, Rc::clone(&block));
                    for item in &items[1..] {
                        self.analyze_node(item, &block)?;
                    }
                    Ok(())
                }
                Some("var") => {
                    let name = Self::binding_name(items.get(1), "var")?;
                    scope.borrow_mut().add_local(name);
                    match items.get(2) {
                        Some(init) => self.analyze_node(init, scope),
                        None => Err(Error::TypeError("var requires an initializer".to_owned())),
                    }
                }
                Some("set") => {
                    match items.get(1) {
                        Some(Expr::Symbol(name)) => Scope::maybe_promote(scope, name)?,
                        Some(target) if target.is_tagged("prop") => {
                            // (set (prop obj name) value): the object is the
                            // only variable reference in the target
                            if let Expr::List(_, prop_items) = target
                                && let Some(object) = prop_items.get(1)
                            {
                                self.analyze_node(object, scope)?;
                            }
                        }
                        _ => {
                            return Err(Error::TypeError(
                                "set target must be a symbol or (prop …)".to_owned(),
                            ));
                        }
                    }
                    match items.get(2) {
                        Some(value) => self.analyze_node(value, scope),
                        None => Err(Error::TypeError("set requires a value".to_owned())),
                    }
                }
                Some("if") | Some("while") => {
                    for item in &items[1..] {
                        self.analyze_node(item, scope)?;
                    }
                    Ok(())
                }
                Some("def") => {
                    let name = Self::binding_name(items.get(1), "def")?.to_owned();
                    scope.borrow_mut().add_local(&name);
                    let (params, body) = Self::function_parts(items, 2, "def")?;
                    self.analyze_function(*id, Some(&name), params, body, scope)
                }
                Some("lambda") => {
                    let (params, body) = Self::function_parts(items, 1, "lambda")?;
                    self.analyze_function(*id, None, params, body, scope)
                }
                Some("class") => {
                    let name = Self::binding_name(items.get(1), "class")?;
                    scope.borrow_mut().add_local(name);
                    // The superclass symbol is resolved by the compiler
                    // against previously compiled classes, not at runtime.
                    let class_scope = Scope::child(ScopeType::Class, scope);
                    self.map.insert(*id, Rc::clone(&class_scope));
                    for member in items.iter().skip(3) {
                        self.analyze_node(member, &class_scope)?;
                    }
                    Ok(())
                }
                Some("prop") => match items.get(1) {
                    Some(object) => self.analyze_node(object, scope),
                    None => Err(Error::TypeError("prop requires an object".to_owned())),
                },
                Some(op) if opcode::arithmetic_op(op).is_some()
                    || opcode::compare_op(op).is_some() =>
                {
                    for item in &items[1..] {
                        self.analyze_node(item, scope)?;
                    }
                    Ok(())
                }
                _ => {
                    // A call: the callee (skipping the `new` tag) and every
                    // argument are references
                    let skip = usize::from(expr.is_tagged("new"));
                    for item in items.iter().skip(skip) {
                        self.analyze_node(item, scope)?;
                    }
                    Ok(())
                }
            },
        }
    }

    fn analyze_function(
        &mut self,
        id: NodeId,
        self_name: Option<&str>,
        params: &Expr,
        body: &Expr,
        scope: &ScopeRef,
    ) -> Result<(), Error> {
        let fn_scope = Scope::child(ScopeType::Function, scope);
        self.map.insert(id, Rc::clone(&fn_scope));
        if let Some(name) = self_name {
            fn_scope.borrow_mut().add_local(name);
        }
        let Expr::List(_, param_list) = params else {
            return Err(Error::TypeError("parameter list must be a list".to_owned()));
        };
        for param in param_list {
            match param.as_symbol() {
                Some(name) => fn_scope.borrow_mut().add_local(name),
                None => {
                    return Err(Error::TypeError("parameters must be symbols".to_owned()));
                }
            }
        }
        self.analyze_node(body, &fn_scope)
    }

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

    /// Analyze a program and return (scope map, root expr).
    fn analyzed(src: &str) -> (ScopeMap, Expr) {
        let program = parse(&format!("(begin {src})")).unwrap();
        let map = analyze(&program, []).unwrap();
        (map, program)
    }

    fn scope_of(map: &ScopeMap, expr: &Expr) -> ScopeRef {
        let Expr::List(id, _) = expr else {
            panic!("not a list");
        };
        Rc::clone(map.get(id).unwrap())
    }

    #[test]
    fn test_top_level_var_is_global() {
        let (map, program) = analyzed("(var x 10) x");
        let root = scope_of(&map, &program);
        assert_eq!(root.borrow().lookup("x"), Some(AllocType::Global));
    }

    #[test]
    fn test_function_params_are_local() {
        let (map, program) = analyzed("(def square (x) (* x x))");
        let Expr::List(_, items) = &program else {
            panic!()
        };
        let def_scope = scope_of(&map, &items[1]);
        assert_eq!(def_scope.borrow().scope_type, ScopeType::Function);
        assert_eq!(def_scope.borrow().lookup("x"), Some(AllocType::Local));
        assert_eq!(def_scope.borrow().lookup("square"), Some(AllocType::Local));
        assert!(def_scope.borrow().free_vars().is_empty());
        assert!(def_scope.borrow().own_cells().is_empty());
    }

    #[test]
    fn test_captured_param_is_promoted_to_cell() {
        let (map, program) = analyzed("(def make-adder (x) (lambda (y) (+ x y)))");
        let Expr::List(_, items) = &program else {
            panic!()
        };
        let def_node = &items[1];
        let def_scope = scope_of(&map, def_node);

        // The outer function owns the cell
        assert_eq!(def_scope.borrow().lookup("x"), Some(AllocType::Cell));
        assert_eq!(def_scope.borrow().own_cells(), vec!["x".to_owned()]);

        // The lambda sees it as a free variable
        let Expr::List(_, def_items) = def_node else {
            panic!()
        };
        let lambda_scope = scope_of(&map, &def_items[3]);
        assert_eq!(lambda_scope.borrow().lookup("x"), Some(AllocType::Cell));
        assert_eq!(lambda_scope.borrow().free_vars(), vec!["x".to_owned()]);
        assert_eq!(lambda_scope.borrow().lookup("y"), Some(AllocType::Local));
    }

    #[test]
    fn test_global_reference_from_function_stays_global() {
        let (map, program) = analyzed("(var version 2) (def get () version)");
        let Expr::List(_, items) = &program else {
            panic!()
        };
        let def_scope = scope_of(&map, &items[2]);
        assert_eq!(def_scope.borrow().lookup("version"), Some(AllocType::Global));
        assert!(def_scope.borrow().free_vars().is_empty());
    }

    #[test]
    fn test_pass_through_capture_threads_intermediate_scope() {
        // The middle lambda never references x itself but must pass it down
        let (map, program) =
            analyzed("(def outer (x) (lambda (a) (lambda (b) (+ x b))))");
        let Expr::List(_, items) = &program else {
            panic!()
        };
        let Expr::List(_, def_items) = &items[1] else {
            panic!()
        };
        let middle = &def_items[3];
        let middle_scope = scope_of(&map, middle);
        assert_eq!(middle_scope.borrow().free_vars(), vec!["x".to_owned()]);

        let Expr::List(_, middle_items) = middle else {
            panic!()
        };
        let inner_scope = scope_of(&map, &middle_items[2]);
        assert_eq!(inner_scope.borrow().free_vars(), vec!["x".to_owned()]);
    }

    #[test]
    fn test_unresolved_reference_is_an_error() {
        let program = parse("(begin (+ nope 1))").unwrap();
        assert!(matches!(
            analyze(&program, []),
            Err(Error::ReferenceError(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_predefined_names_resolve_as_global() {
        let program = parse("(begin (native-square VERSION))").unwrap();
        let map = analyze(&program, ["native-square", "VERSION"]).unwrap();
        let Expr::List(root_id, _) = &program else {
            panic!()
        };
        let root = map.get(root_id).unwrap();
        assert_eq!(root.borrow().lookup("VERSION"), Some(AllocType::Global));
        assert_eq!(
            root.borrow().lookup("native-square"),
            Some(AllocType::Global)
        );
    }

    #[test]
    fn test_block_local_in_function() {
        let (map, program) = analyzed("(def f () (begin (var t 5) t))");
        let Expr::List(_, items) = &program else {
            panic!()
        };
        let Expr::List(_, def_items) = &items[1] else {
            panic!()
        };
        let body_scope = scope_of(&map, &def_items[3]);
        assert_eq!(body_scope.borrow().scope_type, ScopeType::Block);
        assert_eq!(body_scope.borrow().lookup("t"), Some(AllocType::Local));
    }

    #[test]
    fn test_cached_reference_does_not_become_an_owner() {
        // The block references x before the lambda captures it; the cell
        // must land on the declaring function, not on the block that
        // merely cached a resolution
        let (map, program) = analyzed("(def f (x) (begin (+ x 0) (lambda () x)))");
        let Expr::List(_, items) = &program else {
            panic!()
        };
        let def_node = &items[1];
        let def_scope = scope_of(&map, def_node);
        assert_eq!(def_scope.borrow().own_cells(), vec!["x".to_owned()]);

        let Expr::List(_, def_items) = def_node else {
            panic!()
        };
        let body_scope = scope_of(&map, &def_items[3]);
        assert!(body_scope.borrow().own_cells().is_empty());
        // The block's earlier Local cache is rewritten by the promotion
        assert_eq!(body_scope.borrow().lookup("x"), Some(AllocType::Cell));
    }

    #[test]
    fn test_true_false_are_not_references() {
        let program = parse("(begin true false)").unwrap();
        assert!(analyze(&program, []).is_ok());
    }
}
