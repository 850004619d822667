//! Embedding API.
//!
//! A [`Vm`] owns one compilation: load source, register native
//! functions, compile, run the start function, resolve compiled
//! functions and globals by `name.signature`, and catch runtime panics.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::analysis::Analyzer;
use crate::ast::{Ast, FnId, FuncDecl, Scope, StmtId, StmtKind, VarDecl};
use crate::backend::{Backend, Compiled};
use crate::error::{Diagnostic, Diagnostics};
use crate::intern::Interner;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::runtime::{self, RuntimePanic};
use crate::token::{Span, Token, TokenKind};
use crate::types::DataType;

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// Callback invoked for runtime panics: once with the reason and the
/// panic site's span, then once per resolved stack frame.
pub type PanicCallback = Box<dyn FnMut(&str, i32, i32)>;

struct External {
    name: String,
    params: Vec<DataType>,
    ret: DataType,
    address: *const u8,
}

pub struct Vm {
    id: u64,
    interner: Interner,
    ast: Ast,
    diagnostics: Diagnostics,
    source: Option<String>,
    source_dir: PathBuf,
    externals: Vec<External>,
    logging: bool,
    panic_callback: Option<PanicCallback>,
    compiled: Option<Compiled>,
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            id: NEXT_VM_ID.fetch_add(1, Ordering::Relaxed),
            interner: Interner::new(),
            ast: Ast::new(),
            diagnostics: Diagnostics::new(),
            source: None,
            source_dir: PathBuf::from("."),
            externals: Vec::new(),
            logging: false,
            panic_callback: None,
            compiled: None,
        }
    }

    pub fn set_error_callback(
        &mut self,
        callback: impl FnMut(i32, i32, i32, i32, &str) + 'static,
    ) {
        self.diagnostics.set_callback(Box::new(callback));
    }

    pub fn set_panic_callback(&mut self, callback: impl FnMut(&str, i32, i32) + 'static) {
        self.panic_callback = Some(Box::new(callback));
    }

    /// When enabled, the IR of every function is dumped to standard
    /// output before code generation.
    pub fn set_logging(&mut self, logging: bool) {
        self.logging = logging;
    }

    pub fn load_str(&mut self, source: &str) -> bool {
        self.source = Some(source.to_string());
        true
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(source) => {
                self.source = Some(source);
                self.source_dir =
                    path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
                true
            }
            Err(error) => {
                self.diagnostics
                    .report(Span::default(), format!("Could not read file: {}", error));
                false
            }
        }
    }

    /// Registers an external native function. The signature takes the
    /// form `<return_type> <name>(<param_types>)`, for example
    /// `void print(string text)`.
    ///
    /// # Safety contract
    ///
    /// `address` must point to an `extern "C"` function matching the
    /// declared signature; it is called directly from generated code.
    pub fn register_function(&mut self, signature: &str, address: *const u8) -> bool {
        match parse_signature(signature) {
            Some((name, params, ret)) => {
                self.externals.push(External { name, params, ret, address });
                true
            }
            None => {
                self.diagnostics.report(
                    Span::default(),
                    format!("Invalid function signature '{}'.", signature),
                );
                false
            }
        }
    }

    /// Runs lex, parse, analyze, lower, link and codegen. Returns false
    /// if any stage reported an error.
    pub fn compile(&mut self) -> bool {
        let Some(source) = self.source.clone() else {
            self.diagnostics.report(Span::default(), "No source loaded.");
            return false;
        };

        self.ast.reset();
        self.diagnostics.clear();

        let tokens = Lexer::new(&source, &mut self.interner).scan(&mut self.diagnostics);
        let statements =
            Parser::new(tokens, &mut self.ast, &mut self.interner, &mut self.diagnostics).parse();

        let mut visited = HashSet::new();
        let base = self.source_dir.clone();
        self.expand_imports(&statements, &base, &mut visited);

        let external_funcs = self.declare_externals();

        let analysis =
            Analyzer::new(&mut self.ast, &mut self.interner, &mut self.diagnostics)
                .run(&statements, &external_funcs);

        if self.diagnostics.has_errors() {
            return false;
        }

        let symbols: Vec<(String, *const u8)> =
            self.externals.iter().map(|e| (e.name.clone(), e.address)).collect();

        let mut backend =
            match Backend::new(&self.ast, &self.interner, self.logging, self.id, &symbols) {
                Ok(backend) => backend,
                Err(message) => {
                    self.diagnostics.report(Span::default(), message);
                    return false;
                }
            };

        if !backend.compile(
            &statements,
            &analysis.globals,
            &analysis.start_locals,
            &mut self.diagnostics,
        ) {
            return false;
        }

        self.compiled = Some(backend.into_compiled());
        true
    }

    /// Runs the start function inside a panic frame.
    pub fn run(&mut self) -> bool {
        let Some(start) = self.compiled.as_ref().and_then(Compiled::start_address) else {
            return false;
        };

        let entry: unsafe extern "C-unwind" fn() = unsafe { std::mem::transmute(start) };
        self.try_catch(|| unsafe { entry() }).is_some()
    }

    /// Invokes `body`, which may call into generated code. A runtime
    /// panic unwinds here, drives the panic callback (reason first, then
    /// one call per stack frame), and yields `None`. Frames nest.
    pub fn try_catch<R>(&mut self, body: impl FnOnce() -> R) -> Option<R> {
        match runtime::catch(body) {
            Ok(value) => Some(value),
            Err(panic) => {
                self.dispatch_panic(&panic);
                None
            }
        }
    }

    fn dispatch_panic(&mut self, panic: &RuntimePanic) {
        if let Some(callback) = self.panic_callback.as_mut() {
            callback(&panic.reason, panic.line, panic.column);
            for frame in &panic.frames {
                callback(frame, 0, 0);
            }
        }
    }

    /// Resolves a compiled function by `name.signature`, e.g.
    /// `adder.int(int, int)`.
    pub fn get_function(&self, name: &str) -> Option<*const u8> {
        self.compiled.as_ref()?.function_address(name)
    }

    /// Resolves a global variable's storage by `name.signature`, e.g.
    /// `counter.int`.
    pub fn get_variable(&self, name: &str) -> Option<*const u8> {
        self.compiled.as_ref()?.variable_address(name)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.diagnostics.diagnostics()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn expand_imports(
        &mut self,
        statements: &[StmtId],
        base: &Path,
        visited: &mut HashSet<PathBuf>,
    ) {
        for &statement in statements {
            let StmtKind::Import { path, .. } = &self.ast.stmt(statement).kind else {
                continue;
            };
            let path = *path;
            let token = self.ast.stmt(statement).token;

            let file = base.join(self.interner.resolve(path));
            let canonical = file.canonicalize().unwrap_or_else(|_| file.clone());
            if !visited.insert(canonical) {
                continue;
            }

            let source = match std::fs::read_to_string(&file) {
                Ok(source) => source,
                Err(error) => {
                    self.diagnostics
                        .report(token.span, format!("Could not read import: {}", error));
                    continue;
                }
            };

            let tokens = Lexer::new(&source, &mut self.interner).scan(&mut self.diagnostics);
            let body =
                Parser::new(tokens, &mut self.ast, &mut self.interner, &mut self.diagnostics)
                    .parse();

            let nested_base =
                file.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
            self.expand_imports(&body, &nested_base, visited);

            if let StmtKind::Import { body: slot, .. } = &mut self.ast.stmt_mut(statement).kind {
                *slot = body;
            }
        }
    }

    /// Builds imported declarations for the built-in `log` sinks and the
    /// host-registered externals.
    fn declare_externals(&mut self) -> Vec<FnId> {
        let mut funcs = Vec::new();

        let log_overloads: [(&str, DataType); 5] = [
            ("log(int)", DataType::Int),
            ("log(bool)", DataType::Bool),
            ("log(float)", DataType::Float),
            ("log(char)", DataType::Char),
            ("log(string)", DataType::Str),
        ];
        for (symbol, param) in log_overloads {
            funcs.push(self.import_decl("log", symbol, vec![param], DataType::Void));
        }

        let externals: Vec<(String, Vec<DataType>, DataType)> = self
            .externals
            .iter()
            .map(|e| (e.name.clone(), e.params.clone(), e.ret.clone()))
            .collect();
        for (name, params, ret) in externals {
            let symbol = name.clone();
            funcs.push(self.import_decl(&name, &symbol, params, ret));
        }

        funcs
    }

    fn import_decl(
        &mut self,
        name: &str,
        symbol: &str,
        params: Vec<DataType>,
        ret: DataType,
    ) -> FnId {
        let name_token =
            Token::new(TokenKind::Identifier, self.interner.intern(name), Span::default());

        let mut decl = FuncDecl::new(name_token);
        decl.imported = true;
        decl.mangled = symbol.to_string();
        decl.ret = ret;

        for param in params {
            let param_token =
                Token::new(TokenKind::Identifier, self.interner.intern("n"), Span::default());
            let var = self.ast.alloc_var(VarDecl {
                name: param_token,
                ty_expr: None,
                ty: param,
                initializer: None,
                scope: Scope::Local,
                index: 0,
                offset: 0,
            });
            decl.params.push(var);
        }

        self.ast.alloc_func(decl)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if let Some(compiled) = self.compiled.take() {
            // Generated code dies with the VM; the embedding contract
            // forbids calling previously returned pointers afterwards.
            unsafe { compiled.destroy() };
        }
    }
}

/// Parses `<return_type> <name>(<param_types>)`.
fn parse_signature(signature: &str) -> Option<(String, Vec<DataType>, DataType)> {
    let open = signature.find('(')?;
    let close = signature.rfind(')')?;
    let head = signature[..open].trim();
    let body = &signature[open + 1..close];

    let mut head_parts = head.split_whitespace();
    let ret = parse_type_name(head_parts.next()?)?;
    let name = head_parts.next()?.to_string();
    if head_parts.next().is_some() {
        return None;
    }

    let mut params = Vec::new();
    for part in body.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        // Parameter names are optional and ignored.
        let type_name = part.split_whitespace().next()?;
        params.push(parse_type_name(type_name)?);
    }

    Some((name, params, ret))
}

fn parse_type_name(name: &str) -> Option<DataType> {
    match name {
        "void" => Some(DataType::Void),
        "int" => Some(DataType::Int),
        "float" => Some(DataType::Float),
        "bool" => Some(DataType::Bool),
        "char" => Some(DataType::Char),
        "string" => Some(DataType::Str),
        "any" => Some(DataType::Any),
        _ => {
            let inner = name.strip_prefix("array<")?.strip_suffix('>')?;
            Some(DataType::array(parse_type_name(inner)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_external_signatures() {
        let (name, params, ret) = parse_signature("void print(string text)").unwrap();
        assert_eq!(name, "print");
        assert_eq!(params, vec![DataType::Str]);
        assert_eq!(ret, DataType::Void);

        let (name, params, ret) = parse_signature("int add(int, int)").unwrap();
        assert_eq!(name, "add");
        assert_eq!(params.len(), 2);
        assert_eq!(ret, DataType::Int);

        let (_, params, _) = parse_signature("void fill(array<int> values)").unwrap();
        assert_eq!(params, vec![DataType::array(DataType::Int)]);
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert!(parse_signature("print(string)").is_none());
        assert!(parse_signature("void print string").is_none());
        assert!(parse_signature("void print(strng)").is_none());
    }

    #[test]
    fn compile_without_source_fails() {
        let mut vm = Vm::new();
        assert!(!vm.compile());
        assert!(!vm.diagnostics().is_empty());
    }

    #[test]
    fn compile_reports_semantic_errors() {
        let mut vm = Vm::new();
        vm.load_str("undefined_name\n");
        assert!(!vm.compile());
        assert!(vm.diagnostics()[0].message.contains("Undefined name"));
    }
}
