//! Static pre-execution validation
//!
//! Parses a snippet into a Python AST and rejects constructs on a deny-list
//! before any environment is spun up. This is a cheap pre-filter against
//! obviously hostile code, NOT a security boundary: a determined adversary
//! can route around any deny-list. The isolated environment is the actual
//! guarantee; this exists so we don't pay container start-up cost for code
//! that is visibly trying to `os.system` its way out.
//!
//! Fails closed: source that does not parse is rejected.

use std::collections::HashSet;

use rustpython_parser::{ast, Parse};
use serde::{Deserialize, Serialize};

/// Deny-list driving the validator. Operator-tunable configuration, not
/// hard-coded policy: the defaults match what the interpreter image does not
/// need for ordinary data-wrangling snippets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenyList {
    /// Module roots that may not be imported (`import os`, `from os import ...`).
    pub modules: HashSet<String>,
    /// Builtins that may not even be referenced (`eval`, `__import__`, ...).
    /// Includes the reflection primitives that reach symbols by computed
    /// name, which would otherwise bypass the rest of the list.
    pub builtins: HashSet<String>,
    /// Method names that may not be called (`.system()`, `.connect()`, ...).
    pub attributes: HashSet<String>,
    /// Optional import allow-list. Empty = any import not in `modules` is
    /// fine; non-empty = an import must match one wildcard pattern
    /// (e.g. `numpy*`, `pandas`) on its full dotted name or its root.
    pub allowed_import_patterns: Vec<String>,
}

impl Default for DenyList {
    fn default() -> Self {
        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            modules: set(&[
                "os",
                "sys",
                "subprocess",
                "socket",
                "shutil",
                "pathlib",
                "ctypes",
                "multiprocessing",
                "threading",
                "selectors",
                "resource",
                "psutil",
            ]),
            builtins: set(&[
                "exec",
                "eval",
                "compile",
                "__import__",
                "open",
                "input",
                "getattr",
                "globals",
            ]),
            attributes: set(&[
                "system", "popen", "Popen", "run", "call", "check_call", "check_output",
                "remove", "unlink", "rmdir", "walk", "fork", "spawn", "execv", "execve",
                "kill", "terminate", "connect", "send", "recv",
            ]),
            allowed_import_patterns: Vec::new(),
        }
    }
}

impl DenyList {
    /// Parse a comma-separated pattern list (the `SANDBOX_ALLOWED_IMPORTS`
    /// format) into the allow-list.
    pub fn with_allowed_imports(mut self, raw: &str) -> Self {
        self.allowed_import_patterns = raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    fn import_allowed(&self, module: &str) -> bool {
        if self.allowed_import_patterns.is_empty() {
            return true;
        }
        let root = module.split('.').next().unwrap_or(module);
        self.allowed_import_patterns
            .iter()
            .any(|p| wildcard_match(p, module) || wildcard_match(p, root))
    }
}

/// One rejected construct, with its 1-based source position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub construct: String,
    pub line: usize,
    pub column: usize,
}

/// Outcome of static validation. Produced once per request, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub allowed: bool,
    pub violations: Vec<Violation>,
}

impl ValidationVerdict {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            allowed: violations.is_empty(),
            violations,
        }
    }
}

/// Validate a snippet against the deny-list. Purely analytic: nothing is
/// executed, no filesystem or process state is touched.
pub fn validate(source: &str, deny: &DenyList) -> ValidationVerdict {
    let suite = match ast::Suite::parse(source, "<snippet>") {
        Ok(suite) => suite,
        Err(err) => {
            let (line, column) = line_col(source, usize::from(err.offset));
            return ValidationVerdict::from_violations(vec![Violation {
                construct: format!("syntax error: {}", err.error),
                line,
                column,
            }]);
        }
    };

    let mut walker = Walker {
        source,
        deny,
        violations: Vec::new(),
    };
    for stmt in &suite {
        walker.stmt(stmt);
    }
    ValidationVerdict::from_violations(walker.violations)
}

/// Convert a byte offset into 1-based line/column.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let mut line = 1;
    let mut column = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

/// `*`-only wildcard matcher for import allow-list patterns.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((head, tail)) => {
            if !text.starts_with(head) {
                return false;
            }
            let rest = &text[head.len()..];
            if tail.is_empty() {
                return true;
            }
            let mut starts: Vec<usize> = rest.char_indices().map(|(i, _)| i).collect();
            starts.push(rest.len());
            starts.into_iter().any(|i| wildcard_match(tail, &rest[i..]))
        }
    }
}

struct Walker<'a> {
    source: &'a str,
    deny: &'a DenyList,
    violations: Vec<Violation>,
}

impl Walker<'_> {
    fn flag(&mut self, construct: String, offset: usize) {
        let (line, column) = line_col(self.source, offset);
        self.violations.push(Violation {
            construct,
            line,
            column,
        });
    }

    fn check_import(&mut self, module: &str, offset: usize) {
        let root = module.split('.').next().unwrap_or(module);
        if self.deny.modules.contains(root) {
            self.flag(format!("import of denied module `{module}`"), offset);
        } else if !self.deny.import_allowed(module) {
            self.flag(format!("import `{module}` not allowed by policy"), offset);
        }
    }

    fn body(&mut self, body: &[ast::Stmt]) {
        for stmt in body {
            self.stmt(stmt);
        }
    }

    fn exprs(&mut self, exprs: &[ast::Expr]) {
        for expr in exprs {
            self.expr(expr);
        }
    }

    fn opt_expr(&mut self, expr: &Option<Box<ast::Expr>>) {
        if let Some(expr) = expr {
            self.expr(expr);
        }
    }

    fn comprehensions(&mut self, generators: &[ast::Comprehension]) {
        for gen in generators {
            self.expr(&gen.target);
            self.expr(&gen.iter);
            self.exprs(&gen.ifs);
        }
    }

    fn keywords(&mut self, keywords: &[ast::Keyword]) {
        for kw in keywords {
            self.expr(&kw.value);
        }
    }

    fn stmt(&mut self, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::Import(ast::StmtImport { names, range, .. }) => {
                for alias in names {
                    self.check_import(alias.name.as_str(), usize::from(range.start()));
                }
            }
            ast::Stmt::ImportFrom(ast::StmtImportFrom { module, range, .. }) => {
                // Relative imports (`from . import x`) carry no module name;
                // they can only reach code already inside the scratch dir.
                if let Some(module) = module {
                    self.check_import(module.as_str(), usize::from(range.start()));
                }
            }
            ast::Stmt::FunctionDef(ast::StmtFunctionDef {
                body,
                decorator_list,
                returns,
                ..
            }) => {
                self.body(body);
                self.exprs(decorator_list);
                self.opt_expr(returns);
            }
            ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                body,
                decorator_list,
                returns,
                ..
            }) => {
                self.body(body);
                self.exprs(decorator_list);
                self.opt_expr(returns);
            }
            ast::Stmt::ClassDef(ast::StmtClassDef {
                bases,
                keywords,
                body,
                decorator_list,
                ..
            }) => {
                self.exprs(bases);
                self.keywords(keywords);
                self.body(body);
                self.exprs(decorator_list);
            }
            ast::Stmt::Return(ast::StmtReturn { value, .. }) => self.opt_expr(value),
            ast::Stmt::Delete(ast::StmtDelete { targets, .. }) => self.exprs(targets),
            ast::Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.exprs(targets);
                self.expr(value);
            }
            ast::Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                self.expr(target);
                self.expr(value);
            }
            ast::Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => {
                self.expr(target);
                self.expr(annotation);
                self.opt_expr(value);
            }
            ast::Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.expr(target);
                self.expr(iter);
                self.body(body);
                self.body(orelse);
            }
            ast::Stmt::AsyncFor(ast::StmtAsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.expr(target);
                self.expr(iter);
                self.body(body);
                self.body(orelse);
            }
            ast::Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            }) => {
                self.expr(test);
                self.body(body);
                self.body(orelse);
            }
            ast::Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => {
                self.expr(test);
                self.body(body);
                self.body(orelse);
            }
            ast::Stmt::With(ast::StmtWith { items, body, .. }) => {
                for item in items {
                    self.expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.expr(vars);
                    }
                }
                self.body(body);
            }
            ast::Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                for item in items {
                    self.expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.expr(vars);
                    }
                }
                self.body(body);
            }
            ast::Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                self.expr(subject);
                for case in cases {
                    if let Some(guard) = &case.guard {
                        self.expr(guard);
                    }
                    self.body(&case.body);
                }
            }
            ast::Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                self.opt_expr(exc);
                self.opt_expr(cause);
            }
            ast::Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.body(body);
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if let Some(type_) = &h.type_ {
                        self.expr(type_);
                    }
                    self.body(&h.body);
                }
                self.body(orelse);
                self.body(finalbody);
            }
            ast::Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.expr(test);
                self.opt_expr(msg);
            }
            ast::Stmt::Expr(ast::StmtExpr { value, .. }) => self.expr(value),
            // Pass / Break / Continue / Global / Nonlocal carry nothing to check.
            _ => {}
        }
    }

    fn expr(&mut self, expr: &ast::Expr) {
        match expr {
            ast::Expr::Name(ast::ExprName { id, range, .. }) => {
                if self.deny.builtins.contains(id.as_str()) {
                    self.flag(
                        format!("use of denied builtin `{id}`"),
                        usize::from(range.start()),
                    );
                }
            }
            ast::Expr::Call(ast::ExprCall {
                func,
                args,
                keywords,
                range,
                ..
            }) => {
                if let ast::Expr::Attribute(ast::ExprAttribute { attr, .. }) = func.as_ref() {
                    if self.deny.attributes.contains(attr.as_str()) {
                        self.flag(
                            format!("call of denied method `.{attr}()`"),
                            usize::from(range.start()),
                        );
                    }
                }
                self.expr(func);
                self.exprs(args);
                self.keywords(keywords);
            }
            ast::Expr::Attribute(ast::ExprAttribute { value, .. }) => self.expr(value),
            ast::Expr::BoolOp(ast::ExprBoolOp { values, .. }) => self.exprs(values),
            ast::Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.expr(target);
                self.expr(value);
            }
            ast::Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.expr(left);
                self.expr(right);
            }
            ast::Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => self.expr(operand),
            ast::Expr::Lambda(ast::ExprLambda { body, .. }) => self.expr(body),
            ast::Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => {
                self.expr(test);
                self.expr(body);
                self.expr(orelse);
            }
            ast::Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                for key in keys.iter().flatten() {
                    self.expr(key);
                }
                self.exprs(values);
            }
            ast::Expr::Set(ast::ExprSet { elts, .. }) => self.exprs(elts),
            ast::Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            }) => {
                self.expr(elt);
                self.comprehensions(generators);
            }
            ast::Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            }) => {
                self.expr(elt);
                self.comprehensions(generators);
            }
            ast::Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.expr(key);
                self.expr(value);
                self.comprehensions(generators);
            }
            ast::Expr::GeneratorExp(ast::ExprGeneratorExp {
                elt, generators, ..
            }) => {
                self.expr(elt);
                self.comprehensions(generators);
            }
            ast::Expr::Await(ast::ExprAwait { value, .. }) => self.expr(value),
            ast::Expr::Yield(ast::ExprYield { value, .. }) => self.opt_expr(value),
            ast::Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => self.expr(value),
            ast::Expr::Compare(ast::ExprCompare {
                left, comparators, ..
            }) => {
                self.expr(left);
                self.exprs(comparators);
            }
            ast::Expr::FormattedValue(ast::ExprFormattedValue { value, .. }) => self.expr(value),
            ast::Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => self.exprs(values),
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.expr(value);
                self.expr(slice);
            }
            ast::Expr::Starred(ast::ExprStarred { value, .. }) => self.expr(value),
            ast::Expr::List(ast::ExprList { elts, .. }) => self.exprs(elts),
            ast::Expr::Tuple(ast::ExprTuple { elts, .. }) => self.exprs(elts),
            ast::Expr::Slice(ast::ExprSlice {
                lower, upper, step, ..
            }) => {
                self.opt_expr(lower);
                self.opt_expr(upper);
                self.opt_expr(step);
            }
            // Constants and anything newer than this walker carry no calls.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(source: &str) -> ValidationVerdict {
        validate(source, &DenyList::default())
    }

    #[test]
    fn test_clean_source_allowed() {
        let v = verdict("x = 1 + 2\nprint(x)\n");
        assert!(v.allowed);
        assert!(v.violations.is_empty());
    }

    #[test]
    fn test_denied_import_rejected_with_location() {
        let v = verdict("x = 1\nimport socket\n");
        assert!(!v.allowed);
        assert_eq!(v.violations.len(), 1);
        assert!(v.violations[0].construct.contains("socket"));
        assert_eq!(v.violations[0].line, 2);
        assert_eq!(v.violations[0].column, 1);
    }

    #[test]
    fn test_import_from_rejected() {
        let v = verdict("from os.path import join\n");
        assert!(!v.allowed);
        assert!(v.violations[0].construct.contains("os.path"));
    }

    #[test]
    fn test_denied_builtin_rejected() {
        for src in ["eval('1')", "exec('x = 1')", "__import__('os')", "open('f')"] {
            let v = verdict(src);
            assert!(!v.allowed, "should reject: {src}");
        }
    }

    #[test]
    fn test_reflection_primitives_rejected() {
        let v = verdict("getattr(object, 'sub' + 'class')\n");
        assert!(!v.allowed);
        assert!(v.violations[0].construct.contains("getattr"));
    }

    #[test]
    fn test_denied_attribute_call_rejected() {
        // Even through an alias the method name itself is enough.
        let v = verdict("x = something\nx.system('rm -rf /')\n");
        assert!(!v.allowed);
        assert!(v.violations[0].construct.contains("system"));
        assert_eq!(v.violations[0].line, 2);
    }

    #[test]
    fn test_nested_violation_found() {
        let v = verdict("def f():\n    if True:\n        return [eval(s) for s in data]\n");
        assert!(!v.allowed);
        assert_eq!(v.violations[0].line, 3);
    }

    #[test]
    fn test_all_violations_collected() {
        let v = verdict("import socket\nimport subprocess\neval('x')\n");
        assert!(!v.allowed);
        assert_eq!(v.violations.len(), 3);
    }

    #[test]
    fn test_syntax_error_fails_closed() {
        let v = verdict("def broken(:\n");
        assert!(!v.allowed);
        assert!(v.violations[0].construct.starts_with("syntax error"));
    }

    #[test]
    fn test_allow_list_patterns() {
        let deny = DenyList::default().with_allowed_imports("math, numpy*");
        assert!(validate("import math\n", &deny).allowed);
        assert!(validate("import numpy.linalg\n", &deny).allowed);
        assert!(!validate("import requests\n", &deny).allowed);
    }

    #[test]
    fn test_empty_allow_list_permits_undenied_imports() {
        assert!(verdict("import json\nimport math\n").allowed);
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("numpy*", "numpy.linalg"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("a*c", "abc"));
        assert!(!wildcard_match("numpy*", "pandas"));
        assert!(!wildcard_match("a*c", "abd"));
    }
}
