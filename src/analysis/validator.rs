/// Static admission check for submitted source.
///
/// Parses the submission into a syntax tree and walks every node, flagging
/// deny-listed imports, deny-listed callable names, and attribute access
/// into interpreter internals. The candidate code is never executed; a
/// parse failure is itself a finding, never silently ignored.
use crate::config::policy::ExecutionPolicy;
use crate::config::types::{IssueKind, ValidationIssue};
use rustpython_parser::{ast, Parse};

/// Validate `source` against `policy`. Empty result means admissible;
/// any finding is a hard rejection before execution.
pub fn validate(source: &str, policy: &ExecutionPolicy) -> Vec<ValidationIssue> {
    let suite = match ast::Suite::parse(source, "<submission>") {
        Ok(suite) => suite,
        Err(err) => {
            return vec![ValidationIssue::new(
                IssueKind::SyntaxError,
                format!("syntax error: {err}"),
            )];
        }
    };

    let mut walker = Walker {
        policy,
        issues: Vec::new(),
    };
    walker.walk_body(&suite);
    walker.issues
}

struct Walker<'a> {
    policy: &'a ExecutionPolicy,
    issues: Vec<ValidationIssue>,
}

impl Walker<'_> {
    fn flag_import(&mut self, module: &str) {
        if self.policy.is_module_blocked(module) {
            let root = module.split('.').next().unwrap_or(module);
            self.issues.push(ValidationIssue::new(
                IssueKind::BlockedImport,
                format!("import of blocked module '{root}'"),
            ));
        }
    }

    fn walk_body(&mut self, body: &[ast::Stmt]) {
        for stmt in body {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::Import(ast::StmtImport { names, .. }) => {
                for alias in names {
                    self.flag_import(alias.name.as_str());
                }
            }
            ast::Stmt::ImportFrom(ast::StmtImportFrom { module, names, .. }) => {
                if let Some(module) = module {
                    self.flag_import(module.as_str());
                } else {
                    // Relative import: `from . import x` names submodules of
                    // the current package; check each imported name.
                    for alias in names {
                        self.flag_import(alias.name.as_str());
                    }
                }
            }
            ast::Stmt::FunctionDef(ast::StmtFunctionDef {
                args,
                body,
                decorator_list,
                returns,
                ..
            })
            | ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                args,
                body,
                decorator_list,
                returns,
                ..
            }) => {
                self.walk_arguments(args);
                self.walk_body(body);
                self.walk_exprs(decorator_list);
                self.walk_opt_expr(returns.as_deref());
            }
            ast::Stmt::ClassDef(ast::StmtClassDef {
                bases,
                keywords,
                body,
                decorator_list,
                ..
            }) => {
                self.walk_exprs(bases);
                self.walk_keywords(keywords);
                self.walk_body(body);
                self.walk_exprs(decorator_list);
            }
            ast::Stmt::Return(ast::StmtReturn { value, .. }) => {
                self.walk_opt_expr(value.as_deref());
            }
            ast::Stmt::Delete(ast::StmtDelete { targets, .. }) => {
                self.walk_exprs(targets);
            }
            ast::Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.walk_exprs(targets);
                self.walk_expr(value);
            }
            ast::Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                self.walk_expr(target);
                self.walk_expr(value);
            }
            ast::Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => {
                self.walk_expr(target);
                self.walk_expr(annotation);
                self.walk_opt_expr(value.as_deref());
            }
            ast::Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            })
            | ast::Stmt::AsyncFor(ast::StmtAsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.walk_expr(target);
                self.walk_expr(iter);
                self.walk_body(body);
                self.walk_body(orelse);
            }
            ast::Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            }) => {
                self.walk_expr(test);
                self.walk_body(body);
                self.walk_body(orelse);
            }
            ast::Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => {
                self.walk_expr(test);
                self.walk_body(body);
                self.walk_body(orelse);
            }
            ast::Stmt::With(ast::StmtWith { items, body, .. })
            | ast::Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                for item in items {
                    self.walk_expr(&item.context_expr);
                    self.walk_opt_expr(item.optional_vars.as_deref());
                }
                self.walk_body(body);
            }
            ast::Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                self.walk_expr(subject);
                for case in cases {
                    self.walk_pattern(&case.pattern);
                    self.walk_opt_expr(case.guard.as_deref());
                    self.walk_body(&case.body);
                }
            }
            ast::Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                self.walk_opt_expr(exc.as_deref());
                self.walk_opt_expr(cause.as_deref());
            }
            ast::Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            })
            | ast::Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.walk_body(body);
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    self.walk_opt_expr(h.type_.as_deref());
                    self.walk_body(&h.body);
                }
                self.walk_body(orelse);
                self.walk_body(finalbody);
            }
            ast::Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.walk_expr(test);
                self.walk_opt_expr(msg.as_deref());
            }
            ast::Stmt::Expr(ast::StmtExpr { value, .. }) => {
                self.walk_expr(value);
            }
            // Global, Nonlocal, Pass, Break, Continue carry no expressions.
            _ => {}
        }
    }

    fn walk_expr(&mut self, expr: &ast::Expr) {
        match expr {
            ast::Expr::Call(ast::ExprCall {
                func,
                args,
                keywords,
                ..
            }) => {
                if let ast::Expr::Name(ast::ExprName { id, .. }) = func.as_ref() {
                    let callee = id.as_str();
                    if self.policy.blocked_callables.contains(callee) {
                        self.issues.push(ValidationIssue::new(
                            IssueKind::BlockedCallable,
                            format!("call to blocked callable '{callee}'"),
                        ));
                    }
                }
                self.walk_expr(func);
                self.walk_exprs(args);
                self.walk_keywords(keywords);
            }
            ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                let attr_name = attr.as_str();
                if self.policy.blocked_attributes.contains(attr_name) {
                    self.issues.push(ValidationIssue::new(
                        IssueKind::BlockedAttribute,
                        format!("access to blocked attribute '{attr_name}'"),
                    ));
                }
                if let Some(root) = attribute_chain_root(expr) {
                    if self.policy.blocked_modules.contains(root) {
                        self.issues.push(ValidationIssue::new(
                            IssueKind::BlockedAttribute,
                            format!("attribute access into blocked module '{root}'"),
                        ));
                    }
                }
                self.walk_expr(value);
            }
            ast::Expr::BoolOp(ast::ExprBoolOp { values, .. }) => {
                self.walk_exprs(values);
            }
            ast::Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.walk_expr(target);
                self.walk_expr(value);
            }
            ast::Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            ast::Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => {
                self.walk_expr(operand);
            }
            ast::Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                self.walk_arguments(args);
                self.walk_expr(body);
            }
            ast::Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => {
                self.walk_expr(test);
                self.walk_expr(body);
                self.walk_expr(orelse);
            }
            ast::Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                for key in keys.iter().flatten() {
                    self.walk_expr(key);
                }
                self.walk_exprs(values);
            }
            ast::Expr::Set(ast::ExprSet { elts, .. })
            | ast::Expr::List(ast::ExprList { elts, .. })
            | ast::Expr::Tuple(ast::ExprTuple { elts, .. }) => {
                self.walk_exprs(elts);
            }
            ast::Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            })
            | ast::Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            })
            | ast::Expr::GeneratorExp(ast::ExprGeneratorExp {
                elt, generators, ..
            }) => {
                self.walk_expr(elt);
                self.walk_comprehensions(generators);
            }
            ast::Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.walk_expr(key);
                self.walk_expr(value);
                self.walk_comprehensions(generators);
            }
            ast::Expr::Await(ast::ExprAwait { value, .. })
            | ast::Expr::YieldFrom(ast::ExprYieldFrom { value, .. })
            | ast::Expr::Starred(ast::ExprStarred { value, .. }) => {
                self.walk_expr(value);
            }
            ast::Expr::Yield(ast::ExprYield { value, .. }) => {
                self.walk_opt_expr(value.as_deref());
            }
            ast::Expr::Compare(ast::ExprCompare {
                left, comparators, ..
            }) => {
                self.walk_expr(left);
                self.walk_exprs(comparators);
            }
            ast::Expr::FormattedValue(ast::ExprFormattedValue {
                value, format_spec, ..
            }) => {
                self.walk_expr(value);
                self.walk_opt_expr(format_spec.as_deref());
            }
            ast::Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => {
                self.walk_exprs(values);
            }
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.walk_expr(value);
                self.walk_expr(slice);
            }
            ast::Expr::Slice(ast::ExprSlice {
                lower, upper, step, ..
            }) => {
                self.walk_opt_expr(lower.as_deref());
                self.walk_opt_expr(upper.as_deref());
                self.walk_opt_expr(step.as_deref());
            }
            // Name and Constant are leaves.
            _ => {}
        }
    }

    fn walk_pattern(&mut self, pattern: &ast::Pattern) {
        match pattern {
            ast::Pattern::MatchValue(ast::PatternMatchValue { value, .. }) => {
                self.walk_expr(value);
            }
            ast::Pattern::MatchSequence(ast::PatternMatchSequence { patterns, .. })
            | ast::Pattern::MatchOr(ast::PatternMatchOr { patterns, .. }) => {
                for pattern in patterns {
                    self.walk_pattern(pattern);
                }
            }
            ast::Pattern::MatchMapping(ast::PatternMatchMapping { keys, patterns, .. }) => {
                self.walk_exprs(keys);
                for pattern in patterns {
                    self.walk_pattern(pattern);
                }
            }
            ast::Pattern::MatchClass(ast::PatternMatchClass {
                cls,
                patterns,
                kwd_patterns,
                ..
            }) => {
                self.walk_expr(cls);
                for pattern in patterns.iter().chain(kwd_patterns) {
                    self.walk_pattern(pattern);
                }
            }
            ast::Pattern::MatchAs(ast::PatternMatchAs { pattern, .. }) => {
                if let Some(pattern) = pattern {
                    self.walk_pattern(pattern);
                }
            }
            // MatchSingleton and MatchStar carry no expressions.
            _ => {}
        }
    }

    fn walk_arguments(&mut self, args: &ast::Arguments) {
        for arg in args
            .posonlyargs
            .iter()
            .chain(&args.args)
            .chain(&args.kwonlyargs)
        {
            self.walk_opt_expr(arg.def.annotation.as_deref());
            self.walk_opt_expr(arg.default.as_deref());
        }
        for arg in args.vararg.iter().chain(&args.kwarg) {
            self.walk_opt_expr(arg.annotation.as_deref());
        }
    }

    fn walk_comprehensions(&mut self, generators: &[ast::Comprehension]) {
        for comp in generators {
            self.walk_expr(&comp.target);
            self.walk_expr(&comp.iter);
            self.walk_exprs(&comp.ifs);
        }
    }

    fn walk_keywords(&mut self, keywords: &[ast::Keyword]) {
        for keyword in keywords {
            self.walk_expr(&keyword.value);
        }
    }

    fn walk_exprs(&mut self, exprs: &[ast::Expr]) {
        for expr in exprs {
            self.walk_expr(expr);
        }
    }

    fn walk_opt_expr(&mut self, expr: Option<&ast::Expr>) {
        if let Some(expr) = expr {
            self.walk_expr(expr);
        }
    }
}

/// Root name of an attribute chain: `os.path.join` -> `os`. None when the
/// chain does not bottom out at a plain name.
fn attribute_chain_root(expr: &ast::Expr) -> Option<&str> {
    match expr {
        ast::Expr::Attribute(ast::ExprAttribute { value, .. }) => attribute_chain_root(value),
        ast::Expr::Name(ast::ExprName { id, .. }) => Some(id.as_str()),
        _ => None,
    }
}
