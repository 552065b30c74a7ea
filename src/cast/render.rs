//! Rendering the restricted AST back to C text.
//!
//! This is a thin, need-driven unparser: it only has to print the subset of
//! C this crate's AST can represent, not general C. Pretty-printing layout
//! choices (brace style, spacing) follow the `__main__.py` header's own
//! style in `original_source/shadowdp/__main__.py` (uppercase macro-style
//! `__VERIFIER_*` calls, `bool` typedef'd from `int`).

use super::{BinOp, Expr, Function, LValue, Param, Program, Statement, Type, UnOp};
use std::fmt::Write as _;

/// Extern declarations and macros every transformed program is prefixed
/// with, so the output compiles standalone against a model-checker runtime.
pub const HEADER: &str = r#"extern void __VERIFIER_error(void);
extern double __VERIFIER_nondet_float(void);
extern int __VERIFIER_nondet_int(void);
extern void __VERIFIER_assume(int);
extern void __assert_fail(const char *, const char *, unsigned int, const char *);
#define __VERIFIER_assert(cond) { if (!(cond)) { ERROR: __VERIFIER_error(); } }
#define Abs(x) ((x) < 0 ? -(x) : (x))
typedef int bool;
#define true 1
#define false 0
"#;

pub fn render_program(program: &Program) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');
    render_function(&program.function, &mut out);
    out
}

fn render_type(ty: &Type) -> String {
    match ty {
        Type::Int => "int".to_string(),
        Type::Float => "double".to_string(),
        Type::Array(inner) => render_type(inner),
    }
}

fn render_param(param: &Param) -> String {
    match &param.ty {
        Type::Array(inner) => format!("{} {}[]", render_type(inner), param.name),
        other => format!("{} {}", render_type(other), param.name),
    }
}

fn render_function(function: &Function, out: &mut String) {
    let params: Vec<String> = function.params.iter().map(render_param).collect();
    let _ = writeln!(
        out,
        "{} {}({}) {{",
        render_type(&function.return_type),
        function.name,
        params.join(", ")
    );
    render_block(&function.body, 1, out);
    out.push_str("}\n");
}

fn indent(level: usize, out: &mut String) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

fn render_block(statements: &[Statement], level: usize, out: &mut String) {
    for stmt in statements {
        render_statement(stmt, level, out);
    }
}

fn render_statement(stmt: &Statement, level: usize, out: &mut String) {
    indent(level, out);
    match stmt {
        Statement::StringAnnotation { text, .. } => {
            let _ = writeln!(out, "\"{}\";", text);
        }
        Statement::Decl { name, ty, init, .. } => match init {
            Some(expr) => {
                let _ = writeln!(out, "{} {} = {};", render_type(ty), name, render_expr(expr));
            }
            None => {
                let _ = writeln!(out, "{} {};", render_type(ty), name);
            }
        },
        Statement::Assign { lvalue, rvalue, .. } => {
            let _ = writeln!(out, "{} = {};", render_lvalue(lvalue), render_expr(rvalue));
        }
        Statement::If {
            cond,
            then_branch,
            else_branch,
            ..
        } => {
            let _ = writeln!(out, "if ({}) {{", render_expr(cond));
            render_block(then_branch, level + 1, out);
            indent(level, out);
            match else_branch {
                Some(else_stmts) => {
                    out.push_str("} else {\n");
                    render_block(else_stmts, level + 1, out);
                    indent(level, out);
                    out.push_str("}\n");
                }
                None => out.push_str("}\n"),
            }
        }
        Statement::While { cond, body, .. } => {
            let _ = writeln!(out, "while ({}) {{", render_expr(cond));
            render_block(body, level + 1, out);
            indent(level, out);
            out.push_str("}\n");
        }
        Statement::Return { expr, .. } => {
            let _ = writeln!(out, "return {};", render_expr(expr));
        }
        Statement::Expr { expr, .. } => {
            let _ = writeln!(out, "{};", render_expr(expr));
        }
    }
}

fn render_lvalue(lvalue: &LValue) -> String {
    match lvalue {
        LValue::Id(name) => name.clone(),
        LValue::ArrayRef { name, subscript } => format!("{}[{}]", name, render_expr(subscript)),
    }
}

fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::Num(v) => {
            if v.0.fract() == 0.0 {
                format!("{}", v.0 as i64)
            } else {
                format!("{}", v.0)
            }
        }
        Expr::Str(s) => format!("\"{}\"", s),
        Expr::Id(name) => name.clone(),
        Expr::ArrayRef { name, subscript } => format!("{}[{}]", name, render_expr(subscript)),
        Expr::Binary { op, left, right } => {
            format!("({} {} {})", render_expr(left), op, render_expr(right))
        }
        Expr::Unary { op, expr } => match op {
            UnOp::Abs => format!("Abs({})", render_expr(expr)),
            _ => format!("({}{})", op, render_expr(expr)),
        },
        Expr::Ternary {
            cond,
            iftrue,
            iffalse,
        } => format!(
            "({} ? {} : {})",
            render_expr(cond),
            render_expr(iftrue),
            render_expr(iffalse)
        ),
        Expr::Call { name, args } => {
            let args_str: Vec<String> = args.iter().map(render_expr).collect();
            format!("{}({})", name, args_str.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceLocation;

    #[test]
    fn renders_simple_return() {
        let function = Function {
            name: "f".to_string(),
            params: vec![],
            return_type: Type::Int,
            body: vec![Statement::Return {
                expr: Expr::num(0.0),
                location: SourceLocation::unknown(),
            }],
            location: SourceLocation::unknown(),
        };
        let program = Program { function };
        let rendered = render_program(&program);
        assert!(rendered.contains("int f() {"));
        assert!(rendered.contains("return 0;"));
    }

    #[test]
    fn renders_binary_op_parenthesized() {
        let e = Expr::bin(BinOp::Add, Expr::id("x"), Expr::num(1.0));
        assert_eq!(render_expr(&e), "(x + 1)");
    }
}
