//! Lowers parsed JavaScript expressions to intermediate template
//! language text.
//!
//! Identifiers become `$`-variables unless they name a registered
//! runtime function, operators become the symbolic `__op__*` builtins,
//! and `${...}` string interpolation becomes an `__str` call per
//! segment. Constructs without a target form fail the compile; nothing
//! is silently dropped.

use std::collections::HashSet;

use crate::jsparse::{self, BinOp, Expr, ParseError, Stmt, UnOp};
use crate::value::format_f64;

fn op_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "__op__add",
        BinOp::Sub => "__op__sub",
        BinOp::Mul => "__op__mul",
        BinOp::Div => "__op__slash",
        BinOp::Rem => "__op__mod",
        BinOp::BitAnd => "__op__b_and",
        BinOp::BitOr => "__op__b_or",
        BinOp::BitXor => "__op__b_xor",
        BinOp::Shl => "__op__b_sleft",
        BinOp::Shr => "__op__b_sright",
        BinOp::UShr => "__op__b_usright",
        BinOp::LogAnd => "__op__and",
        BinOp::LogOr => "__op__or",
        BinOp::Eq => "__op__eql",
        BinOp::Neq => "__op__neq",
        BinOp::Lt => "__op__lt",
        BinOp::Gt => "__op__gt",
        BinOp::Lte => "__op__lte",
        BinOp::Gte => "__op__gte",
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

pub struct ExprTranspiler<'a> {
    funcs: &'a HashSet<String>,
    /// In raw mode expression output is not HTML-escaped.
    pub rawmode: bool,
    pub debug: bool,
}

impl<'a> ExprTranspiler<'a> {
    pub fn new(funcs: &'a HashSet<String>, debug: bool) -> Self {
        ExprTranspiler {
            funcs,
            rawmode: false,
            debug,
        }
    }

    /// Transform a JavaScript snippet into ITL text. `rawcode` selects
    /// statement parsing (`{ }` is a block) over expression parsing
    /// (`{ }` is an object literal).
    pub fn js_expr(
        &mut self,
        src: &str,
        wrap: bool,
        rawcode: bool,
    ) -> Result<String, ParseError> {
        let stmts = if rawcode {
            jsparse::parse_statements(src)?
        } else {
            vec![Stmt::Return(Some(jsparse::parse_expression(src)?))]
        };

        let mut out = String::new();
        for stmt in &stmts {
            out.push_str(&self.stmt(stmt, wrap, true)?);
            if self.debug && wrap && stmts.len() > 1 {
                out.push_str("     {{- \"\" -}}\n");
            }
        }
        Ok(out)
    }

    /// Render one already-parsed expression without wrapping.
    pub fn js_expr_ast(&mut self, expr: &Expr) -> Result<String, ParseError> {
        self.expr(expr, false, true)
    }

    fn stmt(&mut self, stmt: &Stmt, wrap: bool, dot: bool) -> Result<String, ParseError> {
        Ok(match stmt {
            Stmt::Empty => String::new(),
            Stmt::Expr(e) => self.expr(e, wrap, dot)?,
            Stmt::Var(decls) => {
                let mut out = String::new();
                for d in decls {
                    out.push_str(&self.expr(d, wrap, dot)?);
                }
                out
            }
            Stmt::Return(Some(e)) => self.expr(e, wrap, dot)?,
            Stmt::Return(None) => String::new(),
            Stmt::If { test, cons, alt } => {
                let mut out = format!("{{{{if {}}}}}", self.expr(test, false, true)?);
                out.push_str(&self.stmt(cons, true, true)?);
                if let Some(alt) = alt {
                    let branch = self.stmt(alt, true, true)?;
                    if !branch.is_empty() && branch != "{{null}}" {
                        out.push_str("{{else}}");
                        out.push_str(&branch);
                    }
                }
                out.push_str("{{end}}");
                out
            }
            Stmt::Block(list) => {
                let mut out = String::new();
                for s in list {
                    out.push_str(&self.stmt(s, wrap, true)?);
                }
                out
            }
            Stmt::ForIn { into, source, body } => {
                let mut out = format!(
                    "{{{{ range {} := (__range_helper_keys__ {}) }}}}",
                    self.expr(into, false, true)?,
                    self.expr(source, false, true)?,
                );
                out.push_str(&self.stmt(body, true, true)?);
                out.push_str("{{ end }}");
                out
            }
            Stmt::Try { body, param, catch } => {
                let mut out = String::from("{{ try }}");
                out.push_str(&self.stmt(body, wrap, true)?);
                out.push_str(&format!("{{{{ catch {param} }}}}"));
                out.push_str(&self.stmt(catch, wrap, true)?);
                out.push_str("{{ end }}");
                out
            }
            Stmt::Throw(e) => {
                let inner = format!("(__throw {})", self.expr(e, false, true)?);
                if wrap {
                    format!("{{{{{inner}}}}}")
                } else {
                    inner
                }
            }
        })
    }

    fn escape_wrap(&self, mut result: String, wrap: bool) -> String {
        if wrap {
            if !self.rawmode {
                result.push_str(" | __pug__html");
            }
            result = format!("{{{{{result}}}}}");
        }
        result
    }

    fn expr(&mut self, expr: &Expr, wrap: bool, dot: bool) -> Result<String, ParseError> {
        Ok(match expr {
            Expr::Ident(name) => {
                let name = if name == "range" { "__Range" } else { name };
                let mut result = String::new();
                if dot && !self.funcs.contains(name) {
                    result.push('$');
                }
                result.push_str(name);
                self.escape_wrap(result, wrap)
            }

            Expr::Str(value) => {
                if value.contains("${") {
                    let result = self.interpolate(value)?;
                    if wrap {
                        format!("{{{{{result}}}}}")
                    } else {
                        result
                    }
                } else if wrap {
                    crate::ops::html_escape(value)
                } else {
                    quote(value)
                }
            }

            Expr::Num(n) => format_f64(*n),
            Expr::Bool(b) => b.to_string(),

            Expr::Null => {
                if wrap {
                    "{{null}}".to_string()
                } else {
                    String::new()
                }
            }

            Expr::Array(items) | Expr::Seq(items) => {
                let mut result = String::from("(__op__array");
                for item in items {
                    let mut ex = self.expr(item, false, true)?;
                    if ex.is_empty() {
                        ex = "null".to_string();
                    }
                    result.push(' ');
                    result.push_str(&ex);
                }
                result.push(')');
                if wrap {
                    format!("{{{{{result}}}}}")
                } else {
                    result
                }
            }

            Expr::Object(props) => {
                let mut result = String::from("(__op__map");
                for (key, value) in props {
                    result.push_str(&format!(
                        " {} {}",
                        quote(key),
                        self.expr(value, false, true)?
                    ));
                }
                result.push(')');
                if wrap {
                    format!("{{{{{result}}}}}")
                } else {
                    result
                }
            }

            Expr::Regex { pattern, flags } => {
                let result =
                    format!("(__regexp {} {})", quote(pattern), quote(flags));
                self.escape_wrap(result, wrap)
            }

            Expr::Dot { left, name } => {
                let mut result = self.expr(left, false, true)?;
                result.push('.');
                result.push_str(name);
                self.escape_wrap(result, wrap)
            }

            Expr::Index { left, member } => {
                let result = format!(
                    "(__pug__index {} {})",
                    self.expr(left, false, true)?,
                    self.expr(member, false, true)?
                );
                self.escape_wrap(result, wrap)
            }

            Expr::Cond { test, cons, alt } => {
                let mut cons = self.expr(cons, false, true)?;
                if cons.is_empty() {
                    cons = "null".to_string();
                }
                let mut alt = self.expr(alt, false, true)?;
                if alt.is_empty() {
                    alt = "null".to_string();
                }
                let result = format!(
                    "(__if ({}) ({}) ({}) )",
                    self.expr(test, false, true)?,
                    cons,
                    alt
                );
                self.escape_wrap(result, wrap)
            }

            Expr::Binary { op, left, right } => {
                let result = format!(
                    "({} {} {})",
                    op_name(*op),
                    self.expr(left, false, true)?,
                    self.expr(right, false, true)?
                );
                self.escape_wrap(result, wrap)
            }

            Expr::Call { callee, args } => {
                let mut result = format!("({}", self.expr(callee, false, false)?);
                for a in args {
                    result.push(' ');
                    result.push_str(&self.expr(a, false, true)?);
                }
                result.push(')');
                self.escape_wrap(result, wrap)
            }

            Expr::New { callee: _, args } => {
                let mut result = String::from("(__op__array");
                for a in args {
                    let mut ex = self.expr(a, false, true)?;
                    if ex.is_empty() {
                        ex = "null".to_string();
                    }
                    result.push(' ');
                    result.push_str(&ex);
                }
                result.push(')');
                if wrap {
                    format!("{{{{{result}}}}}")
                } else {
                    result
                }
            }

            Expr::Assign { op, left, right } => {
                let result = if let Expr::Index { left: obj, member } = left.as_ref() {
                    let owner = self.expr(obj, false, false)?;
                    let owner = if owner.starts_with('(') {
                        owner
                    } else {
                        format!("${owner}")
                    };
                    format!(
                        "({owner}.__assign {} {})",
                        self.expr(member, false, true)?,
                        self.expr(right, false, true)?
                    )
                } else {
                    let n = self.expr(left, false, false)?;
                    let n = n.trim_start_matches('$').to_string();
                    let mut rhs = self.expr(right, false, true)?;
                    if rhs.is_empty() {
                        rhs = "null".to_string();
                    }
                    if let Some(idx) = n.rfind('.') {
                        // member assignment goes through __assign on
                        // the owning map
                        let (owner, field) = n.split_at(idx);
                        let owner = if owner.starts_with("(__pug__index ") {
                            owner.to_string()
                        } else {
                            format!("${owner}")
                        };
                        format!("({owner}.__assign {} {rhs})", quote(&field[1..]))
                    } else {
                        match op {
                            None => format!("${n} := {rhs}"),
                            Some(op) => {
                                format!("${n} := ({} ${n} {rhs})", op_name(*op))
                            }
                        }
                    }
                };
                if wrap {
                    format!("{{{{ {result} -}}}}")
                } else {
                    result
                }
            }

            Expr::VarDecl { name, init } => {
                let n = name.trim_start_matches('$');
                let init = match init {
                    Some(e) => {
                        let ex = self.expr(e, false, true)?;
                        if ex.is_empty() {
                            "null".to_string()
                        } else {
                            ex
                        }
                    }
                    None => "null".to_string(),
                };
                let result = format!("${n} := {init}");
                if wrap {
                    format!("{{{{ {result} -}}}}")
                } else {
                    result
                }
            }

            Expr::Unary { op, operand, .. } => match op {
                UnOp::Inc | UnOp::Dec => {
                    let target = self.expr(operand, false, true)?;
                    let name = if *op == UnOp::Inc {
                        "__op__inc"
                    } else {
                        "__op__dec"
                    };
                    let result = format!("{target} := {name} {target}");
                    if wrap {
                        format!("{{{{ {result} -}}}}")
                    } else {
                        format!("({result})")
                    }
                }
                other => {
                    let name = match other {
                        UnOp::Not => "__op__not",
                        UnOp::BitNot => "__op__bitnot",
                        UnOp::Neg | UnOp::Pos => "__op__sub",
                        UnOp::Delete => "__op__delete",
                        UnOp::Inc | UnOp::Dec => unreachable!(),
                    };
                    let result = format!("{name} {}", self.expr(operand, false, true)?);
                    if wrap {
                        format!("{{{{ {result} -}}}}")
                    } else {
                        format!("({result})")
                    }
                }
            },
        })
    }

    /// Split `pre ${expr} post` into an `__str` call over literal and
    /// expression segments; empty literals are dropped.
    fn interpolate(&mut self, input: &str) -> Result<String, ParseError> {
        let mut segments: Vec<String> = Vec::new();
        let mut literal = String::new();
        let chars: Vec<char> = input.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
                let mut j = i + 2;
                while j < chars.len() && chars[j] != '}' {
                    j += 1;
                }
                if j == chars.len() {
                    return Err(jsparse::parse_expression(input)
                        .err()
                        .unwrap_or_else(|| ParseError {
                            message: "unterminated ${ interpolation".to_string(),
                        }));
                }
                let sub: String = chars[i + 2..j].iter().collect();
                if !literal.is_empty() {
                    segments.push(quote(&literal));
                    literal.clear();
                }
                let rendered = self.js_expr(&sub, false, false)?;
                segments.push(rendered);
                i = j + 1;
            } else {
                literal.push(chars[i]);
                i += 1;
            }
        }
        if !literal.is_empty() {
            segments.push(quote(&literal));
        }
        Ok(format!("(__str {})", segments.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn transpile(src: &str, wrap: bool, raw: bool) -> String {
        let funcs: HashSet<String> = crate::ops::builtins().keys().cloned().collect();
        let mut t = ExprTranspiler::new(&funcs, false);
        t.js_expr(src, wrap, raw).expect("transpile")
    }

    #[test]
    fn identifiers_get_variable_prefix() {
        assert_eq!(transpile("product", false, false), "$product");
        assert_eq!(
            transpile("product", true, false),
            "{{$product | __pug__html}}"
        );
    }

    #[test]
    fn registered_functions_stay_bare() {
        assert_eq!(
            transpile("parseInt(x, 10)", false, false),
            "(parseInt $x 10)"
        );
    }

    #[test]
    fn range_identifier_is_rewritten() {
        assert_eq!(transpile("range(5)", false, false), "(__Range 5)");
    }

    #[test]
    fn binary_chain() {
        assert_eq!(
            transpile("a + b * 2", false, false),
            "(__op__add $a (__op__mul $b 2))"
        );
    }

    #[test]
    fn member_and_index() {
        assert_eq!(transpile("product.name", false, false), "$product.name");
        assert_eq!(
            transpile("items[2]", false, false),
            "(__pug__index $items 2)"
        );
    }

    #[test]
    fn conditional_lowering() {
        assert_eq!(
            transpile("ok ? 'y' : 'n'", false, false),
            "(__if ($ok) (\"y\") (\"n\") )"
        );
    }

    #[test]
    fn object_and_array_literals() {
        assert_eq!(
            transpile("{a: 1, b: x}", false, false),
            "(__op__map \"a\" 1 \"b\" $x)"
        );
        assert_eq!(
            transpile("[1, 'two']", false, false),
            "(__op__array 1 \"two\")"
        );
    }

    #[test]
    fn interpolated_string() {
        assert_eq!(
            transpile("'hello ${name}!'", false, false),
            "(__str \"hello \" $name \"!\")"
        );
    }

    #[test]
    fn plain_string_wrap_is_escaped_literal() {
        assert_eq!(transpile("'<b>'", true, false), "&lt;b&gt;");
        assert_eq!(transpile("'<b>'", false, false), "\"<b>\"");
    }

    #[test]
    fn assignment_forms() {
        assert_eq!(
            transpile("x = 1", true, true),
            "{{ $x := 1 -}}"
        );
        assert_eq!(
            transpile("x += 1", true, true),
            "{{ $x := (__op__add $x 1) -}}"
        );
        assert_eq!(
            transpile("m['k'] = v", false, true),
            "($m.__assign \"k\" $v)"
        );
        assert_eq!(
            transpile("obj.key = 1", false, true),
            "($obj.__assign \"key\" 1)"
        );
    }

    #[test]
    fn var_statement() {
        assert_eq!(transpile("var x = 1", true, true), "{{ $x := 1 -}}");
        assert_eq!(transpile("var x", true, true), "{{ $x := null -}}");
    }

    #[test]
    fn if_statement() {
        assert_eq!(
            transpile("if (a) { b } else { c }", false, true),
            "{{if $a}}{{$b | __pug__html}}{{else}}{{$c | __pug__html}}{{end}}"
        );
    }

    #[test]
    fn for_in_statement() {
        assert_eq!(
            transpile("for (var k in obj) { k }", false, true),
            "{{ range $k := (__range_helper_keys__ $obj) }}{{$k | __pug__html}}{{ end }}"
        );
    }

    #[test]
    fn try_catch_statement() {
        assert_eq!(
            transpile("try { a } catch (e) { e }", false, true),
            "{{ try }}$a{{ catch e }}$e{{ end }}"
        );
    }

    #[test]
    fn increment_statement() {
        assert_eq!(transpile("i++", true, true), "{{ $i := __op__inc $i -}}");
    }

    #[test]
    fn logical_and_not() {
        assert_eq!(
            transpile("!a && b", false, false),
            "(__op__and (__op__not $a) $b)"
        );
    }

    #[test]
    fn unsupported_construct_is_an_error() {
        let funcs = HashSet::new();
        let mut t = ExprTranspiler::new(&funcs, false);
        assert!(t.js_expr("for (a of b) {}", false, true).is_err());
        assert!(t.js_expr("1 +", false, false).is_err());
    }
}
