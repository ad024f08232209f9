//! Compiles the pug AST into intermediate template language text.
//!
//! Each node kind has one emission rule. Mixin definitions are
//! buffered and appended after the main body as named sub-templates,
//! so a mixin may be called before the line that defines it; call-site
//! blocks become frozen-scope sub-templates of their own.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::ast::{Attr, AttrVal, Token};
use crate::jsparse;
use crate::transpile::ExprTranspiler;
use crate::value::format_f64;

#[derive(Debug, Clone, Error)]
#[error("line {line}: {message}")]
pub struct LowerError {
    pub line: u64,
    pub message: String,
}

pub struct LowerOutput {
    pub itl: String,
    /// Mixin names called but never defined in this template.
    pub unresolved_mixins: Vec<String>,
}

/// Elements rendered self-closing regardless of what the AST claims.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "command", "embed", "hr", "img", "input",
    "keygen", "link", "meta", "param", "source", "track", "wbr",
];

fn doctype(val: &str) -> String {
    match val {
        "html" => "<!DOCTYPE html>".to_string(),
        "xml" => "<?xml version=\"1.0\" encoding=\"utf-8\" ?>".to_string(),
        "transitional" => "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.0 Transitional//EN\" \"http://www.w3.org/TR/xhtml1/DTD/xhtml1-transitional.dtd\">".to_string(),
        "strict" => "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.0 Strict//EN\" \"http://www.w3.org/TR/xhtml1/DTD/xhtml1-strict.dtd\">".to_string(),
        "frameset" => "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.0 Frameset//EN\" \"http://www.w3.org/TR/xhtml1/DTD/xhtml1-frameset.dtd\">".to_string(),
        "1.1" => "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.1//EN\" \"http://www.w3.org/TR/xhtml11/DTD/xhtml11.dtd\">".to_string(),
        "basic" => "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML Basic 1.1//EN\" \"http://www.w3.org/TR/xhtml-basic/xhtml-basic11.dtd\">".to_string(),
        "mobile" => "<!DOCTYPE html PUBLIC \"-//WAPFORUM//DTD XHTML Mobile 1.2//EN\" \"http://www.openmobilealliance.org/tech/DTD/xhtml-mobile12.dtd\">".to_string(),
        "plist" => "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">".to_string(),
        other => format!("<!DOCTYPE {other}>"),
    }
}

/// Lower a parsed AST into ITL text. `funcs` holds the names of
/// registered runtime functions, which keeps identifiers referencing
/// them from being rewritten into `$`-variables.
pub fn lower(
    root: &Token,
    funcs: &HashSet<String>,
    debug: bool,
) -> Result<LowerOutput, LowerError> {
    let mut c = Compiler {
        funcs,
        debug,
        rawmode: false,
        mixins: HashMap::new(),
        mixin_order: Vec::new(),
        mixin_blocks: Vec::new(),
        mixin_calls: Vec::new(),
        block_counter: 0,
        case_counter: 0,
    };
    let body = c.render(root)?;

    let mut itl = body;
    for block in &c.mixin_blocks {
        itl.push('\n');
        itl.push_str(block);
    }
    for name in &c.mixin_order {
        itl.push('\n');
        itl.push_str(&c.mixins[name]);
    }

    let unresolved = c
        .mixin_calls
        .iter()
        .filter(|name| !c.mixins.contains_key(name.as_str()))
        .cloned()
        .collect();
    Ok(LowerOutput {
        itl,
        unresolved_mixins: unresolved,
    })
}

/// Prefix every line with its number, the way compile errors report
/// template source. The debug-mode statement separators are stripped.
pub fn numbered_source(itl: &str) -> String {
    let mut out = String::new();
    for (i, line) in itl.lines().enumerate() {
        let line = line.trim_end_matches("     {{- \"\" -}}");
        out.push_str(&format!("{:03}: {}\n", i + 1, line.trim_end()));
    }
    out
}

struct Compiler<'a> {
    funcs: &'a HashSet<String>,
    debug: bool,
    rawmode: bool,
    mixins: HashMap<String, String>,
    mixin_order: Vec<String>,
    mixin_blocks: Vec<String>,
    mixin_calls: Vec<String>,
    block_counter: usize,
    case_counter: usize,
}

impl<'a> Compiler<'a> {
    fn js_expr(
        &self,
        src: &str,
        wrap: bool,
        rawcode: bool,
        line: u64,
    ) -> Result<String, LowerError> {
        let mut t = ExprTranspiler::new(self.funcs, self.debug);
        t.rawmode = self.rawmode;
        t.js_expr(src, wrap, rawcode).map_err(|e| LowerError {
            line,
            message: e.to_string(),
        })
    }

    fn render(&mut self, node: &Token) -> Result<String, LowerError> {
        match node.kind.as_str() {
            "Block" | "NamedBlock" => self.render_children(&node.nodes),
            "Text" => Ok(escape_braces(&node.val)),
            "Comment" | "BlockComment" => Ok(String::new()),
            "Doctype" => Ok(doctype(&node.val)),
            "Code" => self.render_code(node),
            "Conditional" => self.render_conditional(node),
            "Each" => self.render_each(node),
            "While" => self.render_while(node),
            "Case" => self.render_case(node),
            "Tag" => self.render_tag(node),
            "InterpolatedTag" => self.render_tag(node),
            "Mixin" => self.render_mixin(node),
            "MixinBlock" => Ok("{{ template $__block__ }}".to_string()),
            other => Err(LowerError {
                line: node.line,
                message: format!("unhandled node kind {other:?}"),
            }),
        }
    }

    fn render_children(&mut self, nodes: &[Token]) -> Result<String, LowerError> {
        let mut out = String::new();
        for n in nodes {
            out.push_str(&self.render(n)?);
        }
        Ok(out)
    }

    fn render_block(&mut self, node: &Token) -> Result<String, LowerError> {
        match &node.block {
            Some(b) => self.render(b),
            None => Ok(String::new()),
        }
    }

    fn render_code(&mut self, node: &Token) -> Result<String, LowerError> {
        if node.buffer {
            let saved = self.rawmode;
            self.rawmode = !node.must_escape;
            let out = self.js_expr(&node.val, true, false, node.line);
            self.rawmode = saved;
            out
        } else {
            self.js_expr(&node.val, true, true, node.line)
        }
    }

    fn render_conditional(&mut self, node: &Token) -> Result<String, LowerError> {
        let test = self.js_expr(&node.test, false, false, node.line)?;
        let mut out = format!("{{{{if {test}}}}}");
        if let Some(cons) = &node.consequent {
            out.push_str(&self.render(cons)?);
        }
        if let Some(alt) = &node.alternate {
            let alt = self.render(alt)?;
            if !alt.is_empty() {
                out.push_str("{{else}}");
                out.push_str(&alt);
            }
        }
        out.push_str("{{end}}");
        Ok(out)
    }

    fn render_each(&mut self, node: &Token) -> Result<String, LowerError> {
        let source = self.js_expr(&node.obj, false, false, node.line)?;
        let decls = match &node.key {
            Some(key) if !key.is_empty() => format!("${key}, ${}", node.val),
            _ => format!("${}", node.val),
        };
        let mut out = format!("{{{{ range {decls} := {source} -}}}}");
        out.push_str(&self.render_block(node)?);
        out.push_str("{{ end -}}");
        Ok(out)
    }

    fn render_while(&mut self, node: &Token) -> Result<String, LowerError> {
        let test = self.js_expr(&node.test, false, false, node.line)?;
        let mut out = format!("{{{{ range {test} -}}}}");
        out.push_str(&self.render_block(node)?);
        out.push_str("{{ end -}}");
        Ok(out)
    }

    /// `case` lowers to a fresh variable plus a chain of equality
    /// checks; a `when "default"` arm becomes the final else branch.
    fn render_case(&mut self, node: &Token) -> Result<String, LowerError> {
        self.case_counter += 1;
        let var = format!("$__case_{}", self.case_counter);
        let expr = self.js_expr(&node.expr, false, false, node.line)?;
        let mut out = format!("{{{{ {var} := {expr} -}}}}");

        let mut arms: Vec<(String, String)> = Vec::new();
        let mut default = String::new();
        for when in node.block_nodes() {
            if when.kind != "When" {
                continue;
            }
            let body = self.render_block(when)?;
            if when.expr == "default" {
                default = body;
            } else {
                let test = self.js_expr(&when.expr, false, false, when.line)?;
                arms.push((test, body));
            }
        }

        for (test, body) in &arms {
            out.push_str(&format!("{{{{if (__op__eql {var} {test})}}}}{body}{{{{else}}}}"));
        }
        out.push_str(&default);
        for _ in &arms {
            out.push_str("{{end}}");
        }
        Ok(out)
    }

    fn render_attrs(
        &mut self,
        attrs: &[Attr],
        attribute_blocks: &[String],
        line: u64,
    ) -> Result<String, LowerError> {
        if attrs.is_empty() && attribute_blocks.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::new();
        for attr in attrs {
            let val = self.attr_val(&attr.val, line)?;
            let escape = if attr.must_escape { "true" } else { "false" };
            parts.push(format!("(__attr \"{}\" {val} {escape})", attr.name));
        }
        for block in attribute_blocks {
            let expr = self.js_expr(block, false, false, line)?;
            parts.push(format!("(__and_attrs {expr})"));
        }
        Ok(format!("{{{{__attrs {}}}}}", parts.join(" ")))
    }

    fn attr_val(&self, val: &AttrVal, line: u64) -> Result<String, LowerError> {
        Ok(match val {
            AttrVal::Bool(b) => b.to_string(),
            AttrVal::Num(n) => format_f64(*n),
            AttrVal::Str(s) => self.js_expr(s, false, false, line)?,
        })
    }

    fn render_tag(&mut self, node: &Token) -> Result<String, LowerError> {
        let name = if node.kind == "InterpolatedTag" {
            format!("{{{{{} | __pug__html}}}}", self.js_expr(&node.expr, false, false, node.line)?)
        } else {
            node.name.clone()
        };
        let attrs = self.render_attrs(&node.attrs, &node.attribute_blocks, node.line)?;

        let void = VOID_ELEMENTS.contains(&name.as_str());
        if void || node.self_closing {
            return Ok(format!("<{name}{attrs}/>"));
        }
        let mut out = format!("<{name}{attrs}>");
        out.push_str(&self.render_block(node)?);
        out.push_str(&format!("</{name}>"));
        Ok(out)
    }

    fn render_mixin(&mut self, node: &Token) -> Result<String, LowerError> {
        if node.call {
            self.render_mixin_call(node)
        } else {
            self.render_mixin_definition(node)?;
            Ok(String::new())
        }
    }

    /// A definition becomes `{{define "mixin_<name>"}}` taking one
    /// array argument: block template name, attributes map, then the
    /// positional parameters.
    fn render_mixin_definition(&mut self, node: &Token) -> Result<(), LowerError> {
        let name = format!("mixin_{}", node.name);
        // leading trim eats the separator text between appended defines
        let mut body = format!("{{{{- define \"{name}\"}}}}");
        body.push_str("{{- $__block__ := (__pug__index . 0) -}}");
        body.push_str("{{- $attributes := (__pug__index . 1) -}}");

        for (i, param) in split_params(&node.args).into_iter().enumerate() {
            let slot = format!("(__pug__index . {})", i + 2);
            match param.default {
                Some(default) => {
                    let fallback = self.js_expr(&default, false, false, node.line)?;
                    body.push_str(&format!(
                        "{{{{- ${} := (__op__or {slot} {fallback}) -}}}}",
                        param.name
                    ));
                }
                None => {
                    body.push_str(&format!("{{{{- ${} := {slot} -}}}}", param.name));
                }
            }
        }

        body.push_str(&self.render_block(node)?);
        body.push_str("{{end}}");

        if !self.mixins.contains_key(&name) {
            self.mixin_order.push(name.clone());
        }
        self.mixins.insert(name, body);
        Ok(())
    }

    fn render_mixin_call(&mut self, node: &Token) -> Result<String, LowerError> {
        let name = format!("mixin_{}", node.name);
        self.mixin_calls.push(name.clone());

        let has_block = !node.block_nodes().is_empty();
        let block_name = if has_block {
            self.block_counter += 1;
            let block_name = format!("__block_{}", self.block_counter);
            let body = self.render_block(node)?;
            self.mixin_blocks
                .push(format!("{{{{- define \"{block_name}\"}}}}{body}{{{{end}}}}"));
            block_name
        } else {
            String::new()
        };

        let mut attrs = Vec::new();
        for attr in &node.attrs {
            let val = self.attr_val(&attr.val, node.line)?;
            attrs.push(format!("\"{}\" {val}", attr.name));
        }
        let attrs = if attrs.is_empty() {
            "(__op__map_params)".to_string()
        } else {
            format!("(__op__map_params {})", attrs.join(" "))
        };

        let mut args = Vec::new();
        if !node.args.trim().is_empty() {
            let list = jsparse::parse_expression(&format!("[{}]", node.args))
                .map_err(|e| LowerError {
                    line: node.line,
                    message: e.to_string(),
                })?;
            if let jsparse::Expr::Array(items) = list {
                for item in &items {
                    let mut t = ExprTranspiler::new(self.funcs, self.debug);
                    args.push(t.js_expr_ast(item).map_err(|e| LowerError {
                        line: node.line,
                        message: e.to_string(),
                    })?);
                }
            }
        }

        let mut out = String::new();
        if has_block {
            out.push_str(&format!("{{{{- __freeze \"{block_name}\" -}}}}"));
        }
        out.push_str(&format!(
            "{{{{ template \"{name}\" (__op__array \"{block_name}\" {attrs}"
        ));
        for a in &args {
            out.push(' ');
            out.push_str(a);
        }
        out.push_str(") }}");
        Ok(out)
    }
}

struct Param {
    name: String,
    default: Option<String>,
}

fn split_params(args: &str) -> Vec<Param> {
    args.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((name, default)) => Param {
                name: name.trim().trim_start_matches("...").to_string(),
                default: Some(default.trim().to_string()),
            },
            None => Param {
                name: p.trim_start_matches("...").to_string(),
                default: None,
            },
        })
        .collect()
}

/// Literal text may not open or close an action, so braces are routed
/// through quoted self-prints.
fn escape_braces(text: &str) -> String {
    let escaped = text
        .replace("{{", "\u{0}L")
        .replace("}}", "\u{0}R")
        .replace("\u{0}L", "{{\"{{\"}}")
        .replace("\u{0}R", "{{\"}}\"}}");
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse_ast;
    use pretty_assertions::assert_eq;

    fn compile(json: &str) -> String {
        let ast = parse_ast(json).expect("ast");
        let funcs: std::collections::HashSet<String> =
            crate::ops::builtins().keys().cloned().collect();
        lower(&ast, &funcs, false).expect("lower").itl
    }

    #[test]
    fn text_escapes_action_braces() {
        assert_eq!(escape_braces("a {{ b }} c"), "a {{\"{{\"}} b {{\"}}\"}} c");
    }

    #[test]
    fn tag_with_attrs() {
        let itl = compile(
            r#"{"type": "Tag", "name": "a",
               "attrs": [{"name": "href", "val": "url", "mustEscape": true}],
               "block": {"type": "Block", "nodes": [{"type": "Text", "val": "x"}]}}"#,
        );
        assert_eq!(
            itl,
            "<a{{__attrs (__attr \"href\" $url true)}}>x</a>"
        );
    }

    #[test]
    fn void_element_ignores_missing_self_closing_flag() {
        let itl = compile(r#"{"type": "Tag", "name": "br"}"#);
        assert_eq!(itl, "<br/>");
    }

    #[test]
    fn buffered_code_escapes_by_default() {
        let itl = compile(
            r#"{"type": "Code", "val": "title", "buffer": true, "mustEscape": true}"#,
        );
        assert_eq!(itl, "{{$title | __pug__html}}");
        let raw = compile(
            r#"{"type": "Code", "val": "title", "buffer": true, "mustEscape": false}"#,
        );
        assert_eq!(raw, "{{$title}}");
    }

    #[test]
    fn conditional_with_else() {
        let itl = compile(
            r#"{"type": "Conditional", "test": "ok",
               "consequent": {"type": "Block", "nodes": [{"type": "Text", "val": "y"}]},
               "alternate": {"type": "Block", "nodes": [{"type": "Text", "val": "n"}]}}"#,
        );
        assert_eq!(itl, "{{if $ok}}y{{else}}n{{end}}");
    }

    #[test]
    fn each_with_and_without_key() {
        let itl = compile(
            r#"{"type": "Each", "obj": "items", "val": "item", "key": "i",
               "block": {"type": "Block", "nodes": [{"type": "Text", "val": "x"}]}}"#,
        );
        assert_eq!(itl, "{{ range $i, $item := $items -}}x{{ end -}}");
        let itl = compile(
            r#"{"type": "Each", "obj": "items", "val": "item", "key": null,
               "block": {"type": "Block", "nodes": [{"type": "Text", "val": "x"}]}}"#,
        );
        assert_eq!(itl, "{{ range $item := $items -}}x{{ end -}}");
    }

    #[test]
    fn case_lowers_to_equality_chain() {
        let itl = compile(
            r#"{"type": "Case", "expr": "x", "block": {"type": "Block", "nodes": [
                {"type": "When", "expr": "1",
                 "block": {"type": "Block", "nodes": [{"type": "Text", "val": "one"}]}},
                {"type": "When", "expr": "default",
                 "block": {"type": "Block", "nodes": [{"type": "Text", "val": "other"}]}}
            ]}}"#,
        );
        assert_eq!(
            itl,
            "{{ $__case_1 := $x -}}{{if (__op__eql $__case_1 1)}}one{{else}}other{{end}}"
        );
    }

    #[test]
    fn mixin_definition_and_call() {
        let itl = compile(
            r#"{"type": "Block", "nodes": [
                {"type": "Mixin", "name": "card", "call": false, "args": "title",
                 "block": {"type": "Block", "nodes": [{"type": "Code", "val": "title", "buffer": true, "mustEscape": true}]}},
                {"type": "Mixin", "name": "card", "call": true, "args": "'hello'"}
            ]}"#,
        );
        assert_eq!(
            itl,
            concat!(
                "{{ template \"mixin_card\" (__op__array \"\" (__op__map_params) \"hello\") }}",
                "\n",
                "{{- define \"mixin_card\"}}",
                "{{- $__block__ := (__pug__index . 0) -}}",
                "{{- $attributes := (__pug__index . 1) -}}",
                "{{- $title := (__pug__index . 2) -}}",
                "{{$title | __pug__html}}",
                "{{end}}",
            )
        );
    }

    #[test]
    fn mixin_call_with_block_freezes_scope() {
        let itl = compile(
            r#"{"type": "Mixin", "name": "wrap", "call": true, "args": "",
               "block": {"type": "Block", "nodes": [{"type": "Text", "val": "inner"}]}}"#,
        );
        assert_eq!(
            itl,
            concat!(
                "{{- __freeze \"__block_1\" -}}",
                "{{ template \"mixin_wrap\" (__op__array \"__block_1\" (__op__map_params)) }}",
                "\n",
                "{{- define \"__block_1\"}}inner{{end}}",
            )
        );
    }

    #[test]
    fn appended_defines_leave_no_root_text() {
        let itl = compile(
            r#"{"type": "Mixin", "name": "wrap", "call": true, "args": "",
               "block": {"type": "Block", "nodes": [{"type": "Text", "val": "inner"}]}}"#,
        );
        let program = crate::itl::parse(&itl).expect("parse");
        for node in &program.root {
            assert!(
                !matches!(node, crate::itl::Node::Text(_)),
                "define separator leaked into root of {itl:?}"
            );
        }
    }

    #[test]
    fn unresolved_mixin_reported() {
        let ast = parse_ast(
            r#"{"type": "Mixin", "name": "ghost", "call": true, "args": ""}"#,
        )
        .expect("ast");
        let funcs = std::collections::HashSet::new();
        let out = lower(&ast, &funcs, false).expect("lower");
        assert_eq!(out.unresolved_mixins, vec!["mixin_ghost"]);
    }

    #[test]
    fn numbered_source_strips_debug_separators() {
        let src = "<a>     {{- \"\" -}}\n<b>";
        assert_eq!(numbered_source(src), "001: <a>\n002: <b>\n");
    }
}
