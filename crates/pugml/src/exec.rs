//! Executes a parsed [`ProgramSet`] against render data.
//!
//! Scoping is deliberately JavaScript-like: variables declared inside
//! a branch stay visible after it, an existing name is overwritten
//! instead of shadowed, and undefined variables read as `Nil`. Every
//! root data field is pre-bound twice, under its exact name and its
//! lower-first spelling, plus an empty `$global` map.
//!
//! `range` over a boolean re-evaluates its pipeline as a while loop;
//! both it and the template call depth are capped so runaway templates
//! fail instead of hanging a worker.

use std::collections::HashMap;
use std::time::Instant;

use crate::error::EvalError;
use crate::itl::{Arg, Cmd, Node, Pipe, ProgramSet, TemplateRef};
use crate::value::{lower_first, Value};

pub const MAX_TEMPLATE_DEPTH: usize = 100_000;
pub const MAX_WHILE_ITERATIONS: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    /// Template-level failure; `try` blocks catch these.
    Eval(EvalError),
    /// Deadline exceeded; never caught, always aborts the render.
    Cancelled(String),
}

impl From<EvalError> for ExecError {
    fn from(e: EvalError) -> Self {
        ExecError::Eval(e)
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Eval(e) => e.fmt(f),
            ExecError::Cancelled(m) => write!(f, "cancelled: {m}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    pub max_depth: usize,
    pub max_while: usize,
}

impl Default for ExecLimits {
    fn default() -> Self {
        ExecLimits {
            max_depth: MAX_TEMPLATE_DEPTH,
            max_while: MAX_WHILE_ITERATIONS,
        }
    }
}

pub fn execute(
    program: &ProgramSet,
    data: &Value,
    funcs: &HashMap<String, Value>,
    deadline: Option<Instant>,
) -> Result<String, ExecError> {
    execute_with_limits(program, data, funcs, deadline, ExecLimits::default())
}

pub fn execute_with_limits(
    program: &ProgramSet,
    data: &Value,
    funcs: &HashMap<String, Value>,
    deadline: Option<Instant>,
    limits: ExecLimits,
) -> Result<String, ExecError> {
    let globals = build_globals(data);
    let mut exec = Exec {
        program,
        funcs,
        globals: globals.clone(),
        bound: Vec::new(),
        deadline,
        limits,
        out: String::new(),
    };
    let mut vars = globals;
    exec.walk(&program.root, &mut vars, data, 0)?;
    Ok(exec.out)
}

type Vars = Vec<(String, Value)>;

fn build_globals(data: &Value) -> Vars {
    let mut globals: Vars = Vec::new();
    if let Value::Map(m) = data {
        let keys = m.borrow_mut().keys();
        for k in keys {
            let v = m.borrow_mut().get(&k).unwrap_or(Value::Nil);
            globals.push((k.clone(), v.clone()));
            let lower = lower_first(&k);
            if lower != k {
                globals.push((lower, v));
            }
        }
    }
    globals.push(("global".to_string(), Value::empty_map()));
    globals
}

fn set_var(vars: &mut Vars, name: &str, value: Value) {
    for (n, v) in vars.iter_mut().rev() {
        if n == name {
            *v = value;
            return;
        }
    }
    vars.push((name.to_string(), value));
}

/// Member chains call through intermediate functions, so thunk
/// members like `length` read naturally.
fn resolve_fields(mut value: Value, fields: &[String]) -> Result<Value, ExecError> {
    for field in fields {
        if let Value::Func(_) = &value {
            value = value.call(&[])?;
        }
        value = value.member(field)?;
    }
    Ok(value)
}

fn lookup(vars: &Vars, name: &str) -> Value {
    vars.iter()
        .rev()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
        .unwrap_or(Value::Nil)
}

struct BoundBlock {
    name: String,
    vars: Vars,
}

struct Exec<'a> {
    program: &'a ProgramSet,
    funcs: &'a HashMap<String, Value>,
    globals: Vars,
    /// Frozen caller scopes for mixin blocks, consumed from the end.
    bound: Vec<BoundBlock>,
    deadline: Option<Instant>,
    limits: ExecLimits,
    out: String,
}

impl<'a> Exec<'a> {
    fn check_deadline(&self) -> Result<(), ExecError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(ExecError::Cancelled(
                    "render deadline exceeded".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn walk(
        &mut self,
        nodes: &[Node],
        vars: &mut Vars,
        dot: &Value,
        depth: usize,
    ) -> Result<(), ExecError> {
        for node in nodes {
            self.check_deadline()?;
            match node {
                Node::Text(t) => self.out.push_str(t),
                Node::Action(pipe) => {
                    let value = self.eval_pipe(pipe, vars, dot)?;
                    if pipe.decls.is_empty() {
                        self.out.push_str(&value.display_string());
                    }
                }
                Node::If { pipe, then, els } => {
                    let value = self.eval_pipe(pipe, vars, dot)?;
                    if value.is_truthy() {
                        self.walk(then, vars, dot, depth)?;
                    } else {
                        self.walk(els, vars, dot, depth)?;
                    }
                }
                Node::With { pipe, body, els } => {
                    let value = self.eval_pipe(pipe, vars, dot)?;
                    if value.is_truthy() {
                        self.walk(body, vars, &value, depth)?;
                    } else {
                        self.walk(els, vars, dot, depth)?;
                    }
                }
                Node::Range { pipe, body, els } => {
                    self.walk_range(pipe, body, els, vars, dot, depth)?;
                }
                Node::Template { name, pipe } => {
                    self.walk_template(name, pipe.as_ref(), vars, dot, depth)?;
                }
                Node::Try { body, param, catch } => {
                    // body output is buffered so a caught error leaves
                    // no partial text behind
                    let saved = std::mem::take(&mut self.out);
                    match self.walk(body, vars, dot, depth) {
                        Ok(()) => {
                            let body_out = std::mem::replace(&mut self.out, saved);
                            self.out.push_str(&body_out);
                        }
                        Err(ExecError::Eval(e)) => {
                            self.out = saved;
                            if !param.is_empty() {
                                set_var(vars, param, Value::str(e.message.clone()));
                            }
                            self.walk(catch, vars, dot, depth)?;
                        }
                        Err(fatal) => {
                            self.out = saved;
                            return Err(fatal);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn walk_range(
        &mut self,
        pipe: &Pipe,
        body: &[Node],
        els: &[Node],
        vars: &mut Vars,
        dot: &Value,
        depth: usize,
    ) -> Result<(), ExecError> {
        let value = self.eval_pipe(pipe, vars, dot)?;
        let assign = |vars: &mut Vars, decls: &[String], key: Value, elem: Value| {
            match decls {
                [] => {}
                [v] => set_var(vars, v, elem),
                [k, v, ..] => {
                    set_var(vars, k, key);
                    set_var(vars, v, elem);
                }
            }
        };
        match &value {
            Value::Array(items) => {
                let snapshot: Vec<Value> = items.borrow().iter().cloned().collect();
                if snapshot.is_empty() {
                    return self.walk(els, vars, dot, depth);
                }
                for (i, item) in snapshot.into_iter().enumerate() {
                    assign(vars, &pipe.decls, Value::Number(i as f64), item);
                    self.walk(body, vars, dot, depth)?;
                }
                Ok(())
            }
            Value::Map(m) => {
                let keys = m.borrow_mut().keys();
                if keys.is_empty() {
                    return self.walk(els, vars, dot, depth);
                }
                for k in keys {
                    let elem = m.borrow_mut().get(&k).unwrap_or(Value::Nil);
                    assign(vars, &pipe.decls, Value::str(k), elem);
                    self.walk(body, vars, dot, depth)?;
                }
                Ok(())
            }
            Value::Bool(_) => {
                // pseudo while loop, test re-evaluated each round
                let mut iterations = 0;
                let mut current = value;
                while current.is_truthy() {
                    iterations += 1;
                    if iterations > self.limits.max_while {
                        return Err(ExecError::Eval(EvalError::new(format!(
                            "max iteration of {} in while loop",
                            self.limits.max_while
                        ))));
                    }
                    self.walk(body, vars, dot, depth)?;
                    current = self.eval_pipe(pipe, vars, dot)?;
                }
                Ok(())
            }
            Value::Nil => self.walk(els, vars, dot, depth),
            other => Err(ExecError::Eval(EvalError::new(format!(
                "range can't iterate over {}",
                other.type_name()
            )))),
        }
    }

    fn walk_template(
        &mut self,
        name: &TemplateRef,
        pipe: Option<&Pipe>,
        vars: &mut Vars,
        dot: &Value,
        depth: usize,
    ) -> Result<(), ExecError> {
        let name = match name {
            TemplateRef::Literal(s) => s.clone(),
            TemplateRef::Var(v) => lookup(vars, v).display_string(),
        };
        // a missing or empty name renders nothing; blockless mixin
        // calls rely on this
        let Some(body) = self.program.templates.get(&name) else {
            return Ok(());
        };
        if depth + 1 > self.limits.max_depth {
            return Err(ExecError::Eval(EvalError::new(format!(
                "exceeded maximum template depth ({})",
                self.limits.max_depth
            ))));
        }
        let data = match pipe {
            Some(pipe) => self.eval_pipe(pipe, vars, dot)?,
            None => Value::Nil,
        };
        let mut new_vars = match self.bound.iter().rposition(|b| b.name == name) {
            Some(i) => self.bound.remove(i).vars,
            None => self.globals.clone(),
        };
        self.walk(body, &mut new_vars, &data, depth + 1)
    }

    fn eval_pipe(
        &mut self,
        pipe: &Pipe,
        vars: &mut Vars,
        dot: &Value,
    ) -> Result<Value, ExecError> {
        let mut value = Value::Nil;
        for (i, cmd) in pipe.cmds.iter().enumerate() {
            let prev = if i == 0 { None } else { Some(value.clone()) };
            value = self.eval_cmd(cmd, vars, dot, prev)?;
        }
        for decl in &pipe.decls {
            set_var(vars, decl, value.clone());
        }
        Ok(value)
    }

    fn eval_cmd(
        &mut self,
        cmd: &Cmd,
        vars: &mut Vars,
        dot: &Value,
        prev: Option<Value>,
    ) -> Result<Value, ExecError> {
        let (head, rest) = cmd
            .args
            .split_first()
            .ok_or_else(|| EvalError::new("empty command"))?;

        if let Arg::Ident(name) = head {
            return self.call_function(name, rest, vars, dot, prev);
        }

        let mut argv = Vec::with_capacity(rest.len() + 1);
        for a in rest {
            argv.push(self.eval_arg(a, vars, dot)?);
        }
        if let Some(prev) = prev {
            argv.push(prev);
        }

        let (base, had_fields) = match head {
            Arg::Var { name, fields } => {
                (resolve_fields(lookup(vars, name), fields)?, !fields.is_empty())
            }
            Arg::Field(fields) => (resolve_fields(dot.clone(), fields)?, true),
            Arg::Dot => (dot.clone(), false),
            Arg::Pipe { pipe, fields } => {
                let v = self.eval_pipe(pipe, vars, dot)?;
                (resolve_fields(v, fields)?, !fields.is_empty())
            }
            Arg::Num(n) => (Value::Number(*n), false),
            Arg::Str(s) => (Value::str(s.clone()), false),
            Arg::Bool(b) => (Value::Bool(*b), false),
            Arg::Ident(_) => unreachable!(),
        };

        if let Value::Func(_) = &base {
            if !argv.is_empty() || had_fields {
                return Ok(base.call(&argv)?);
            }
            return Ok(base);
        }
        if !argv.is_empty() {
            return Err(ExecError::Eval(EvalError::new(format!(
                "can't give argument to non-function {}",
                base.type_name()
            ))));
        }
        Ok(base)
    }

    fn call_function(
        &mut self,
        name: &str,
        rest: &[Arg],
        vars: &mut Vars,
        dot: &Value,
        prev: Option<Value>,
    ) -> Result<Value, ExecError> {
        if name == "null" {
            return Ok(Value::Nil);
        }
        if name == "__freeze" {
            let block = match rest.first() {
                Some(a) => self.eval_arg(a, vars, dot)?.display_string(),
                None => String::new(),
            };
            self.bound.push(BoundBlock {
                name: block,
                vars: vars.clone(),
            });
            return Ok(Value::str(""));
        }
        let f = self
            .funcs
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::new(format!("function {name:?} not defined")))?;
        let mut argv = Vec::with_capacity(rest.len() + 1);
        for a in rest {
            argv.push(self.eval_arg(a, vars, dot)?);
        }
        if let Some(prev) = prev {
            argv.push(prev);
        }
        Ok(f.call(&argv)?)
    }

    fn eval_arg(
        &mut self,
        arg: &Arg,
        vars: &mut Vars,
        dot: &Value,
    ) -> Result<Value, ExecError> {
        Ok(match arg {
            Arg::Num(n) => Value::Number(*n),
            Arg::Str(s) => Value::str(s.clone()),
            Arg::Bool(b) => Value::Bool(*b),
            Arg::Dot => dot.clone(),
            Arg::Ident(name) => match name.as_str() {
                "null" => Value::Nil,
                _ => self.funcs.get(name).cloned().unwrap_or(Value::Nil),
            },
            Arg::Var { name, fields } => {
                let v = resolve_fields(lookup(vars, name), fields)?;
                self.auto_call(v)?
            }
            Arg::Field(fields) => {
                let v = resolve_fields(dot.clone(), fields)?;
                self.auto_call(v)?
            }
            Arg::Pipe { pipe, fields } => {
                let v = self.eval_pipe(pipe, vars, dot)?;
                let v = resolve_fields(v, fields)?;
                if fields.is_empty() {
                    v
                } else {
                    self.auto_call(v)?
                }
            }
        })
    }

    fn auto_call(&self, value: Value) -> Result<Value, ExecError> {
        if let Value::Func(f) = &value {
            if f.thunk {
                return Ok(value.call(&[])?);
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itl;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn render(src: &str, data: serde_json::Value) -> Result<String, ExecError> {
        let program = itl::parse(src).expect("parse");
        let funcs = crate::ops::builtins();
        execute(&program, &Value::from(data), &funcs, None)
    }

    fn render_ok(src: &str, data: serde_json::Value) -> String {
        render(src, data).expect("execute")
    }

    #[test]
    fn prints_escaped_value() {
        let out = render_ok("{{$title | __pug__html}}", json!({"title": "<b>"}));
        assert_eq!(out, "&lt;b&gt;");
    }

    #[test]
    fn globals_bound_under_both_spellings() {
        let out = render_ok("{{$Product}}/{{$product}}", json!({"Product": "x"}));
        assert_eq!(out, "x/x");
    }

    #[test]
    fn undefined_variable_reads_nil() {
        let out = render_ok("[{{$missing}}]", json!({}));
        assert_eq!(out, "[]");
    }

    #[test]
    fn declared_variable_survives_branch() {
        let out = render_ok(
            "{{if true}}{{ $x := 1 -}}{{end}}{{$x}}",
            json!({}),
        );
        assert_eq!(out, "1");
    }

    #[test]
    fn range_over_array_multiplies() {
        let out = render_ok(
            "{{ range $v := $items -}}{{(__op__mul $v 2)}} {{ end -}}",
            json!({"items": [1, 2, 3]}),
        );
        assert_eq!(out.trim_end(), "2 4 6");
    }

    #[test]
    fn range_over_map_in_declared_order() {
        let src = "{{ $m := (__op__map \"b\" 1 \"a\" 2) -}}\
                   {{ range $k, $v := $m -}}{{$k}}={{$v}};{{ end -}}";
        let out = render_ok(src, json!({}));
        assert_eq!(out, "b=1;a=2;");
    }

    #[test]
    fn range_else_on_empty() {
        let out = render_ok(
            "{{ range $v := $items -}}x{{else}}empty{{ end -}}",
            json!({"items": []}),
        );
        assert_eq!(out, "empty");
    }

    #[test]
    fn while_loop_counts() {
        let src = "{{ $i := 0 -}}{{ range (__op__lt $i 3) -}}\
                   {{$i}}{{ $i := __op__inc $i -}}{{ end -}}";
        assert_eq!(render_ok(src, json!({})), "012");
    }

    #[test]
    fn while_loop_iteration_cap() {
        let program = itl::parse("{{ range true -}}x{{ end -}}").expect("parse");
        let funcs = crate::ops::builtins();
        let err = execute_with_limits(
            &program,
            &Value::empty_map(),
            &funcs,
            None,
            ExecLimits {
                max_depth: 100,
                max_while: 5,
            },
        )
        .expect_err("must hit the cap");
        assert_eq!(
            err,
            ExecError::Eval(EvalError::new("max iteration of 5 in while loop"))
        );
    }

    #[test]
    fn template_call_and_silent_missing() {
        let src = "{{define \"t\"}}[{{.}}]{{end}}{{ template \"t\" 7 }}{{ template \"ghost\" }}";
        assert_eq!(render_ok(src, json!({})), "[7]");
    }

    #[test]
    fn template_depth_cap() {
        let program =
            itl::parse("{{define \"t\"}}{{ template \"t\" }}{{end}}{{ template \"t\" }}")
                .expect("parse");
        let funcs = crate::ops::builtins();
        let err = execute_with_limits(
            &program,
            &Value::empty_map(),
            &funcs,
            None,
            ExecLimits {
                max_depth: 20,
                max_while: 100,
            },
        )
        .expect_err("must hit the cap");
        assert_eq!(
            err,
            ExecError::Eval(EvalError::new("exceeded maximum template depth (20)"))
        );
    }

    #[test]
    fn frozen_block_sees_caller_scope() {
        let src = "{{define \"mixin_w\"}}{{- $__block__ := (__pug__index . 0) -}}\
                   ({{ template $__block__ }}){{end}}\
                   {{define \"__block_1\"}}{{$x}}{{end}}\
                   {{ $x := \"inner\" -}}\
                   {{- __freeze \"__block_1\" -}}\
                   {{ template \"mixin_w\" (__op__array \"__block_1\") }}";
        assert_eq!(render_ok(src, json!({})), "(inner)");
    }

    #[test]
    fn try_catch_binds_message_and_drops_partial_output() {
        let src = "{{ try }}partial{{(__op__mod 1 0)}}{{ catch e }}err={{$e}}{{ end }}";
        assert_eq!(render_ok(src, json!({})), "err=integer divide by zero");
    }

    #[test]
    fn thunk_members_read_as_values() {
        let out = render_ok(
            "{{$items.length}}",
            json!({"items": ["a", "b"]}),
        );
        assert_eq!(out, "2");
    }

    #[test]
    fn method_call_on_member() {
        let out = render_ok(
            "{{($name.toUpperCase) | __pug__html}}",
            json!({"name": "abc"}),
        );
        assert_eq!(out, "ABC");
    }

    #[test]
    fn pipeline_threads_final_argument() {
        let out = render_ok("{{\"<\" | __pug__html}}", json!({}));
        assert_eq!(out, "&lt;");
    }
}
