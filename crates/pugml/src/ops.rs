//! Runtime function table: total operators and the builtin helpers
//! generated template code calls.
//!
//! Operators never fail on bad operand types. Undefined arithmetic
//! yields the `"<nil>"` sentinel string, equality falls back to
//! rendered-string comparison, and relational operators answer false
//! when no ordering applies.

use std::collections::HashMap;

use crate::error::{EvalError, EvalResult};
use crate::value::{MapData, Value};

/// Sentinel rendered for arithmetic with no defined result.
pub const NIL_SENTINEL: &str = "<nil>";

pub fn op_add(l: &Value, r: &Value) -> Value {
    match l {
        Value::Str(s) => Value::str(format!("{}{}", s, r.display_string())),
        Value::Number(x) => match r {
            Value::Number(y) => Value::Number(x + y),
            Value::Str(s) => {
                let y = s.trim().parse::<f64>().unwrap_or(0.0);
                Value::Number(x + y)
            }
            _ => Value::Nil,
        },
        Value::Func(_) => Value::Nil,
        other => Value::str(format!(
            "{}{}",
            other.display_string(),
            r.display_string()
        )),
    }
}

pub fn op_inc(v: &Value) -> Value {
    match v {
        Value::Number(n) => Value::Number((n + 1.0).trunc()),
        _ => Value::Number(0.0),
    }
}

pub fn op_dec(v: &Value) -> Value {
    match v {
        Value::Number(n) => Value::Number((n - 1.0).trunc()),
        _ => Value::Number(0.0),
    }
}

fn numeric_binop(l: &Value, r: &Value, f: impl Fn(f64, f64) -> Value) -> Value {
    match (l, r) {
        (Value::Number(x), Value::Number(y)) => f(*x, *y),
        _ => Value::str(NIL_SENTINEL),
    }
}

/// One operand negates, two subtract.
pub fn op_sub(args: &[Value]) -> Value {
    match args {
        [x] => numeric_binop(&Value::Number(0.0), x, |a, b| Value::Number(a - b)),
        [x, y] => numeric_binop(x, y, |a, b| Value::Number(a - b)),
        _ => Value::str(NIL_SENTINEL),
    }
}

pub fn op_mul(l: &Value, r: &Value) -> Value {
    numeric_binop(l, r, |a, b| Value::Number(a * b))
}

/// Division is always floating point; dividing by zero produces
/// IEEE infinities or NaN rather than an error.
pub fn op_quo(l: &Value, r: &Value) -> Value {
    numeric_binop(l, r, |a, b| Value::Number(a / b))
}

pub fn op_rem(l: &Value, r: &Value) -> EvalResult {
    match (l, r) {
        (Value::Number(x), Value::Number(y)) => {
            if *y as i64 == 0 {
                return Err(EvalError::new("integer divide by zero"));
            }
            Ok(Value::Number((*x as i64 % *y as i64) as f64))
        }
        _ => Ok(Value::str(NIL_SENTINEL)),
    }
}

// Cross-kind number/string equality goes through the fixed six-digit
// float rendering, so `1 == "1"` is false but `1 == "1.000000"` holds.
fn number_as_cmp_string(n: f64) -> String {
    format!("{:.6}", n)
}

pub fn op_eql(l: &Value, r: &Value) -> bool {
    let (l, r) = match (l, r) {
        (Value::Nil, Value::Nil) => return true,
        (Value::Nil, y) => (Value::Number(0.0), y.clone()),
        (x, Value::Nil) => (x.clone(), Value::Number(0.0)),
        (x, y) => (x.clone(), y.clone()),
    };
    match (&l, &r) {
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Number(x), Value::Str(s)) => number_as_cmp_string(*x) == s.as_ref(),
        (Value::Str(s), Value::Number(y)) => s.as_ref() == number_as_cmp_string(*y),
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => l.display_string() == r.display_string(),
    }
}

pub fn op_lss(l: &Value, r: &Value) -> bool {
    let (l, r) = match (l, r) {
        (Value::Nil, Value::Nil) => return false,
        (Value::Nil, y) => (Value::Number(0.0), y.clone()),
        (x, Value::Nil) => (x.clone(), Value::Number(0.0)),
        (x, y) => (x.clone(), y.clone()),
    };
    match (&l, &r) {
        (Value::Number(x), Value::Number(y)) => x < y,
        (Value::Number(x), Value::Str(s)) => {
            number_as_cmp_string(*x).as_str() < s.as_ref()
        }
        (Value::Str(s), Value::Number(y)) => {
            s.as_ref() < number_as_cmp_string(*y).as_str()
        }
        (Value::Str(x), Value::Str(y)) => x < y,
        _ => false,
    }
}

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Nil)
}

// Bitwise operators work on 32-bit integers as in JavaScript.
fn int_operand(v: &Value) -> i32 {
    v.as_number().unwrap_or(0.0) as i64 as i32
}

fn bit_op(args: &[Value], f: impl Fn(i32, i32) -> i32) -> Value {
    Value::Number(f(int_operand(&arg(args, 0)), int_operand(&arg(args, 1))) as f64)
}

/// Index into arrays by number, everything else by member name.
/// Out-of-range array indices are `Nil`, not errors.
fn try_index(obj: &Value, key: &Value) -> EvalResult {
    if let (Value::Array(items), Some(n)) = (obj, key.as_number()) {
        let items = items.borrow();
        let idx = n as i64;
        if idx < 0 || idx as usize >= items.len() {
            return Ok(Value::Nil);
        }
        return Ok(items[idx as usize].clone());
    }
    obj.member(&key.display_string())
}

fn attr_entry(name: &str, val: Value, must_escape: bool) -> Value {
    let mut m = MapData::new();
    m.insert_ordered("name", Value::str(name));
    m.insert_ordered("mustEscape", Value::Bool(must_escape));
    match val {
        Value::Bool(b) => m.insert_ordered("boolVal", Value::Bool(b)),
        Value::Nil => m.insert_ordered("boolVal", Value::Bool(false)),
        other => m.insert_ordered("val", Value::str(other.display_string())),
    }
    Value::map(m)
}

#[derive(PartialEq, Clone)]
struct TmpAttr {
    must_escape: bool,
    val: String,
    boolv: Option<bool>,
}

/// Merge attribute lists into the rendered ` name="value"` string.
/// Classes accumulate (with de-dup), later values replace earlier ones
/// for any other name, and a false boolean suppresses the whole
/// attribute. Order of first appearance wins.
fn merge_attrs(lists: &[Value]) -> EvalResult {
    let mut merged: HashMap<String, Vec<TmpAttr>> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for list in lists {
        let Value::Array(items) = list else { continue };
        for attr in items.borrow().iter() {
            if matches!(attr, Value::Nil) {
                continue;
            }
            let name = attr.member("name")?.display_string();
            let must_escape = attr.member("mustEscape")?.is_truthy();
            let bool_val = attr.member("boolVal")?;
            let att = if let Value::Bool(b) = bool_val {
                let val = if must_escape {
                    name.clone()
                } else {
                    format!("\"{name}\"")
                };
                TmpAttr {
                    must_escape,
                    val,
                    boolv: Some(b),
                }
            } else {
                TmpAttr {
                    must_escape,
                    val: attr.member("val")?.display_string(),
                    boolv: None,
                }
            };

            match merged.get_mut(&name) {
                Some(existing) => {
                    if name == "class" {
                        if !existing.contains(&att) {
                            existing.push(att);
                        }
                    } else {
                        *existing = vec![att];
                    }
                }
                None => {
                    merged.insert(name.clone(), vec![att]);
                    order.push(name);
                }
            }
        }
    }

    let mut res = String::new();
    'render: for name in &order {
        let mut tmp = String::new();
        for att in &merged[name] {
            if att.boolv == Some(false) {
                if name == "class" {
                    continue;
                }
                continue 'render;
            }
            if !tmp.is_empty() {
                tmp.push(' ');
            }
            if att.must_escape {
                tmp.push_str(&html_escape(&att.val));
            } else if att.val.starts_with('"') {
                tmp.push_str(&att.val[1..att.val.len() - 1]);
            }
        }
        let tmp = tmp.trim();
        if tmp.is_empty() && name == "class" {
            continue;
        }
        res.push_str(&format!(" {name}=\"{tmp}\""));
    }
    Ok(Value::str(res))
}

/// Spread a map into an attribute list, the `&attributes` form.
fn and_attrs(map: &Value) -> EvalResult {
    let mut out = Vec::new();
    if let Value::Map(m) = map {
        let keys = m.borrow_mut().keys();
        for k in keys {
            let v = map.member(&k)?;
            out.push(attr_entry(&k, v, true));
        }
    }
    Ok(Value::array(out))
}

fn range_values(args: &[Value]) -> Value {
    let (from, to) = match args {
        [m] => (0i64, m.as_number().unwrap_or(0.0) as i64),
        [o, m, ..] => (
            o.as_number().unwrap_or(0.0) as i64,
            m.as_number().unwrap_or(0.0) as i64,
        ),
        _ => (0, 0),
    };
    Value::array((from..to).map(|i| Value::Number(i as f64)).collect())
}

fn range_keys(v: &Value) -> Value {
    match v {
        Value::Map(m) => {
            let keys = m.borrow_mut().keys();
            Value::array(keys.into_iter().map(Value::str).collect())
        }
        Value::Array(items) => Value::array(
            (0..items.borrow().len())
                .map(|i| Value::Number(i as f64))
                .collect(),
        ),
        _ => Value::array(Vec::new()),
    }
}

fn parse_int(args: &[Value]) -> EvalResult {
    let f = arg(args, 0)
        .display_string()
        .trim()
        .parse::<f64>()
        .unwrap_or(0.0);
    let base = arg(args, 1).as_number().unwrap_or(10.0) as u32;
    if !(2..=36).contains(&base) {
        return Err(EvalError::new(format!("parseInt: invalid base {base}")));
    }
    let digits = (f.trunc() as i64).to_string();
    let n = i64::from_str_radix(&digits, base)
        .map_err(|e| EvalError::new(format!("parseInt: {e}")))?;
    Ok(Value::Number(n as f64))
}

fn regexp_value(args: &[Value]) -> EvalResult {
    let pattern = arg(args, 0).display_string();
    let flags = arg(args, 1).display_string();
    let (transformed, err) = crate::regexp::transform_regexp(&pattern);
    if let Some(err) = err {
        return Err(EvalError::new(err.to_string()));
    }
    let transformed = if flags.contains('i') {
        format!("(?i){transformed}")
    } else {
        transformed
    };
    let re = regex::Regex::new(&transformed)
        .map_err(|e| EvalError::new(format!("invalid regex: {e}")))?;
    let mut m = MapData::new();
    m.insert_ordered("source", Value::str(pattern));
    let test_re = re.clone();
    m.insert_ordered(
        "test",
        Value::func(move |args| {
            let s = args
                .first()
                .map(Value::display_string)
                .unwrap_or_default();
            Ok(Value::Bool(test_re.is_match(&s)))
        }),
    );
    m.insert_ordered(
        "exec",
        Value::func(move |args| {
            let s = args
                .first()
                .map(Value::display_string)
                .unwrap_or_default();
            match re.captures(&s) {
                Some(caps) => Ok(Value::array(
                    caps.iter()
                        .map(|c| match c {
                            Some(c) => Value::str(c.as_str()),
                            None => Value::Nil,
                        })
                        .collect(),
                )),
                None => Ok(Value::Nil),
            }
        }),
    );
    Ok(Value::map(m))
}

/// The builtin table every render starts from. Engine-registered host
/// functions are layered on top of these.
pub fn builtins() -> HashMap<String, Value> {
    let mut m: HashMap<String, Value> = HashMap::new();
    let mut reg = |name: &str, v: Value| {
        m.insert(name.to_string(), v);
    };

    reg("null", Value::func(|_| Ok(Value::Nil)));
    reg(
        "json",
        Value::func(|args| {
            let allow_deep = args.get(1).map(Value::is_truthy).unwrap_or(true);
            let v = arg(args, 0).to_json(allow_deep)?;
            serde_json::to_string(&v)
                .map(Value::str)
                .map_err(|e| EvalError::new(format!("json: {e}")))
        }),
    );
    reg("parseInt", Value::func(parse_int));

    reg(
        "__op__add",
        Value::func(|args| Ok(op_add(&arg(args, 0), &arg(args, 1)))),
    );
    reg("__op__inc", Value::func(|args| Ok(op_inc(&arg(args, 0)))));
    reg("__op__dec", Value::func(|args| Ok(op_dec(&arg(args, 0)))));
    reg("__op__sub", Value::func(|args| Ok(op_sub(args))));
    reg(
        "__op__mul",
        Value::func(|args| Ok(op_mul(&arg(args, 0), &arg(args, 1)))),
    );
    reg(
        "__op__quo",
        Value::func(|args| Ok(op_quo(&arg(args, 0), &arg(args, 1)))),
    );
    reg(
        "__op__slash",
        Value::func(|args| Ok(op_quo(&arg(args, 0), &arg(args, 1)))),
    );
    reg(
        "__op__mod",
        Value::func(|args| op_rem(&arg(args, 0), &arg(args, 1))),
    );
    reg(
        "__op__eql",
        Value::func(|args| Ok(Value::Bool(op_eql(&arg(args, 0), &arg(args, 1))))),
    );
    reg(
        "__op__neq",
        Value::func(|args| Ok(Value::Bool(!op_eql(&arg(args, 0), &arg(args, 1))))),
    );
    reg(
        "__op__lt",
        Value::func(|args| Ok(Value::Bool(op_lss(&arg(args, 0), &arg(args, 1))))),
    );
    reg(
        "__op__gt",
        Value::func(|args| {
            let (l, r) = (arg(args, 0), arg(args, 1));
            Ok(Value::Bool(!op_lss(&l, &r) && !op_eql(&l, &r)))
        }),
    );
    reg(
        "__op__gte",
        Value::func(|args| Ok(Value::Bool(!op_lss(&arg(args, 0), &arg(args, 1))))),
    );
    reg(
        "__op__lte",
        Value::func(|args| {
            let (l, r) = (arg(args, 0), arg(args, 1));
            Ok(Value::Bool(op_lss(&l, &r) || op_eql(&l, &r)))
        }),
    );

    // JavaScript short-circuit semantics: the selected operand passes
    // through unchanged rather than collapsing to a boolean.
    reg(
        "__op__and",
        Value::func(|args| {
            let l = arg(args, 0);
            Ok(if l.is_truthy() { arg(args, 1) } else { l })
        }),
    );
    reg(
        "__op__or",
        Value::func(|args| {
            let l = arg(args, 0);
            Ok(if l.is_truthy() { l } else { arg(args, 1) })
        }),
    );
    reg(
        "__op__not",
        Value::func(|args| Ok(Value::Bool(!arg(args, 0).is_truthy()))),
    );
    reg(
        "__op__bitnot",
        Value::func(|args| Ok(Value::Number(!(int_operand(&arg(args, 0)) as i32) as f64))),
    );
    reg("__op__b_and", Value::func(|args| Ok(bit_op(args, |a, b| a & b))));
    reg("__op__b_or", Value::func(|args| Ok(bit_op(args, |a, b| a | b))));
    reg("__op__b_xor", Value::func(|args| Ok(bit_op(args, |a, b| a ^ b))));
    reg(
        "__op__b_sleft",
        Value::func(|args| Ok(bit_op(args, |a, b| a.wrapping_shl(b as u32 & 31)))),
    );
    reg(
        "__op__b_sright",
        Value::func(|args| Ok(bit_op(args, |a, b| a.wrapping_shr(b as u32 & 31)))),
    );
    reg(
        "__op__b_usright",
        Value::func(|args| {
            Ok(bit_op(args, |a, b| {
                ((a as u32).wrapping_shr(b as u32 & 31)) as i32
            }))
        }),
    );
    reg("__op__delete", Value::func(|_| Ok(Value::Nil)));

    reg(
        "__throw",
        Value::func(|args| Err(EvalError::new(arg(args, 0).display_string()))),
    );

    let tryindex = Value::func(|args| try_index(&arg(args, 0), &arg(args, 1)));
    reg("__tryindex", tryindex.clone());
    reg("__pug__index", tryindex);

    reg("__Range", Value::func(|args| Ok(range_values(args))));
    reg(
        "__range_helper_keys__",
        Value::func(|args| Ok(range_keys(&arg(args, 0)))),
    );

    reg(
        "__str",
        Value::func(|args| {
            let mut res = String::new();
            for a in args {
                res.push_str(&a.display_string());
            }
            if res.len() > 1 {
                Ok(Value::str(format!(" {}", res.trim())))
            } else {
                Ok(Value::str(""))
            }
        }),
    );
    reg(
        "__op__array",
        Value::func(|args| Ok(Value::array(args.to_vec()))),
    );
    reg(
        "__op__map",
        Value::func(|args| {
            let mut m = MapData::new();
            for pair in args.chunks(2) {
                let key = pair[0].display_string();
                let val = pair.get(1).cloned().unwrap_or(Value::Nil);
                m.insert_ordered(key, val);
            }
            Ok(Value::map(m))
        }),
    );
    reg(
        "__op__map_params",
        Value::func(|args| {
            // duplicate keys accumulate into an array
            let m = Value::empty_map();
            for pair in args.chunks(2) {
                let key = pair[0].display_string();
                let val = pair.get(1).cloned().unwrap_or(Value::Nil);
                let existing = m.member(&key)?;
                let next = match existing {
                    Value::Nil => val,
                    Value::Array(items) => {
                        items.borrow_mut().push(val);
                        Value::Array(items)
                    }
                    single => Value::array(vec![single, val]),
                };
                if let Value::Map(data) = &m {
                    data.borrow_mut().assign(key, next);
                }
            }
            Ok(m)
        }),
    );

    reg(
        "__attr",
        Value::func(|args| {
            let name = arg(args, 0).display_string();
            let escape = arg(args, 2).is_truthy();
            Ok(Value::array(vec![attr_entry(&name, arg(args, 1), escape)]))
        }),
    );
    reg("__attrs", Value::func(|args| merge_attrs(args)));
    reg("__and_attrs", Value::func(|args| and_attrs(&arg(args, 0))));

    reg(
        "__if",
        Value::func(|args| {
            if arg(args, 0).is_truthy() {
                Ok(arg(args, 1))
            } else {
                Ok(arg(args, 2))
            }
        }),
    );

    reg(
        "__pug__html",
        Value::func(|args| Ok(Value::str(html_escape(&arg(args, 0).display_string())))),
    );

    reg("__regexp", Value::func(regexp_value));

    m
}
