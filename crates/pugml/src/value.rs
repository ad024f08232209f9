//! Runtime value model with JavaScript-flavoured coercions.
//!
//! Values are cheap to clone: strings, arrays, maps and functions are
//! reference counted, and arrays/maps share their interior mutably so
//! that `push`, `splice` and `__assign` are visible through every
//! handle, the way template code expects.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{EvalError, EvalResult};

/// Host-side record that materializes into a [`Value::Map`] on first
/// member access. Field names are exposed under their
/// lower-first-letter form, matching how host data is addressed from
/// templates.
pub trait HostRecord {
    fn field_names(&self) -> Vec<String>;
    fn field(&self, name: &str) -> serde_json::Value;
    /// Iteration order for `each`; empty means unspecified.
    fn order(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Native function callable from template code.
pub struct FuncDef {
    /// Zero-argument accessor that is safe to invoke during deep JSON
    /// serialization.
    pub thunk: bool,
    pub call: Box<dyn Fn(&[Value]) -> EvalResult>,
}

/// Ordered map payload. `order` tracks insertion/declaration order;
/// when it is empty, iteration falls back to sorted key order.
pub struct MapData {
    items: BTreeMap<String, Value>,
    order: Vec<String>,
    source: Option<Rc<dyn HostRecord>>,
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<MapData>>),
    Func(Rc<FuncDef>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Array(a) => write!(f, "Array({:?})", a.borrow()),
            Value::Map(m) => write!(f, "Map({:?})", m.borrow().items),
            Value::Func(_) => f.write_str("Func"),
        }
    }
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn map(data: MapData) -> Value {
        Value::Map(Rc::new(RefCell::new(data)))
    }

    pub fn empty_map() -> Value {
        Value::map(MapData::new())
    }

    pub fn func<F>(f: F) -> Value
    where
        F: Fn(&[Value]) -> EvalResult + 'static,
    {
        Value::Func(Rc::new(FuncDef {
            thunk: false,
            call: Box::new(f),
        }))
    }

    /// A zero-argument accessor; unlike [`Value::func`] it may be
    /// invoked by deep JSON serialization.
    pub fn thunk<F>(f: F) -> Value
    where
        F: Fn(&[Value]) -> EvalResult + 'static,
    {
        Value::Func(Rc::new(FuncDef {
            thunk: true,
            call: Box::new(f),
        }))
    }

    pub fn from_host(record: Rc<dyn HostRecord>) -> Value {
        Value::map(MapData {
            items: BTreeMap::new(),
            order: Vec::new(),
            source: Some(record),
        })
    }

    pub fn call(&self, args: &[Value]) -> EvalResult {
        match self {
            Value::Func(def) => (def.call)(args),
            other => Err(EvalError::new(format!(
                "cannot call non-function value {}",
                other.type_name()
            ))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Func(_) => "function",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => !a.borrow().is_empty(),
            Value::Map(m) => {
                let mut m = m.borrow_mut();
                m.materialize();
                !m.items.is_empty()
            }
            Value::Func(_) => true,
        }
    }

    /// Numeric view where one exists. `Nil` has no numeric view here;
    /// comparison operators coerce it to zero themselves.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// Rendered form: `Nil` is empty, numbers drop a trailing `.0`,
    /// arrays join their items with spaces, maps print as JSON.
    pub fn display_string(&self) -> String {
        match self {
            Value::Nil => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_f64(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(a) => {
                let items = a.borrow();
                items
                    .iter()
                    .map(Value::display_string)
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            Value::Map(_) => self
                .to_json(false)
                .map(|v| v.to_string())
                .unwrap_or_default(),
            Value::Func(_) => "function".to_string(),
        }
    }

    /// Structural equality; functions compare by identity.
    pub fn deep_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.deep_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                let mut a = a.borrow_mut();
                let mut b = b.borrow_mut();
                a.materialize();
                b.materialize();
                a.items.len() == b.items.len()
                    && a.items
                        .iter()
                        .all(|(k, v)| b.items.get(k).is_some_and(|w| v.deep_eq(w)))
            }
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Deep copy. Arrays and maps get fresh interiors so mutation no
    /// longer aliases; scalars and functions are shared.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Array(a) => {
                Value::array(a.borrow().iter().map(Value::deep_copy).collect())
            }
            Value::Map(m) => {
                let m = m.borrow();
                Value::map(MapData {
                    items: m
                        .items
                        .iter()
                        .map(|(k, v)| (k.clone(), v.deep_copy()))
                        .collect(),
                    order: m.order.clone(),
                    source: m.source.clone(),
                })
            }
            other => other.clone(),
        }
    }

    /// Member lookup. Arrays and strings expose their builtin methods,
    /// maps resolve the key through the case/synonym fallback chain,
    /// everything else yields `Nil`. Unknown array members are an
    /// error, matching the strictness templates rely on to catch
    /// typos against list values.
    pub fn member(&self, name: &str) -> EvalResult {
        match self {
            Value::Array(a) => array_member(a, name),
            Value::Str(s) => Ok(string_member(s, name)),
            Value::Map(m) => Ok(map_member(m, name)),
            _ => Ok(Value::Nil),
        }
    }

    pub fn to_json(&self, allow_deep: bool) -> Result<serde_json::Value, EvalError> {
        match self {
            Value::Nil => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Number(n) => Ok(serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)),
            Value::Str(s) => Ok(serde_json::Value::String(s.to_string())),
            Value::Array(a) => {
                let items = a.borrow();
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(item.to_json(allow_deep)?);
                }
                Ok(serde_json::Value::Array(out))
            }
            Value::Map(m) => {
                let mut m = m.borrow_mut();
                m.materialize();
                let mut out = serde_json::Map::with_capacity(m.items.len());
                for (k, v) in &m.items {
                    out.insert(lower_first(k), v.to_json(allow_deep)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            Value::Func(def) => {
                if allow_deep && def.thunk {
                    (def.call)(&[])?.to_json(allow_deep)
                } else {
                    Ok(serde_json::Value::String("function".to_string()))
                }
            }
        }
    }
}

impl MapData {
    pub fn new() -> Self {
        MapData {
            items: BTreeMap::new(),
            order: Vec::new(),
            source: None,
        }
    }

    /// Pull host-record fields into the item table. Idempotent;
    /// called lazily by every accessor that needs the items.
    pub fn materialize(&mut self) {
        let Some(source) = self.source.take() else {
            return;
        };
        for name in source.field_names() {
            let key = lower_first(&name);
            let value = Value::from(source.field(&name));
            self.items.insert(key, value);
        }
        if self.order.is_empty() {
            self.order = source.order();
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.materialize();
        self.items.get(key).cloned()
    }

    pub fn len(&mut self) -> usize {
        self.materialize();
        self.items.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Insert preserving declared order. A fresh key is appended to
    /// the order list only when one already exists; partial order on
    /// an unordered map would be misleading.
    pub fn assign(&mut self, key: impl Into<String>, value: Value) {
        self.materialize();
        let key = key.into();
        if !self.order.is_empty()
            && !self.items.contains_key(&key)
            && !self.order.iter().any(|k| k == &key)
        {
            self.order.push(key.clone());
        }
        self.items.insert(key, value);
    }

    /// Insert and always record order; used by map literals whose
    /// declaration order is authoritative.
    pub fn insert_ordered(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if !self.items.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.items.insert(key, value);
    }

    /// Iteration keys: declared order when present, sorted otherwise.
    pub fn keys(&mut self) -> Vec<String> {
        self.materialize();
        if !self.order.is_empty() {
            return self.order.clone();
        }
        self.items.keys().cloned().collect()
    }

    /// Key resolution chain: exact, upper-first, title-case, then the
    /// same three again after rewriting the id/url/api synonyms.
    pub fn resolve(&mut self, field: &str) -> Option<Value> {
        self.materialize();
        for key in [field.to_string(), upper_first(field), title_case(field)] {
            if let Some(v) = self.items.get(&key) {
                return Some(v.clone());
            }
        }
        let replaced = replace_synonyms(field);
        for key in [replaced.clone(), upper_first(&replaced), title_case(&replaced)] {
            if let Some(v) = self.items.get(&key) {
                return Some(v.clone());
            }
        }
        None
    }
}

impl Default for MapData {
    fn default() -> Self {
        MapData::new()
    }
}

fn array_member(arr: &Rc<RefCell<Vec<Value>>>, name: &str) -> EvalResult {
    let a = arr.clone();
    let method = match name {
        "length" => Value::thunk(move |_| Ok(Value::Number(a.borrow().len() as f64))),
        "indexOf" => Value::func(move |args| {
            let needle = args.first().cloned().unwrap_or(Value::Nil);
            let items = a.borrow();
            for (i, item) in items.iter().enumerate() {
                if item.deep_eq(&needle) {
                    return Ok(Value::Number(i as f64));
                }
            }
            Ok(Value::Number(-1.0))
        }),
        "join" => Value::func(move |args| {
            let sep = args
                .first()
                .map(Value::display_string)
                .unwrap_or_default();
            let joined = a
                .borrow()
                .iter()
                .map(Value::display_string)
                .collect::<Vec<_>>()
                .join(&sep);
            Ok(Value::str(joined))
        }),
        "push" => Value::func(move |args| {
            a.borrow_mut()
                .push(args.first().cloned().unwrap_or(Value::Nil));
            Ok(Value::Nil)
        }),
        "pop" => Value::func(move |_| Ok(a.borrow_mut().pop().unwrap_or(Value::Nil))),
        "splice" => Value::func(move |args| {
            let at = index_arg(args.first())?;
            let mut items = a.borrow_mut();
            let at = at.min(items.len());
            let right: Vec<Value> = items.split_off(at);
            Ok(Value::array(right))
        }),
        "slice" => Value::func(move |args| {
            let at = index_arg(args.first())?;
            let items = a.borrow();
            let at = at.min(items.len());
            Ok(Value::array(items[at..].to_vec()))
        }),
        "sort" => Value::func(move |_| {
            a.borrow_mut()
                .sort_by(|x, y| x.display_string().cmp(&y.display_string()));
            Ok(Value::Nil)
        }),
        _ => return Err(EvalError::new(format!("field {name} not found"))),
    };
    Ok(method)
}

fn index_arg(arg: Option<&Value>) -> Result<usize, EvalError> {
    let n = arg
        .and_then(Value::as_number)
        .ok_or_else(|| EvalError::new("index must be a number"))?;
    Ok(if n < 0.0 { 0 } else { n as usize })
}

fn string_member(s: &Rc<str>, name: &str) -> Value {
    let s = s.clone();
    match name {
        "length" => Value::thunk(move |_| Ok(Value::Number(s.chars().count() as f64))),
        "charAt" => Value::func(move |args| {
            let pos = args.first().and_then(Value::as_number).unwrap_or(-1.0);
            if pos < 0.0 {
                return Ok(Value::str(""));
            }
            Ok(Value::str(
                s.chars()
                    .nth(pos as usize)
                    .map(String::from)
                    .unwrap_or_default(),
            ))
        }),
        "indexOf" => Value::func(move |args| {
            let needle = args.first().map(Value::display_string).unwrap_or_default();
            let idx = match s.find(&needle) {
                Some(byte) => s[..byte].chars().count() as f64,
                None => -1.0,
            };
            Ok(Value::Number(idx))
        }),
        "toUpperCase" => Value::func(move |_| Ok(Value::str(s.to_uppercase()))),
        "toLowerCase" => Value::func(move |_| Ok(Value::str(s.to_lowercase()))),
        "split" => Value::func(move |args| {
            let sep = args.first().map(Value::display_string).unwrap_or_default();
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::str(c.to_string())).collect()
            } else {
                s.split(sep.as_str()).map(Value::str).collect()
            };
            Ok(Value::array(parts))
        }),
        "slice" => Value::func(move |args| {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let from = args.first().and_then(Value::as_number).unwrap_or(0.0) as i64;
            if from > len {
                return Ok(Value::str(""));
            }
            let from = if from < 0 { len + from } else { from }.clamp(0, len);
            let to = args.get(1).and_then(Value::as_number).unwrap_or(len as f64) as i64;
            let to = if to < 0 { len + to } else { to }.clamp(0, len);
            if to <= from {
                return Ok(Value::str(""));
            }
            Ok(Value::str(
                chars[from as usize..to as usize].iter().collect::<String>(),
            ))
        }),
        "replace" => Value::func(move |args| {
            let what = args.first().map(Value::display_string).unwrap_or_default();
            let with = args.get(1).map(Value::display_string).unwrap_or_default();
            if what.is_empty() {
                return Ok(Value::Str(s.clone()));
            }
            Ok(Value::str(s.replace(&what, &with)))
        }),
        _ => Value::Nil,
    }
}

fn map_member(map: &Rc<RefCell<MapData>>, name: &str) -> Value {
    if name == "__assign" {
        let m = map.clone();
        return Value::func(move |args| {
            let key = args.first().map(Value::display_string).unwrap_or_default();
            let value = args.get(1).cloned().unwrap_or(Value::Nil);
            m.borrow_mut().assign(key, value);
            Ok(Value::Nil)
        });
    }
    map.borrow_mut().resolve(name).unwrap_or(Value::Nil)
}

/// Numeric/string comparison used by the relational operators:
/// numbers when both sides have a numeric view, rendered strings
/// otherwise.
pub fn cmp_numeric_or_string(a: &Value, b: &Value) -> Option<Ordering> {
    match (number_for_cmp(a), number_for_cmp(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(a.display_string().cmp(&b.display_string())),
    }
}

fn number_for_cmp(v: &Value) -> Option<f64> {
    match v {
        Value::Nil => Some(0.0),
        other => other.as_number(),
    }
}

pub(crate) fn format_f64(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{:.0}", f)
    } else {
        f.to_string()
    }
}

pub(crate) fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

pub(crate) fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if at_word_start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_word_start = !c.is_alphanumeric();
    }
    out
}

fn replace_synonyms(s: &str) -> String {
    s.replace("id", "ID").replace("url", "URL").replace("api", "API")
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                Value::Number(n.as_f64().unwrap_or(f64::NAN))
            }
            serde_json::Value::String(s) => Value::str(s),
            serde_json::Value::Array(items) => {
                Value::array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                let mut data = MapData::new();
                for (k, v) in obj {
                    data.items.insert(k, Value::from(v));
                }
                Value::map(data)
            }
        }
    }
}
