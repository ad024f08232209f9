//! Parser for the intermediate template language.
//!
//! The language is the action/pipeline notation the compiler emits:
//! literal text interleaved with `{{ ... }}` actions, `{{- -}}` trim
//! markers, control forms (`if`/`else if`/`else`, `with`, `range`,
//! `try`/`catch`, `template`, `define`) and pipelines of commands with
//! optional variable declarations. Parsing yields a [`ProgramSet`]:
//! the root node list plus every `define`d sub-template by name.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ItlError {
    pub message: String,
}

impl ItlError {
    fn new(message: impl Into<String>) -> Self {
        ItlError {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Text(String),
    /// `{{ pipeline }}`; prints its value unless the pipeline declares
    /// variables.
    Action(Pipe),
    If {
        pipe: Pipe,
        then: Vec<Node>,
        els: Vec<Node>,
    },
    With {
        pipe: Pipe,
        body: Vec<Node>,
        els: Vec<Node>,
    },
    Range {
        pipe: Pipe,
        body: Vec<Node>,
        els: Vec<Node>,
    },
    Template {
        name: TemplateRef,
        pipe: Option<Pipe>,
    },
    Try {
        body: Vec<Node>,
        param: String,
        catch: Vec<Node>,
    },
}

#[derive(Debug, Clone)]
pub enum TemplateRef {
    Literal(String),
    Var(String),
}

#[derive(Debug, Clone, Default)]
pub struct Pipe {
    /// Variable names declared with `:=`, without the `$`.
    pub decls: Vec<String>,
    pub cmds: Vec<Cmd>,
}

#[derive(Debug, Clone)]
pub struct Cmd {
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone)]
pub enum Arg {
    Num(f64),
    Str(String),
    Bool(bool),
    /// Bare `.`
    Dot,
    /// `.a.b` on the current dot value.
    Field(Vec<String>),
    /// `$name.a.b`
    Var { name: String, fields: Vec<String> },
    Ident(String),
    /// `( pipeline ).a.b`
    Pipe { pipe: Pipe, fields: Vec<String> },
}

#[derive(Debug)]
pub struct ProgramSet {
    pub root: Vec<Node>,
    pub templates: HashMap<String, Vec<Node>>,
}

pub fn parse(src: &str) -> Result<ProgramSet, ItlError> {
    let items = scan_items(src)?;
    let mut p = Parser {
        items,
        pos: 0,
        templates: HashMap::new(),
    };
    let (root, stop) = p.parse_nodes(&[])?;
    if let Some(stop) = stop {
        return Err(ItlError::new(format!("unexpected {{{{{}}}}}", stop.keyword)));
    }
    Ok(ProgramSet {
        root,
        templates: p.templates,
    })
}

enum Item {
    Text(String),
    Action(Vec<Tok>),
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Var(String),
    Field(String),
    Num(f64),
    Str(String),
    LParen,
    RParen,
    PipeSep,
    Assign,
    Comma,
}

/// Split source into text runs and lexed actions, applying `{{-` and
/// `-}}` whitespace trimming to the neighbouring text.
fn scan_items(src: &str) -> Result<Vec<Item>, ItlError> {
    let mut items = Vec::new();
    let mut rest = src;
    let mut trim_pending = false;
    loop {
        match rest.find("{{") {
            None => {
                push_text(&mut items, rest, trim_pending, false);
                return Ok(items);
            }
            Some(at) => {
                let mut content_start = at + 2;
                let mut trim_before = false;
                let after = &rest[content_start..];
                if let Some(stripped) = after.strip_prefix('-') {
                    if stripped.starts_with(char::is_whitespace) {
                        trim_before = true;
                        content_start += 1;
                    }
                }
                push_text(&mut items, &rest[..at], trim_pending, trim_before);

                let content_rest = &rest[content_start..];
                let end = find_action_end(content_rest).ok_or_else(|| {
                    ItlError::new("unterminated action: missing }}".to_string())
                })?;
                let mut content = &content_rest[..end];
                let mut trim_after = false;
                let trimmed = content.trim_end();
                if let Some(stripped) = trimmed.strip_suffix('-') {
                    if stripped.ends_with(char::is_whitespace) || stripped.is_empty() {
                        trim_after = true;
                        content = stripped;
                    }
                }
                items.push(Item::Action(lex_action(content)?));
                trim_pending = trim_after;
                rest = &content_rest[end + 2..];
            }
        }
    }
}

fn push_text(items: &mut Vec<Item>, text: &str, trim_start: bool, trim_end: bool) {
    let mut text = text;
    if trim_start {
        text = text.trim_start();
    }
    if trim_end {
        text = text.trim_end();
    }
    if !text.is_empty() {
        items.push(Item::Text(text.to_string()));
    }
}

/// Position of the closing `}}`, skipping over string literals.
fn find_action_end(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut in_str = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_str => i += 1,
            b'"' => in_str = !in_str,
            b'}' if !in_str && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn lex_action(content: &str) -> Result<Vec<Tok>, ItlError> {
    let chars: Vec<char> = content.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '|' => {
                toks.push(Tok::PipeSep);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            ':' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(ItlError::new(format!("bad token ':' in {content:?}")));
                }
                toks.push(Tok::Assign);
                i += 2;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ItlError::new(format!(
                                "unterminated string in {content:?}"
                            )))
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            i += 1;
                            match chars.get(i) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some('r') => s.push('\r'),
                                Some(&c) => s.push(c),
                                None => {
                                    return Err(ItlError::new(format!(
                                        "unterminated string in {content:?}"
                                    )))
                                }
                            }
                            i += 1;
                        }
                        Some(&c) => {
                            s.push(c);
                            i += 1;
                        }
                    }
                }
                toks.push(Tok::Str(s));
            }
            '$' => {
                let start = i;
                i += 1;
                while i < chars.len() && (is_ident_char(chars[i]) || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                toks.push(Tok::Var(text));
            }
            '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (is_ident_char(chars[i]) || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                toks.push(Tok::Field(text));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || matches!(chars[i], '.' | 'e' | 'E' | '+' | '-'))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    ItlError::new(format!("bad number {text:?} in {content:?}"))
                })?;
                toks.push(Tok::Num(n));
            }
            c if is_ident_char(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                toks.push(Tok::Ident(text));
            }
            other => {
                return Err(ItlError::new(format!(
                    "bad character {other:?} in {content:?}"
                )))
            }
        }
    }
    Ok(toks)
}

fn is_ident_char(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

struct Stop {
    keyword: String,
    rest: Vec<Tok>,
}

struct Parser {
    items: Vec<Item>,
    pos: usize,
    templates: HashMap<String, Vec<Node>>,
}

impl Parser {
    fn parse_nodes(
        &mut self,
        stops: &[&str],
    ) -> Result<(Vec<Node>, Option<Stop>), ItlError> {
        let mut nodes = Vec::new();
        while self.pos < self.items.len() {
            let item = std::mem::replace(&mut self.items[self.pos], Item::Text(String::new()));
            self.pos += 1;
            match item {
                Item::Text(t) => nodes.push(Node::Text(t)),
                Item::Action(toks) => {
                    if let Some(Tok::Ident(word)) = toks.first() {
                        if stops.contains(&word.as_str())
                            || matches!(word.as_str(), "end" | "else" | "catch")
                        {
                            let keyword = word.clone();
                            if !stops.contains(&keyword.as_str()) {
                                return Err(ItlError::new(format!(
                                    "unexpected {{{{{keyword}}}}}"
                                )));
                            }
                            return Ok((
                                nodes,
                                Some(Stop {
                                    keyword,
                                    rest: toks[1..].to_vec(),
                                }),
                            ));
                        }
                    }
                    if let Some(node) = self.parse_action(toks)? {
                        nodes.push(node);
                    }
                }
            }
        }
        if stops.is_empty() {
            Ok((nodes, None))
        } else {
            Err(ItlError::new(format!(
                "unexpected end of template, expected one of {stops:?}"
            )))
        }
    }

    fn parse_action(&mut self, toks: Vec<Tok>) -> Result<Option<Node>, ItlError> {
        let keyword = match toks.first() {
            Some(Tok::Ident(w)) => w.clone(),
            _ => String::new(),
        };
        match keyword.as_str() {
            "if" => Ok(Some(self.parse_if(toks[1..].to_vec())?)),
            "with" => {
                let pipe = parse_pipe(&toks[1..])?;
                let (body, els) = self.parse_branch_bodies()?;
                Ok(Some(Node::With { pipe, body, els }))
            }
            "range" => {
                let pipe = parse_pipe(&toks[1..])?;
                let (body, els) = self.parse_branch_bodies()?;
                Ok(Some(Node::Range { pipe, body, els }))
            }
            "template" => {
                let name = match toks.get(1) {
                    Some(Tok::Str(s)) => TemplateRef::Literal(s.clone()),
                    Some(Tok::Var(v)) => {
                        TemplateRef::Var(v.trim_start_matches('$').to_string())
                    }
                    _ => {
                        return Err(ItlError::new(
                            "template action requires a name".to_string(),
                        ))
                    }
                };
                let pipe = if toks.len() > 2 {
                    Some(parse_pipe(&toks[2..])?)
                } else {
                    None
                };
                Ok(Some(Node::Template { name, pipe }))
            }
            "define" => {
                let name = match toks.get(1) {
                    Some(Tok::Str(s)) => s.clone(),
                    _ => {
                        return Err(ItlError::new(
                            "define action requires a quoted name".to_string(),
                        ))
                    }
                };
                let (body, stop) = self.parse_nodes(&["end"])?;
                debug_assert!(stop.is_some());
                self.templates.insert(name, body);
                Ok(None)
            }
            "try" => {
                let (body, stop) = self.parse_nodes(&["catch", "end"])?;
                let stop = stop.ok_or_else(|| ItlError::new("unterminated try"))?;
                if stop.keyword == "end" {
                    return Ok(Some(Node::Try {
                        body,
                        param: String::new(),
                        catch: Vec::new(),
                    }));
                }
                let param = match stop.rest.first() {
                    Some(Tok::Ident(p)) => p.clone(),
                    Some(Tok::Var(v)) => v.trim_start_matches('$').to_string(),
                    _ => String::new(),
                };
                let (catch, _) = self.parse_nodes(&["end"])?;
                Ok(Some(Node::Try { body, param, catch }))
            }
            _ => Ok(Some(Node::Action(parse_pipe(&toks)?))),
        }
    }

    fn parse_if(&mut self, toks: Vec<Tok>) -> Result<Node, ItlError> {
        let pipe = parse_pipe(&toks)?;
        let (then, stop) = self.parse_nodes(&["else", "end"])?;
        let stop = stop.ok_or_else(|| ItlError::new("unterminated if"))?;
        let els = if stop.keyword == "end" {
            Vec::new()
        } else if matches!(stop.rest.first(), Some(Tok::Ident(w)) if w == "if") {
            // else-if shares the single closing end
            vec![self.parse_if(stop.rest[1..].to_vec())?]
        } else {
            let (els, _) = self.parse_nodes(&["end"])?;
            els
        };
        Ok(Node::If { pipe, then, els })
    }

    fn parse_branch_bodies(&mut self) -> Result<(Vec<Node>, Vec<Node>), ItlError> {
        let (body, stop) = self.parse_nodes(&["else", "end"])?;
        let stop = stop.ok_or_else(|| ItlError::new("unterminated block"))?;
        if stop.keyword == "end" {
            return Ok((body, Vec::new()));
        }
        let (els, _) = self.parse_nodes(&["end"])?;
        Ok((body, els))
    }
}

fn parse_pipe(toks: &[Tok]) -> Result<Pipe, ItlError> {
    // declarations end at a top-level :=
    let mut decls = Vec::new();
    let mut body = toks;
    let mut depth = 0;
    let mut assign_at = None;
    for (i, t) in toks.iter().enumerate() {
        match t {
            Tok::LParen => depth += 1,
            Tok::RParen => depth -= 1,
            Tok::Assign if depth == 0 => {
                assign_at = Some(i);
                break;
            }
            _ => {}
        }
    }
    if let Some(at) = assign_at {
        for t in &toks[..at] {
            match t {
                Tok::Var(v) => {
                    let name = v.trim_start_matches('$');
                    if name.contains('.') {
                        return Err(ItlError::new(format!(
                            "cannot declare variable with fields: {v}"
                        )));
                    }
                    decls.push(name.to_string());
                }
                Tok::Comma => {}
                other => {
                    return Err(ItlError::new(format!(
                        "bad variable declaration token {other:?}"
                    )))
                }
            }
        }
        body = &toks[at + 1..];
    }

    // commands split on top-level |
    let mut cmds = Vec::new();
    let mut current: Vec<&Tok> = Vec::new();
    let mut depth = 0;
    for t in body {
        match t {
            Tok::LParen => {
                depth += 1;
                current.push(t);
            }
            Tok::RParen => {
                depth -= 1;
                current.push(t);
            }
            Tok::PipeSep if depth == 0 => {
                cmds.push(parse_cmd(&current)?);
                current.clear();
            }
            _ => current.push(t),
        }
    }
    if !current.is_empty() {
        cmds.push(parse_cmd(&current)?);
    }
    if cmds.is_empty() {
        return Err(ItlError::new("empty pipeline"));
    }
    Ok(Pipe { decls, cmds })
}

fn parse_cmd(toks: &[&Tok]) -> Result<Cmd, ItlError> {
    let mut args = Vec::new();
    let mut i = 0;
    while i < toks.len() {
        match toks[i] {
            Tok::Num(n) => {
                args.push(Arg::Num(*n));
                i += 1;
            }
            Tok::Str(s) => {
                args.push(Arg::Str(s.clone()));
                i += 1;
            }
            Tok::Ident(w) => {
                args.push(match w.as_str() {
                    "true" => Arg::Bool(true),
                    "false" => Arg::Bool(false),
                    _ => Arg::Ident(w.clone()),
                });
                i += 1;
            }
            Tok::Var(v) => {
                let mut parts = v.trim_start_matches('$').split('.');
                let name = parts.next().unwrap_or_default().to_string();
                let fields = parts.map(str::to_string).collect();
                args.push(Arg::Var { name, fields });
                i += 1;
            }
            Tok::Field(f) => {
                if f == "." {
                    args.push(Arg::Dot);
                } else {
                    args.push(Arg::Field(split_fields(f)));
                }
                i += 1;
            }
            Tok::LParen => {
                let mut depth = 1;
                let mut j = i + 1;
                while j < toks.len() && depth > 0 {
                    match toks[j] {
                        Tok::LParen => depth += 1,
                        Tok::RParen => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                if depth != 0 {
                    return Err(ItlError::new("unbalanced parentheses"));
                }
                let inner: Vec<Tok> =
                    toks[i + 1..j - 1].iter().map(|t| (*t).clone()).collect();
                let pipe = parse_pipe(&inner)?;
                let mut fields = Vec::new();
                if let Some(Tok::Field(f)) = toks.get(j).copied() {
                    fields = split_fields(f);
                    i = j + 1;
                } else {
                    i = j;
                }
                args.push(Arg::Pipe { pipe, fields });
            }
            other => {
                return Err(ItlError::new(format!("unexpected token {other:?}")));
            }
        }
    }
    Ok(Cmd { args })
}

fn split_fields(f: &str) -> Vec<String> {
    f.trim_start_matches('.')
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_action_split() {
        let p = parse("a{{$x | __pug__html}}b").expect("parse");
        assert_eq!(p.root.len(), 3);
        let Node::Action(pipe) = &p.root[1] else {
            panic!("expected action")
        };
        assert_eq!(pipe.cmds.len(), 2);
        assert!(matches!(
            pipe.cmds[0].args[0],
            Arg::Var { ref name, .. } if name == "x"
        ));
        assert!(matches!(
            pipe.cmds[1].args[0],
            Arg::Ident(ref n) if n == "__pug__html"
        ));
    }

    #[test]
    fn trim_markers_eat_whitespace() {
        let p = parse("a  {{- $x -}}  b").expect("parse");
        assert!(matches!(&p.root[0], Node::Text(t) if t == "a"));
        assert!(matches!(&p.root[2], Node::Text(t) if t == "b"));
    }

    #[test]
    fn braces_inside_strings_survive() {
        let p = parse("{{\"{{\"}}").expect("parse");
        let Node::Action(pipe) = &p.root[0] else {
            panic!("expected action")
        };
        assert!(matches!(&pipe.cmds[0].args[0], Arg::Str(s) if s == "{{"));
    }

    #[test]
    fn declarations() {
        let p = parse("{{ $k, $v := $items }}").expect("parse");
        let Node::Action(pipe) = &p.root[0] else {
            panic!("expected action")
        };
        assert_eq!(pipe.decls, vec!["k", "v"]);
    }

    #[test]
    fn else_if_chain() {
        let p = parse("{{if $a}}A{{else if $b}}B{{else}}C{{end}}").expect("parse");
        let Node::If { els, .. } = &p.root[0] else {
            panic!("expected if")
        };
        let Node::If { then, els: inner_els, .. } = &els[0] else {
            panic!("expected nested if")
        };
        assert!(matches!(&then[0], Node::Text(t) if t == "B"));
        assert!(matches!(&inner_els[0], Node::Text(t) if t == "C"));
    }

    #[test]
    fn define_is_extracted() {
        let p = parse("x{{define \"t\"}}body{{end}}y").expect("parse");
        assert_eq!(p.root.len(), 2);
        assert!(matches!(&p.templates["t"][0], Node::Text(t) if t == "body"));
    }

    #[test]
    fn try_catch() {
        let p = parse("{{ try }}a{{ catch e }}b{{ end }}").expect("parse");
        let Node::Try { body, param, catch } = &p.root[0] else {
            panic!("expected try")
        };
        assert!(matches!(&body[0], Node::Text(t) if t == "a"));
        assert_eq!(param, "e");
        assert!(matches!(&catch[0], Node::Text(t) if t == "b"));
    }

    #[test]
    fn subpipe_with_field_access() {
        let p = parse("{{((__pug__index $a 0).__assign \"k\" 1)}}").expect("parse");
        let Node::Action(pipe) = &p.root[0] else {
            panic!("expected action")
        };
        let Arg::Pipe { pipe: outer, .. } = &pipe.cmds[0].args[0] else {
            panic!("expected sub-pipe")
        };
        let Arg::Pipe { fields, .. } = &outer.cmds[0].args[0] else {
            panic!("expected inner sub-pipe")
        };
        assert_eq!(fields, &["__assign"]);
    }

    #[test]
    fn template_with_variable_name() {
        let p = parse("{{ template $__block__ }}").expect("parse");
        assert!(matches!(
            &p.root[0],
            Node::Template {
                name: TemplateRef::Var(v),
                pipe: None,
            } if v == "__block__"
        ));
    }

    #[test]
    fn unbalanced_end_is_an_error() {
        assert!(parse("{{end}}").is_err());
        assert!(parse("{{if $x}}a").is_err());
    }
}
