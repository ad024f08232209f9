//! Rewrites JavaScript regular expression syntax into the dialect the
//! [`regex`] crate accepts.
//!
//! The output is best effort: constructs RE2-style engines cannot
//! express (lookahead, backreferences) are reported as errors while
//! the scan continues, so the caller gets both the error and whatever
//! could be salvaged. Structurally broken patterns (unterminated
//! classes or groups, stray `)`) yield an empty output.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegexError {
    #[error("Unterminated character class")]
    UnterminatedClass,
    #[error("Unterminated group")]
    UnterminatedGroup,
    #[error("Unmatched ')'")]
    UnmatchedParen,
    #[error("re2: Invalid (?{0}) <lookahead>")]
    Lookahead(char),
    #[error("re2: Invalid \\{0} <backreference>")]
    Backreference(String),
}

/// Transform a JavaScript regex pattern. Returns the rewritten
/// pattern together with the first error encountered, if any; a
/// structural error empties the output.
pub fn transform_regexp(pattern: &str) -> (String, Option<RegexError>) {
    let mut t = Transformer {
        chars: pattern.chars().collect(),
        pos: 0,
        out: String::with_capacity(pattern.len()),
        error: None,
        invalid: false,
    };
    t.pass();
    if t.invalid {
        return (String::new(), t.error);
    }
    (t.out, t.error)
}

struct Transformer {
    chars: Vec<char>,
    pos: usize,
    out: String,
    error: Option<RegexError>,
    invalid: bool,
}

impl Transformer {
    fn chr(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn read(&mut self) -> Option<char> {
        let c = self.chr();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn record(&mut self, err: RegexError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn pass(&mut self) {
        let mut depth = 0usize;
        let mut in_class = false;
        while let Some(c) = self.read() {
            match c {
                '\\' => self.escape(in_class),
                '[' if !in_class => {
                    in_class = true;
                    self.out.push('[');
                }
                // literal inside a class; unescaped it would open a
                // nested class set
                '[' => self.out.push_str("\\["),
                ']' if in_class => {
                    in_class = false;
                    self.out.push(']');
                }
                '(' if !in_class => {
                    self.out.push('(');
                    depth += 1;
                    if self.chr() == Some('?') {
                        self.read();
                        self.out.push('?');
                        if let Some(la @ ('=' | '!')) = self.chr() {
                            self.record(RegexError::Lookahead(la));
                        }
                    }
                }
                ')' if !in_class => {
                    if depth == 0 {
                        self.record(RegexError::UnmatchedParen);
                        self.invalid = true;
                        return;
                    }
                    depth -= 1;
                    self.out.push(')');
                }
                c => self.out.push(c),
            }
        }
        if in_class {
            self.record(RegexError::UnterminatedClass);
            self.invalid = true;
        } else if depth > 0 {
            self.record(RegexError::UnterminatedGroup);
            self.invalid = true;
        }
    }

    fn escape(&mut self, in_class: bool) {
        let Some(c) = self.read() else {
            // trailing backslash
            self.out.push('\\');
            return;
        };
        match c {
            '0'..='7' => self.octal_or_backreference(c),
            '8' | '9' => {
                let mut digits = String::from(c);
                while let Some(d @ '0'..='9') = self.chr() {
                    digits.push(d);
                    self.read();
                }
                self.out.push('\\');
                self.out.push_str(&digits);
                self.record(RegexError::Backreference(digits));
            }
            'c' => self.control_escape(),
            'b' if in_class => self.out.push_str("\\x08"),
            'b' | 'B' | 'd' | 'D' | 's' | 'S' | 'w' | 'W' | 'f' | 'n' | 'r' | 't'
            | 'v' => {
                self.out.push('\\');
                self.out.push(c);
            }
            'u' => self.hex_escape('u', 4),
            'x' => self.hex_escape('x', 2),
            c if c == '$' || !is_identifier_part(c) => {
                self.out.push('\\');
                self.out.push(c);
            }
            c => self.out.push(c),
        }
    }

    /// `\0` stays, a lone non-zero octal digit is a backreference
    /// (written through), longer runs become `\xHH`.
    fn octal_or_backreference(&mut self, first: char) {
        let mut value = first as i64 - '0' as i64;
        let mut size = 1;
        while let Some(d @ '0'..='7') = self.chr() {
            value = value * 8 + (d as i64 - '0' as i64);
            self.read();
            size += 1;
        }
        if size == 1 {
            self.out.push('\\');
            self.out.push(first);
            if value != 0 {
                self.record(RegexError::Backreference(value.to_string()));
            }
            return;
        }
        if value >= 16 {
            self.out.push_str(&format!("\\x{value:02x}"));
        } else {
            self.out.push_str(&format!("\\x0{value:x}"));
        }
    }

    fn control_escape(&mut self) {
        match self.chr() {
            Some(l) if l.is_ascii_alphabetic() => {
                self.read();
                let value = (l.to_ascii_lowercase() as i64) - ('a' as i64) + 1;
                if value >= 16 {
                    self.out.push_str(&format!("\\x{value:02x}"));
                } else {
                    self.out.push_str(&format!("\\x0{value:x}"));
                }
            }
            _ => self.out.push('c'),
        }
    }

    /// `\uHHHH` / `\xHH`. On malformed hex the backslash is dropped
    /// and the consumed characters are written through untouched.
    fn hex_escape(&mut self, kind: char, length: usize) {
        let mut consumed = String::new();
        for _ in 0..length {
            match self.chr() {
                Some(d) if d.is_ascii_hexdigit() => {
                    consumed.push(d);
                    self.read();
                }
                _ => {
                    self.out.push(kind);
                    self.out.push_str(&consumed);
                    return;
                }
            }
        }
        // length hex digits always parse
        let value = u32::from_str_radix(&consumed, 16).unwrap_or(0);
        if length == 4 {
            self.out.push_str(&format!("\\x{{{value:x}}}"));
        } else {
            self.out.push_str(&format!("\\x{value:02x}"));
        }
    }
}

fn is_identifier_part(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}
