//! Deserialized form of the pre-parsed pug AST.
//!
//! The AST arrives as JSON produced by the upstream pug parser; every
//! node kind shares one [`Token`] shape and the `kind` tag selects
//! which fields are meaningful. Unknown fields are ignored so newer
//! parser output stays loadable.

use serde::Deserialize;

/// One AST node. Field use depends on `kind`:
///
/// * `Tag` / `InterpolatedTag`: `name` (or `expr`), `attrs`,
///   `attribute_blocks`, `self_closing`, `is_inline`, `block`
/// * `Text`: `val`
/// * `Code`: `val`, `buffer`, `must_escape`, `is_inline`
/// * `Conditional`: `test`, `consequent`, `alternate`
/// * `Each`: `obj`, `val`, `key`, `block`
/// * `While`: `test`, `block`
/// * `Case` / `When`: `expr`, `block`
/// * `Mixin`: `name`, `args`, `call`, `block`, `attrs`
/// * `Doctype`: `val`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Token {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub mode: String,
    pub val: String,
    pub line: u64,
    pub filename: String,
    pub block: Option<Box<Token>>,
    pub nodes: Vec<Token>,
    pub attribute_blocks: Vec<String>,
    pub attrs: Vec<Attr>,
    pub must_escape: bool,
    pub self_closing: bool,
    pub is_inline: bool,
    pub buffer: bool,
    pub obj: String,
    pub key: Option<String>,
    pub call: bool,
    pub args: String,
    pub test: String,
    pub consequent: Option<Box<Token>>,
    pub alternate: Option<Box<Token>>,
    pub expr: String,
}

impl Token {
    /// Child nodes of the attached block, or none.
    pub fn block_nodes(&self) -> &[Token] {
        self.block.as_deref().map(|b| b.nodes.as_slice()).unwrap_or(&[])
    }
}

/// A single tag attribute. `val` is a JavaScript expression except for
/// bare boolean attributes, where the parser emits `true` directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Attr {
    pub name: String,
    pub val: AttrVal,
    pub must_escape: bool,
}

impl Default for Attr {
    fn default() -> Self {
        Attr {
            name: String::new(),
            val: AttrVal::Bool(true),
            must_escape: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AttrVal {
    Bool(bool),
    Str(String),
    Num(f64),
}

pub fn parse_ast(json: &str) -> Result<Token, serde_json::Error> {
    serde_json::from_str(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tag_tree() {
        let token = parse_ast(
            r#"{
                "type": "Block",
                "nodes": [
                    {
                        "type": "Tag",
                        "name": "a",
                        "selfClosing": false,
                        "attrs": [
                            {"name": "href", "val": "'/x'", "mustEscape": true},
                            {"name": "download", "val": true, "mustEscape": false}
                        ],
                        "block": {
                            "type": "Block",
                            "nodes": [{"type": "Text", "val": "hi", "line": 1}]
                        }
                    }
                ]
            }"#,
        )
        .expect("parse");
        assert_eq!(token.kind, "Block");
        let tag = &token.nodes[0];
        assert_eq!(tag.name, "a");
        assert_eq!(tag.attrs[0].val, AttrVal::Str("'/x'".to_string()));
        assert_eq!(tag.attrs[1].val, AttrVal::Bool(true));
        assert_eq!(tag.block_nodes()[0].val, "hi");
    }

    #[test]
    fn each_with_null_key() {
        let token = parse_ast(
            r#"{"type": "Each", "obj": "items", "val": "item", "key": null,
                "block": {"type": "Block", "nodes": []}}"#,
        )
        .expect("parse");
        assert_eq!(token.obj, "items");
        assert_eq!(token.key, None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let token = parse_ast(
            r#"{"type": "Text", "val": "x", "line": 3,
                "column": 7, "isHtml": false}"#,
        )
        .expect("parse");
        assert_eq!(token.val, "x");
        assert_eq!(token.line, 3);
    }
}
