//! End-to-end renders: AST JSON in, HTML out.

use std::path::Path;

use pugml::{Engine, EngineOptions, RenderContext};
use serde_json::json;

fn engine_with(ast: serde_json::Value) -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().expect("tempdir");
    write_template(dir.path(), "page", ast);
    let engine = Engine::new(EngineOptions::new(dir.path()));
    engine.load_templates(None).expect("load");
    (dir, engine)
}

fn write_template(dir: &Path, name: &str, ast: serde_json::Value) {
    let path = dir.join(format!("{name}.ast.json"));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(path, serde_json::to_vec(&ast).expect("json")).expect("write");
}

async fn render(ast: serde_json::Value, data: serde_json::Value) -> String {
    let (_dir, engine) = engine_with(ast);
    engine
        .render("page", &RenderContext::new(data))
        .await
        .expect("render")
}

fn block(nodes: serde_json::Value) -> serde_json::Value {
    json!({"type": "Block", "nodes": nodes})
}

fn text(val: &str) -> serde_json::Value {
    json!({"type": "Text", "val": val})
}

fn code(val: &str) -> serde_json::Value {
    json!({"type": "Code", "val": val, "buffer": true, "mustEscape": true})
}

fn stmt(val: &str) -> serde_json::Value {
    json!({"type": "Code", "val": val, "buffer": false})
}

#[tokio::test]
async fn product_page() {
    let ast = block(json!([
        {"type": "Doctype", "val": "html"},
        {"type": "Tag", "name": "div",
         "attrs": [{"name": "class", "val": "'list'", "mustEscape": true}],
         "block": block(json!([
            {"type": "Each", "obj": "products", "val": "p", "key": null,
             "block": block(json!([
                {"type": "Tag", "name": "span", "block": block(json!([code("p.name")]))}
             ]))}
         ]))}
    ]));
    let out = render(
        ast,
        json!({"products": [{"name": "First"}, {"name": "Second"}]}),
    )
    .await;
    assert_eq!(
        out,
        "<!DOCTYPE html><div class=\"list\"><span>First</span><span>Second</span></div>"
    );
}

#[tokio::test]
async fn each_doubles_numbers() {
    let ast = json!({
        "type": "Each", "obj": "items", "val": "n", "key": null,
        "block": block(json!([code("n * 2"), text(" ")]))
    });
    let out = render(ast, json!({"items": [1, 2, 3]})).await;
    assert_eq!(out.trim_end(), "2 4 6");
}

#[tokio::test]
async fn object_literal_iterates_in_declared_order() {
    let ast = block(json!([
        stmt("var m = {b: 1, a: 2}"),
        {"type": "Each", "obj": "m", "val": "v", "key": "k",
         "block": block(json!([code("k"), text("="), code("v"), text(";")]))}
    ]));
    assert_eq!(render(ast, json!({})).await, "b=1;a=2;");
}

#[tokio::test]
async fn while_loop_with_counter() {
    let ast = block(json!([
        stmt("var i = 0"),
        {"type": "While", "test": "i < 3",
         "block": block(json!([code("i"), stmt("i++")]))}
    ]));
    assert_eq!(render(ast, json!({})).await, "012");
}

#[tokio::test]
async fn conditional_branches() {
    let cond = |test: &str| {
        block(json!([
            {"type": "Conditional", "test": test,
             "consequent": block(json!([text("yes")])),
             "alternate": block(json!([text("no")]))}
        ]))
    };
    assert_eq!(render(cond("count > 1"), json!({"count": 2})).await, "yes");
    assert_eq!(render(cond("count > 1"), json!({"count": 0})).await, "no");
}

#[tokio::test]
async fn case_selects_arm_and_default() {
    let ast = json!({
        "type": "Case", "expr": "kind",
        "block": block(json!([
            {"type": "When", "expr": "'a'", "block": block(json!([text("Alpha")]))},
            {"type": "When", "expr": "default", "block": block(json!([text("Other")]))}
        ]))
    });
    assert_eq!(render(ast.clone(), json!({"kind": "a"})).await, "Alpha");
    assert_eq!(render(ast, json!({"kind": "z"})).await, "Other");
}

#[tokio::test]
async fn attribute_merging() {
    let ast = json!({
        "type": "Tag", "name": "a",
        "attrs": [
            {"name": "class", "val": "'btn'", "mustEscape": true},
            {"name": "class", "val": "'active'", "mustEscape": true},
            {"name": "disabled", "val": false, "mustEscape": true},
            {"name": "href", "val": "'/x?a=1&b=2'", "mustEscape": true}
        ]
    });
    assert_eq!(
        render(ast, json!({})).await,
        "<a class=\"btn active\" href=\"/x?a=1&amp;b=2\"></a>"
    );
}

#[tokio::test]
async fn boolean_attribute_renders_its_name() {
    let ast = json!({
        "type": "Tag", "name": "input",
        "attrs": [
            {"name": "type", "val": "'checkbox'", "mustEscape": true},
            {"name": "checked", "val": true, "mustEscape": true}
        ]
    });
    assert_eq!(
        render(ast, json!({})).await,
        "<input type=\"checkbox\" checked=\"checked\"/>"
    );
}

#[tokio::test]
async fn text_keeps_literal_action_braces() {
    let ast = text("a {{ b }} c");
    assert_eq!(render(ast, json!({})).await, "a {{ b }} c");
}

#[tokio::test]
async fn buffered_code_escapes_unescaped_passes() {
    let ast = block(json!([
        code("html"),
        {"type": "Code", "val": "html", "buffer": true, "mustEscape": false}
    ]));
    assert_eq!(
        render(ast, json!({"html": "<b>"})).await,
        "&lt;b&gt;<b>"
    );
}

#[tokio::test]
async fn string_interpolation() {
    let ast = code("'Hello ${name}!'");
    // __str joins segments and prefixes one space
    assert_eq!(
        render(ast, json!({"name": "world"})).await,
        " Hello world!"
    );
}

#[tokio::test]
async fn mixin_called_before_definition() {
    let ast = block(json!([
        {"type": "Mixin", "name": "card", "call": true, "args": "'X'"},
        {"type": "Mixin", "name": "card", "call": false, "args": "title",
         "block": block(json!([
            {"type": "Tag", "name": "h1", "block": block(json!([code("title")]))}
         ]))}
    ]));
    assert_eq!(render(ast, json!({})).await, "<h1>X</h1>");
}

#[tokio::test]
async fn mixin_attributes_map() {
    let ast = block(json!([
        {"type": "Mixin", "name": "tag", "call": false, "args": "",
         "block": block(json!([code("attributes.cls")]))},
        {"type": "Mixin", "name": "tag", "call": true, "args": "",
         "attrs": [{"name": "cls", "val": "'red'", "mustEscape": true}]}
    ]));
    assert_eq!(render(ast, json!({})).await, "red");
}

#[tokio::test]
async fn mixin_block_renders_caller_content() {
    let ast = block(json!([
        {"type": "Mixin", "name": "wrap", "call": false, "args": "",
         "block": block(json!([text("["), {"type": "MixinBlock"}, text("]")]))},
        {"type": "Mixin", "name": "wrap", "call": true, "args": "",
         "block": block(json!([code("inner")]))}
    ]));
    assert_eq!(render(ast, json!({"inner": "mid"})).await, "[mid]");
}

#[tokio::test]
async fn mixin_default_parameter() {
    let ast = block(json!([
        {"type": "Mixin", "name": "greet", "call": false, "args": "who = 'anyone'",
         "block": block(json!([text("hi "), code("who")]))},
        {"type": "Mixin", "name": "greet", "call": true, "args": ""},
        {"type": "Mixin", "name": "greet", "call": true, "args": "'team'"}
    ]));
    assert_eq!(render(ast, json!({})).await, "hi anyonehi team");
}

#[tokio::test]
async fn array_methods_and_indexing() {
    let ast = block(json!([
        code("items.length"), text("/"),
        code("items[1]"), text("/"),
        code("items.join('-')")
    ]));
    assert_eq!(
        render(ast, json!({"items": ["a", "b", "c"]})).await,
        "3/b/a-b-c"
    );
}

#[tokio::test]
async fn bracket_assignment_stores_variable_value() {
    let ast = block(json!([
        stmt("var m = {}"),
        stmt("var v = 'val'"),
        stmt("m['k'] = v"),
        code("m.k")
    ]));
    assert_eq!(render(ast, json!({})).await, "val");
}

#[tokio::test]
async fn string_methods() {
    let ast = block(json!([
        code("name.toUpperCase()"), text("/"),
        code("name.slice(1, 3)")
    ]));
    assert_eq!(render(ast, json!({"name": "hello"})).await, "HELLO/el");
}

#[tokio::test]
async fn member_name_fallback_for_host_style_keys() {
    let ast = code("product.urlTitle");
    assert_eq!(
        render(ast, json!({"product": {"URLTitle": "shoes"}})).await,
        "shoes"
    );
}

#[tokio::test]
async fn undefined_arithmetic_prints_sentinel() {
    let ast = code("missing * 2");
    assert_eq!(render(ast, json!({})).await, "&lt;nil&gt;");
}

#[tokio::test]
async fn interpolated_tag_name() {
    let ast = json!({
        "type": "InterpolatedTag", "expr": "tagName",
        "block": block(json!([text("x")]))
    });
    assert_eq!(
        render(ast, json!({"tagName": "em"})).await,
        "<em>x</em>"
    );
}
