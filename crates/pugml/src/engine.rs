//! Engine-scoped template surface: loading, caching and rendering.
//!
//! An [`Engine`] owns a compile cache keyed by template name, an asset
//! manifest, and the host function registry layered over the builtin
//! runtime table. Caching is concurrency-safe; renders only take the
//! read lock. In debug mode every render recompiles its template from
//! disk so edits show up without a reload.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::ast;
use crate::error::{CompileError, EvalResult, RenderError};
use crate::exec::{self, ExecError};
use crate::itl;
use crate::lower::{self, numbered_source};
use crate::ops;
use crate::value::Value;

const AST_SUFFIX: &str = ".ast.json";
const MANIFEST_FILE: &str = "manifest.json";

type HostFunc = Arc<dyn Fn(&[Value]) -> EvalResult + Send + Sync>;

#[derive(Clone)]
pub struct EngineOptions {
    /// Directory holding `*.ast.json` template files and the optional
    /// asset `manifest.json`.
    pub basedir: PathBuf,
    /// Recompile on every render and treat unresolved mixins as fatal.
    pub debug: bool,
    render_limit: usize,
}

impl EngineOptions {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        EngineOptions {
            basedir: basedir.into(),
            debug: false,
            render_limit: 0,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Cap the number of concurrent renders. Zero disables the limit.
    pub fn with_render_limit(mut self, limit: usize) -> Self {
        self.render_limit = limit;
        self
    }
}

/// Per-render input: the data the template sees, plus an optional
/// deadline after which the render is abandoned.
#[derive(Clone, Default)]
pub struct RenderContext {
    pub data: serde_json::Value,
    deadline: Option<Instant>,
}

impl RenderContext {
    pub fn new(data: serde_json::Value) -> Self {
        RenderContext {
            data,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

struct CompiledTemplate {
    itl: String,
    program: itl::ProgramSet,
}

pub struct Engine {
    opts: EngineOptions,
    templates: RwLock<HashMap<String, Arc<CompiledTemplate>>>,
    assets: RwLock<HashMap<String, String>>,
    hosts: RwLock<HashMap<String, HostFunc>>,
    limiter: Option<Arc<Semaphore>>,
    /// Serializes every compile, including the manifest re-read;
    /// renders only take the `templates` read lock.
    compile_lock: Mutex<()>,
    loaded: AtomicBool,
}

impl Engine {
    pub fn new(opts: EngineOptions) -> Self {
        let limiter = match opts.render_limit {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Engine {
            opts,
            templates: RwLock::new(HashMap::new()),
            assets: RwLock::new(HashMap::new()),
            hosts: RwLock::new(HashMap::new()),
            limiter,
            compile_lock: Mutex::new(()),
            loaded: AtomicBool::new(false),
        }
    }

    /// Register a host function callable from template expressions.
    /// Replaces any builtin or previously registered function with the
    /// same name.
    pub fn register_func<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> EvalResult + Send + Sync + 'static,
    {
        self.hosts.write().insert(name.into(), Arc::new(f));
    }

    /// Load and compile every template under the base directory,
    /// refreshing the asset manifest first. `filter` restricts the
    /// load to template names with that prefix; already cached entries
    /// outside the filter are kept. Stops at the first failure.
    pub fn load_templates(&self, filter: Option<&str>) -> Result<(), CompileError> {
        let _compiling = self.compile_lock.lock();
        self.load_templates_locked(filter)
    }

    fn load_templates_locked(&self, filter: Option<&str>) -> Result<(), CompileError> {
        self.load_manifest()?;

        let mut paths = Vec::new();
        collect_ast_files(&self.opts.basedir, &mut paths)?;

        let funcs = self.function_names();
        let mut loaded = 0usize;
        for path in paths {
            let name = template_name(&self.opts.basedir, &path);
            if let Some(filter) = filter {
                if !name.starts_with(filter) {
                    continue;
                }
            }
            let compiled = self.compile_file(&path, &name, &funcs)?;
            self.templates.write().insert(name.clone(), Arc::new(compiled));
            debug!(template = %name, "compiled template");
            loaded += 1;
        }
        info!(count = loaded, basedir = %self.opts.basedir.display(), "templates loaded");
        if filter.is_none() {
            self.loaded.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Production-mode lazy load: the first render that misses the
    /// cache compiles everything once; later misses stay misses.
    fn ensure_loaded(&self) -> Result<(), CompileError> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let _compiling = self.compile_lock.lock();
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        self.load_templates_locked(None)
    }

    /// Render one template. Waits for an execution slot when a render
    /// limit is configured; the context deadline bounds both the wait
    /// and the render itself.
    pub async fn render(
        &self,
        name: &str,
        ctx: &RenderContext,
    ) -> Result<String, RenderError> {
        let _permit = self.acquire_slot(name, ctx).await?;
        self.render_locked(name, ctx)
    }

    /// Render the named partial blocks of a template, keyed by partial
    /// name. Partials live under `<name>.partial/`.
    pub async fn render_partials(
        &self,
        name: &str,
        partials: &[String],
        ctx: &RenderContext,
    ) -> Result<HashMap<String, String>, RenderError> {
        let _permit = self.acquire_slot(name, ctx).await?;
        let mut out = HashMap::new();
        for partial in partials {
            let full = format!("{name}.partial/{partial}");
            out.insert(partial.clone(), self.render_locked(&full, ctx)?);
        }
        Ok(out)
    }

    /// Resolve a logical asset path through the manifest; unknown
    /// assets pass through unchanged.
    pub fn asset(&self, name: &str) -> String {
        self.assets
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Line-numbered ITL listing of a compiled template, for
    /// diagnosing compile and render reports.
    pub fn template_source(&self, name: &str) -> Option<String> {
        self.templates
            .read()
            .get(name)
            .map(|t| numbered_source(&t.itl))
    }

    async fn acquire_slot(
        &self,
        name: &str,
        ctx: &RenderContext,
    ) -> Result<Option<tokio::sync::OwnedSemaphorePermit>, RenderError> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };
        let started = Instant::now();
        let acquire = limiter.clone().acquire_owned();
        let permit = match ctx.deadline {
            Some(deadline) => {
                tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), acquire)
                    .await
                    .map_err(|_| RenderError::Cancelled(name.to_string()))?
            }
            None => acquire.await,
        };
        let permit = permit.map_err(|_| RenderError::Cancelled(name.to_string()))?;
        debug!(template = %name, wait = ?started.elapsed(), "render slot acquired");
        Ok(Some(permit))
    }

    fn render_locked(&self, name: &str, ctx: &RenderContext) -> Result<String, RenderError> {
        let template = if self.opts.debug {
            let path = self.opts.basedir.join(format!("{name}{AST_SUFFIX}"));
            if !path.is_file() {
                return Err(RenderError::TemplateNotFound(name.to_string()));
            }
            let _compiling = self.compile_lock.lock();
            let compiled = self.compile_file(&path, name, &self.function_names())?;
            let compiled = Arc::new(compiled);
            self.templates
                .write()
                .insert(name.to_string(), compiled.clone());
            compiled
        } else {
            let cached = self.templates.read().get(name).cloned();
            match cached {
                Some(t) => t,
                None => {
                    self.ensure_loaded()?;
                    self.templates
                        .read()
                        .get(name)
                        .cloned()
                        .ok_or_else(|| RenderError::TemplateNotFound(name.to_string()))?
                }
            }
        };

        let funcs = self.build_funcs();
        let data = Value::from(ctx.data.clone());
        match exec::execute(&template.program, &data, &funcs, ctx.deadline) {
            Ok(out) => Ok(out),
            Err(ExecError::Cancelled(_)) => {
                Err(RenderError::Cancelled(name.to_string()))
            }
            Err(ExecError::Eval(e)) => Err(RenderError::Exec {
                template: name.to_string(),
                message: e.message,
                source_dump: numbered_source(&template.itl),
            }),
        }
    }

    fn compile_file(
        &self,
        path: &Path,
        name: &str,
        funcs: &HashSet<String>,
    ) -> Result<CompiledTemplate, CompileError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CompileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root = ast::parse_ast(&raw).map_err(|source| CompileError::Ast {
            path: path.to_path_buf(),
            source,
        })?;

        let lowered =
            lower::lower(&root, funcs, self.opts.debug).map_err(|e| {
                CompileError::Expression {
                    template: name.to_string(),
                    message: e.to_string(),
                }
            })?;
        let program = itl::parse(&lowered.itl).map_err(|e| CompileError::Parse {
            template: name.to_string(),
            message: e.message,
            source_dump: numbered_source(&lowered.itl),
        })?;

        // checked only once the program parses, so a broken template
        // reports its parse failure first
        for mixin in &lowered.unresolved_mixins {
            if self.opts.debug {
                return Err(CompileError::UnresolvedMixin {
                    template: name.to_string(),
                    name: mixin.clone(),
                });
            }
            warn!(template = %name, mixin = %mixin, "mixin called but not found");
        }

        Ok(CompiledTemplate {
            itl: lowered.itl,
            program,
        })
    }

    fn load_manifest(&self) -> Result<(), CompileError> {
        let path = self.opts.basedir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| CompileError::Io {
            path: path.clone(),
            source,
        })?;
        let manifest: HashMap<String, String> =
            serde_json::from_str(&raw).map_err(|source| CompileError::Ast {
                path,
                source,
            })?;
        *self.assets.write() = manifest;
        Ok(())
    }

    /// Names visible to the expression compiler: everything callable
    /// without a `$` prefix.
    fn function_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = ops::builtins().keys().cloned().collect();
        names.insert("asset".to_string());
        names.extend(self.hosts.read().keys().cloned());
        names
    }

    /// Runtime table for one render: builtins, the asset resolver,
    /// then host functions.
    fn build_funcs(&self) -> HashMap<String, Value> {
        let mut funcs = ops::builtins();
        let assets = self.assets.read().clone();
        funcs.insert(
            "asset".to_string(),
            Value::func(move |args| {
                let name = args
                    .first()
                    .map(Value::display_string)
                    .unwrap_or_default();
                Ok(Value::str(
                    assets.get(&name).cloned().unwrap_or(name),
                ))
            }),
        );
        for (name, f) in self.hosts.read().iter() {
            let f = f.clone();
            funcs.insert(name.clone(), Value::func(move |args| f(args)));
        }
        funcs
    }
}

fn collect_ast_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), CompileError> {
    let entries = std::fs::read_dir(dir).map_err(|source| CompileError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| CompileError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_ast_files(&path, out)?;
        } else if path.to_string_lossy().ends_with(AST_SUFFIX) {
            out.push(path);
        }
    }
    out.sort();
    Ok(())
}

fn template_name(basedir: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(basedir).unwrap_or(path);
    let rel = rel.to_string_lossy().replace('\\', "/");
    rel.trim_end_matches(AST_SUFFIX).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_template(dir: &Path, name: &str, ast: serde_json::Value) {
        let path = dir.join(format!("{name}{AST_SUFFIX}"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, serde_json::to_vec(&ast).expect("json")).expect("write");
    }

    fn page_ast() -> serde_json::Value {
        json!({
            "type": "Tag",
            "name": "p",
            "block": {"type": "Block", "nodes": [
                {"type": "Code", "val": "title", "buffer": true, "mustEscape": true}
            ]}
        })
    }

    #[tokio::test]
    async fn loads_and_renders() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(dir.path(), "page", page_ast());

        let engine = Engine::new(EngineOptions::new(dir.path()));
        engine.load_templates(None).expect("load");
        let out = engine
            .render("page", &RenderContext::new(json!({"title": "<hi>"})))
            .await
            .expect("render");
        assert_eq!(out, "<p>&lt;hi&gt;</p>");
    }

    #[tokio::test]
    async fn first_render_compiles_lazily() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(dir.path(), "page", page_ast());

        let engine = Engine::new(EngineOptions::new(dir.path()));
        let out = engine
            .render("page", &RenderContext::new(json!({"title": "x"})))
            .await
            .expect("render");
        assert_eq!(out, "<p>x</p>");

        // the implicit load ran once; a later miss does not rescan the
        // directory, so this broken file is never read
        std::fs::write(dir.path().join("ghost.ast.json"), "not json").expect("write");
        let err = engine
            .render("ghost", &RenderContext::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, RenderError::TemplateNotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn concurrent_loads_serialize() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(dir.path(), "page", page_ast());

        let engine = Arc::new(Engine::new(EngineOptions::new(dir.path())));
        let a = {
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || engine.load_templates(None))
        };
        let b = {
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || engine.load_templates(None))
        };
        a.await.expect("join").expect("load");
        b.await.expect("join").expect("load");

        let out = engine
            .render("page", &RenderContext::new(json!({"title": "x"})))
            .await
            .expect("render");
        assert_eq!(out, "<p>x</p>");
    }

    #[tokio::test]
    async fn missing_template_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(EngineOptions::new(dir.path()));
        engine.load_templates(None).expect("load");
        let err = engine
            .render("ghost", &RenderContext::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, RenderError::TemplateNotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn load_filter_limits_scope() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(dir.path(), "shop/list", page_ast());
        write_template(dir.path(), "checkout/cart", page_ast());

        let engine = Engine::new(EngineOptions::new(dir.path()));
        engine.load_templates(Some("shop/")).expect("load");
        assert!(engine.template_source("shop/list").is_some());
        assert!(engine.template_source("checkout/cart").is_none());
    }

    #[tokio::test]
    async fn render_partials_resolves_subdirectory() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(dir.path(), "page.partial/header", page_ast());

        let engine = Engine::new(EngineOptions::new(dir.path()));
        engine.load_templates(None).expect("load");
        let out = engine
            .render_partials(
                "page",
                &["header".to_string()],
                &RenderContext::new(json!({"title": "x"})),
            )
            .await
            .expect("render");
        assert_eq!(out["header"], "<p>x</p>");
    }

    #[tokio::test]
    async fn asset_manifest_resolves() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_vec(&json!({"app.js": "app.59f12a.js"})).expect("json"),
        )
        .expect("write");
        write_template(
            dir.path(),
            "page",
            json!({
                "type": "Code", "val": "asset('app.js')",
                "buffer": true, "mustEscape": true
            }),
        );

        let engine = Engine::new(EngineOptions::new(dir.path()));
        engine.load_templates(None).expect("load");
        assert_eq!(engine.asset("app.js"), "app.59f12a.js");
        assert_eq!(engine.asset("other.js"), "other.js");
        let out = engine
            .render("page", &RenderContext::default())
            .await
            .expect("render");
        assert_eq!(out, "app.59f12a.js");
    }

    #[tokio::test]
    async fn host_function_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(
            dir.path(),
            "page",
            json!({
                "type": "Code", "val": "shout('hey')",
                "buffer": true, "mustEscape": true
            }),
        );

        let engine = Engine::new(EngineOptions::new(dir.path()));
        engine.register_func("shout", |args| {
            let s = args.first().map(Value::display_string).unwrap_or_default();
            Ok(Value::str(s.to_uppercase()))
        });
        engine.load_templates(None).expect("load");
        let out = engine
            .render("page", &RenderContext::default())
            .await
            .expect("render");
        assert_eq!(out, "HEY");
    }

    #[tokio::test]
    async fn expired_deadline_cancels() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(dir.path(), "page", page_ast());

        let engine = Engine::new(EngineOptions::new(dir.path()));
        engine.load_templates(None).expect("load");
        let ctx = RenderContext::new(json!({"title": "x"}))
            .with_deadline(Duration::from_secs(0));
        let err = engine.render("page", &ctx).await.expect_err("must cancel");
        assert!(matches!(err, RenderError::Cancelled(_)));
    }

    #[tokio::test]
    async fn render_limit_still_renders() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(dir.path(), "page", page_ast());

        let opts = EngineOptions::new(dir.path()).with_render_limit(1);
        let engine = Engine::new(opts);
        engine.load_templates(None).expect("load");
        for _ in 0..3 {
            let out = engine
                .render("page", &RenderContext::new(json!({"title": "x"})))
                .await
                .expect("render");
            assert_eq!(out, "<p>x</p>");
        }
    }

    #[tokio::test]
    async fn debug_mode_recompiles_each_render() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(dir.path(), "page", page_ast());

        let engine = Engine::new(EngineOptions::new(dir.path()).with_debug(true));
        engine.load_templates(None).expect("load");
        let ctx = RenderContext::new(json!({"title": "a"}));
        assert_eq!(engine.render("page", &ctx).await.expect("render"), "<p>a</p>");

        write_template(
            dir.path(),
            "page",
            json!({
                "type": "Code", "val": "title", "buffer": true, "mustEscape": true
            }),
        );
        assert_eq!(engine.render("page", &ctx).await.expect("render"), "a");
    }

    #[tokio::test]
    async fn unresolved_mixin_fatal_in_debug_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ast = json!({
            "type": "Mixin", "name": "ghost", "call": true, "args": ""
        });
        write_template(dir.path(), "page", ast);

        let engine = Engine::new(EngineOptions::new(dir.path()));
        engine.load_templates(None).expect("production load tolerates it");

        let engine = Engine::new(EngineOptions::new(dir.path()).with_debug(true));
        let err = engine.load_templates(None).expect_err("debug load fails");
        assert!(matches!(err, CompileError::UnresolvedMixin { .. }));
    }

    #[tokio::test]
    async fn parse_failure_wins_over_unresolved_mixin() {
        let dir = tempfile::tempdir().expect("tempdir");
        // the iteration variable with a space survives lowering but
        // fails the program parse
        let ast = json!({"type": "Block", "nodes": [
            {"type": "Each", "obj": "items", "val": "my var", "key": null,
             "block": {"type": "Block", "nodes": []}},
            {"type": "Mixin", "name": "ghost", "call": true, "args": ""}
        ]});
        write_template(dir.path(), "page", ast);

        let engine = Engine::new(EngineOptions::new(dir.path()).with_debug(true));
        let err = engine.load_templates(None).expect_err("must fail");
        assert!(matches!(err, CompileError::Parse { .. }));
    }

    #[tokio::test]
    async fn exec_error_carries_numbered_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(
            dir.path(),
            "page",
            json!({
                "type": "Code", "val": "1 % 0", "buffer": true, "mustEscape": true
            }),
        );

        let engine = Engine::new(EngineOptions::new(dir.path()));
        engine.load_templates(None).expect("load");
        let err = engine
            .render("page", &RenderContext::default())
            .await
            .expect_err("must fail");
        let RenderError::Exec {
            message,
            source_dump,
            ..
        } = err
        else {
            panic!("expected exec error, got {err:?}");
        };
        assert_eq!(message, "integer divide by zero");
        assert!(source_dump.starts_with("001: "));
    }
}
