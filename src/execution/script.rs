//! Embedded-script execution capability.

use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::packages::{
    ArithmeticPackage, BasicArrayPackage, BasicIteratorPackage, BasicMapPackage,
    BasicMathPackage, BasicStringPackage, LogicPackage, MoreStringPackage, Package,
};
use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use tracing::debug;

use super::{Callable, DEFAULT_ENTRY_POINT, ExecutionCapability};
use crate::config::ScriptConfig;
use crate::error::ExecutionError;

/// How often (in operations) the deadline is checked.
const DEADLINE_CHECK_INTERVAL: u64 = 256;

/// Built-in keywords that evaluate code or inspect the script's own functions, variables
/// and types. None of them belongs to a [`Primitive`], so they are always disabled.
const INTROSPECTION_KEYWORDS: &[&str] = &[
    "eval",
    "type_of",
    "is_def_fn",
    "is_def_var",
    "is_shared",
    "Fn",
    "call",
    "curry",
];

/// A family of primitives a script may use. Anything not listed is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Arithmetic,
    Logic,
    Strings,
    Arrays,
    Maps,
    Math,
    Iteration,
}

impl Primitive {
    pub const ALL: &'static [Primitive] = &[
        Primitive::Arithmetic,
        Primitive::Logic,
        Primitive::Strings,
        Primitive::Arrays,
        Primitive::Maps,
        Primitive::Math,
        Primitive::Iteration,
    ];

    fn register(self, engine: &mut Engine) {
        match self {
            Primitive::Arithmetic => {
                engine.register_global_module(ArithmeticPackage::new().as_shared_module());
            }
            Primitive::Logic => {
                engine.register_global_module(LogicPackage::new().as_shared_module());
            }
            Primitive::Strings => {
                engine.register_global_module(BasicStringPackage::new().as_shared_module());
                engine.register_global_module(MoreStringPackage::new().as_shared_module());
            }
            Primitive::Arrays => {
                engine.register_global_module(BasicArrayPackage::new().as_shared_module());
            }
            Primitive::Maps => {
                engine.register_global_module(BasicMapPackage::new().as_shared_module());
            }
            Primitive::Math => {
                engine.register_global_module(BasicMathPackage::new().as_shared_module());
            }
            Primitive::Iteration => {
                engine.register_global_module(BasicIteratorPackage::new().as_shared_module());
            }
        }
    }
}

thread_local! {
    /// Deadline of the script call running on this thread, if any.
    static CALL_DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Arms the thread's call deadline and restores the previous one on drop.
struct DeadlineGuard {
    previous: Option<Instant>,
}

impl DeadlineGuard {
    fn arm(limit: Duration) -> Self {
        let previous = CALL_DEADLINE.with(|d| d.replace(Some(Instant::now() + limit)));
        Self { previous }
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        CALL_DEADLINE.with(|d| d.set(self.previous));
    }
}

fn deadline_passed() -> bool {
    CALL_DEADLINE.with(|d| d.get().is_some_and(|at| Instant::now() >= at))
}

/// Script sandbox built on a raw `rhai` engine.
///
/// The engine starts with no packages; only the configured [`Primitive`]s are loaded.
/// Module imports, `eval` and the introspection keywords are unavailable. Every prepare and call is bounded by an
/// operation budget, depth and size limits, and a wall-clock deadline.
pub struct ScriptSandbox {
    engine: Arc<Engine>,
    deadline: Duration,
    max_operations: u64,
}

impl ScriptSandbox {
    /// Sandbox with every [`Primitive`] allowed.
    pub fn new(config: &ScriptConfig) -> Self {
        Self::with_primitives(config, Primitive::ALL)
    }

    pub fn with_primitives(config: &ScriptConfig, primitives: &[Primitive]) -> Self {
        let mut engine = Engine::new_raw();
        for primitive in primitives {
            primitive.register(&mut engine);
        }

        engine.set_module_resolver(DummyModuleResolver::new());
        for keyword in INTROSPECTION_KEYWORDS {
            engine.disable_symbol(*keyword);
        }

        engine.set_max_operations(config.max_operations);
        engine.set_max_call_levels(config.max_call_levels);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_string_size(config.max_string_size);
        engine.set_max_array_size(config.max_array_size);
        engine.set_max_map_size(config.max_map_size);

        engine.on_print(|text| debug!(target: "script", "{}", text));
        engine.on_debug(|text, source, pos| {
            debug!(target: "script", source = source.unwrap_or(""), position = %pos, "{}", text)
        });
        engine.on_progress(|ops| {
            if ops % DEADLINE_CHECK_INTERVAL == 0 && deadline_passed() {
                Some(Dynamic::from("deadline exceeded"))
            } else {
                None
            }
        });

        Self {
            engine: Arc::new(engine),
            deadline: config.deadline,
            max_operations: config.max_operations,
        }
    }
}

fn map_eval_error(err: EvalAltResult, deadline: Duration, max_operations: u64) -> ExecutionError {
    match err {
        EvalAltResult::ErrorTerminated(..) => ExecutionError::DeadlineExceeded(deadline),
        EvalAltResult::ErrorTooManyOperations(pos) => ExecutionError::Runtime(format!(
            "operation budget of {max_operations} exhausted ({pos})"
        )),
        other => ExecutionError::Runtime(other.to_string()),
    }
}

/// Find a callable script function named `name` taking zero or one parameter.
/// Returns its arity, preferring the one-parameter form.
fn resolve(ast: &AST, name: &str) -> Option<usize> {
    ast.iter_functions()
        .filter(|f| f.name == name && f.params.len() <= 1)
        .map(|f| f.params.len())
        .max()
}

impl ExecutionCapability for ScriptSandbox {
    fn prepare(
        &self,
        source: &str,
        entry_point: Option<&str>,
    ) -> Result<Arc<dyn Callable>, ExecutionError> {
        let _deadline = DeadlineGuard::arm(self.deadline);

        let ast = self
            .engine
            .compile(source)
            .map_err(|e| ExecutionError::Compilation(e.to_string()))?;

        // Top-level statements run once, like a module body. Limits trip the same way
        // they do in a call; anything else means the source cannot be loaded.
        self.engine.run_ast(&ast).map_err(|e| match *e {
            err @ (EvalAltResult::ErrorTerminated(..)
            | EvalAltResult::ErrorTooManyOperations(..)) => {
                map_eval_error(err, self.deadline, self.max_operations)
            }
            other => ExecutionError::Compilation(other.to_string()),
        })?;

        let requested = entry_point
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_ENTRY_POINT);

        let (name, arity) = match resolve(&ast, requested) {
            Some(arity) => (requested, arity),
            None => match resolve(&ast, DEFAULT_ENTRY_POINT) {
                Some(arity) => {
                    debug!(requested = %requested, "Entry point missing, using main");
                    (DEFAULT_ENTRY_POINT, arity)
                }
                None => {
                    return Err(ExecutionError::EntryPointNotFound {
                        requested: requested.to_string(),
                        fallback: DEFAULT_ENTRY_POINT.to_string(),
                    });
                }
            },
        };

        Ok(Arc::new(ScriptFunction {
            engine: Arc::clone(&self.engine),
            ast: Arc::new(ast),
            name: name.to_string(),
            arity,
            deadline: self.deadline,
            max_operations: self.max_operations,
        }))
    }
}

/// A resolved script function.
struct ScriptFunction {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    name: String,
    arity: usize,
    deadline: Duration,
    max_operations: u64,
}

impl Callable for ScriptFunction {
    fn entry_point(&self) -> &str {
        &self.name
    }

    fn call(&self, input: &Value) -> Result<Value, ExecutionError> {
        let _deadline = DeadlineGuard::arm(self.deadline);
        let mut scope = Scope::new();
        // Top-level statements already ran in prepare.
        let options = CallFnOptions::new().eval_ast(false);

        let output: Result<Dynamic, Box<EvalAltResult>> = if self.arity == 0 {
            self.engine
                .call_fn_with_options(options, &mut scope, &self.ast, &self.name, ())
        } else {
            let arg = rhai::serde::to_dynamic(input)
                .map_err(|e| ExecutionError::Conversion(e.to_string()))?;
            self.engine
                .call_fn_with_options(options, &mut scope, &self.ast, &self.name, (arg,))
        };

        let output =
            output.map_err(|e| map_eval_error(*e, self.deadline, self.max_operations))?;

        rhai::serde::from_dynamic::<Value>(&output)
            .map_err(|e| ExecutionError::Conversion(e.to_string()))
    }
}
