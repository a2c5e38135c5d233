//! Capabilities handed to a snippet: global bindings and `require` modules.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::Serialize;
use serde_json::{json, Value};

/// Host callback reachable from a snippet. Arguments and the result cross
/// the boundary as JSON; an `Err` is thrown inside the snippet.
pub type HostFunction = Arc<dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync>;

/// Names the sandbox installs itself.
const RESERVED: &[&str] = &[
    "console",
    "require",
    "setTimeout",
    "setInterval",
    "clearTimeout",
    "clearInterval",
    "queueMicrotask",
    "globalThis",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("invalid binding name: {0:?}")]
    InvalidBindingName(String),
    #[error("binding name is reserved by the sandbox: {0}")]
    ReservedName(String),
    #[error("module name must not be empty")]
    EmptyModuleName,
}

#[derive(Clone)]
pub enum Capability {
    Value(Value),
    Function(HostFunction),
    Object(BTreeMap<String, Capability>),
}

impl Capability {
    pub fn value(value: impl Into<Value>) -> Self {
        Capability::Value(value.into())
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        Capability::Function(Arc::new(f))
    }

    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Capability)>,
    {
        Capability::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Capability::Function(_) => f.write_str("Function(..)"),
            Capability::Object(entries) => f.debug_map().entries(entries.iter()).finish(),
        }
    }
}

/// Everything a snippet can reach besides the language built-ins. Built
/// fresh for every call and consumed by it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    bindings: BTreeMap<String, Capability>,
    modules: BTreeMap<String, Capability>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: &str, capability: Capability) -> Result<&mut Self, ContextError> {
        if !is_identifier(name) {
            return Err(ContextError::InvalidBindingName(name.to_string()));
        }
        if RESERVED.contains(&name) {
            return Err(ContextError::ReservedName(name.to_string()));
        }
        self.bindings.insert(name.to_string(), capability);
        Ok(self)
    }

    pub fn with_binding(mut self, name: &str, capability: Capability) -> Result<Self, ContextError> {
        self.bind(name, capability)?;
        Ok(self)
    }

    /// Registers a module for `require(name)`.
    pub fn register_module(&mut self, name: &str, capability: Capability) -> Result<&mut Self, ContextError> {
        if name.trim().is_empty() {
            return Err(ContextError::EmptyModuleName);
        }
        self.modules.insert(name.to_string(), capability);
        Ok(self)
    }

    pub fn with_module(mut self, name: &str, capability: Capability) -> Result<Self, ContextError> {
        self.register_module(name, capability)?;
        Ok(self)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Flattens the context into a JSON manifest for the sandbox prelude
    /// plus the host functions it refers to by index.
    pub(crate) fn install(&self) -> Result<Installed, serde_json::Error> {
        let mut functions = Vec::new();
        let manifest = Manifest {
            globals: shapes(&self.bindings, &mut functions),
            modules: shapes(&self.modules, &mut functions),
        };
        Ok(Installed { manifest: serde_json::to_string(&manifest)?, functions })
    }
}

pub(crate) struct Installed {
    pub manifest: String,
    pub functions: Vec<HostFunction>,
}

#[derive(Serialize)]
struct Manifest<'a> {
    globals: BTreeMap<&'a str, Shape<'a>>,
    modules: BTreeMap<&'a str, Shape<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Shape<'a> {
    Value { value: &'a Value },
    Function { id: usize },
    Object { entries: BTreeMap<&'a str, Shape<'a>> },
}

fn shapes<'a>(
    entries: &'a BTreeMap<String, Capability>,
    functions: &mut Vec<HostFunction>,
) -> BTreeMap<&'a str, Shape<'a>> {
    entries
        .iter()
        .map(|(name, capability)| (name.as_str(), shape(capability, functions)))
        .collect()
}

fn shape<'a>(capability: &'a Capability, functions: &mut Vec<HostFunction>) -> Shape<'a> {
    match capability {
        Capability::Value(value) => Shape::Value { value },
        Capability::Function(f) => {
            functions.push(Arc::clone(f));
            Shape::Function { id: functions.len() - 1 }
        }
        Capability::Object(entries) => Shape::Object { entries: shapes(entries, functions) },
    }
}

/// Invokes host function `id` with JSON-encoded arguments and returns a
/// JSON envelope: `{"ok": result}` or `{"error": message}`.
pub(crate) fn call_host(functions: &[HostFunction], id: usize, args: &str) -> String {
    let reply = match functions.get(id) {
        None => json!({ "error": format!("unknown host function #{id}") }),
        Some(f) => match serde_json::from_str::<Vec<Value>>(args) {
            Ok(args) => match f(args) {
                Ok(value) => json!({ "ok": value }),
                Err(message) => json!({ "error": message }),
            },
            Err(e) => json!({ "error": format!("invalid arguments: {e}") }),
        },
    };
    reply.to_string()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c == '$' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c == '$' || c.is_alphanumeric()) && !is_keyword(name)
}

fn is_keyword(name: &str) -> bool {
    matches!(
        name,
        "break" | "case" | "catch" | "class" | "const" | "continue" | "debugger" | "default"
            | "delete" | "do" | "else" | "export" | "extends" | "false" | "finally" | "for"
            | "function" | "if" | "import" | "in" | "instanceof" | "new" | "null" | "return"
            | "super" | "switch" | "this" | "throw" | "true" | "try" | "typeof" | "var"
            | "void" | "while" | "with" | "yield" | "let" | "static" | "enum" | "await"
    )
}
