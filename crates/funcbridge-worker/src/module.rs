//! The engine seam: loaded user modules as an opaque export mapping.
//!
//! The script engine that parses and runs user code is an external
//! collaborator. What the bridge sees of it is a [`Module`]: a mapping of
//! export name → [`Export`], where callables have already been wrapped as
//! [`Handler`] values by the engine adapter. The [`ModuleLoader`] trait is
//! the single entry point an engine integration has to implement.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_core::Stream;

use crate::adapter::{GuestRequest, Invocation};

/// A failure raised by user handler code: message plus optional stack.
#[derive(Debug, Clone)]
pub struct HandlerFault {
    pub message: String,
    pub stack: Option<String>,
}

impl HandlerFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerFault {}

/// A handler-produced body stream, type-erased.
pub type BodyChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, HandlerFault>> + Send>>;

/// The body of a handler's returned response.
pub enum Body {
    Empty,
    Bytes(Bytes),
    Stream(BodyChunkStream),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Self::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

/// The response shape a handler hands back under the return-value calling
/// convention. Every field is optional; the adapter fills in the defaults
/// (`200` / `{}` / empty).
#[derive(Debug, Default)]
pub struct ResponseValue {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Default for Body {
    fn default() -> Self {
        Self::Empty
    }
}

impl ResponseValue {
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    pub fn with_body_stream(mut self, stream: BodyChunkStream) -> Self {
        self.body = Body::Stream(stream);
        self
    }
}

/// What a handler invocation produced.
///
/// Two calling conventions are valid: the handler returns a
/// [`ResponseValue`], or it announces the response itself through
/// [`Invocation::set_response`] and returns [`ReturnValue::Announced`].
/// A handler that returns something that is not a response object shows up
/// as [`ReturnValue::Malformed`] carrying a type name for the diagnostic.
#[derive(Debug)]
pub enum ReturnValue {
    Response(ResponseValue),
    Announced,
    Malformed(String),
}

/// Boxed future returned by handler calls.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<ReturnValue, HandlerFault>> + Send>>;

/// A callable export that serves requests.
pub trait Handler: Send + Sync {
    fn call(&self, request: GuestRequest, invocation: Invocation) -> HandlerFuture;
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(GuestRequest, Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ReturnValue, HandlerFault>> + Send + 'static,
{
    struct FnHandler<F>(F);

    impl<F, Fut> Handler for FnHandler<F>
    where
        F: Fn(GuestRequest, Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReturnValue, HandlerFault>> + Send + 'static,
    {
        fn call(&self, request: GuestRequest, invocation: Invocation) -> HandlerFuture {
            Box::pin((self.0)(request, invocation))
        }
    }

    Arc::new(FnHandler(f))
}

/// One export of a loaded module, as the engine adapter reports it.
pub enum Export {
    /// A directly callable export.
    Function(Arc<dyn Handler>),
    /// An object export; only its callable members are represented.
    Object(HashMap<String, Arc<dyn Handler>>),
    /// Any non-callable export. Present so resolution can skip it rather
    /// than mistake it for a handler.
    Value,
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Export::Function"),
            Self::Object(members) => {
                let mut names: Vec<_> = members.keys().collect();
                names.sort();
                write!(f, "Export::Object({names:?})")
            }
            Self::Value => f.write_str("Export::Value"),
        }
    }
}

/// A loaded user module: an opaque mapping of export name → value.
#[derive(Debug, Default)]
pub struct Module {
    exports: HashMap<String, Export>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_export(mut self, name: impl Into<String>, export: Export) -> Self {
        self.exports.insert(name.into(), export);
        self
    }

    pub fn with_function(self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.with_export(name, Export::Function(handler))
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(String::as_str)
    }
}

/// Boxed future returned by [`ModuleLoader::load`].
pub type LoadFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<Module>> + Send + 'a>>;

/// The engine integration point: load (parse, compile, evaluate) the user
/// script at `path` and report its exports.
///
/// A load failure is a startup error for the worker — it is reported on
/// the control channel and the process exits non-zero.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> LoadFuture<'_>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_exports_are_inspectable() {
        let module = Module::new()
            .with_function(
                "fetch",
                handler_fn(|_req, _inv| async { Ok(ReturnValue::Announced) }),
            )
            .with_export("version", Export::Value);

        assert!(matches!(module.get("fetch"), Some(Export::Function(_))));
        assert!(matches!(module.get("version"), Some(Export::Value)));
        assert!(module.get("missing").is_none());
    }

    #[test]
    fn response_value_builder() {
        let value = ResponseValue::default()
            .with_status(201)
            .with_header("Content-Type", "text/plain")
            .with_body("created");
        assert_eq!(value.status, Some(201));
        assert_eq!(value.headers.len(), 1);
        assert!(matches!(value.body, Body::Bytes(ref b) if b.as_ref() == b"created"));
    }
}
