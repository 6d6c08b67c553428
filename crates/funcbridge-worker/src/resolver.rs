//! Handler resolution.
//!
//! Given a loaded module, select exactly one callable to serve requests.
//! Resolution runs once at module-load time and produces a single
//! [`ResolvedHandler`]; export shapes are never re-checked per request.
//!
//! Precedence, stopping at the first match:
//!
//! 1. a named export called `fetch`
//! 2. a named export called `handler`
//! 3. a `default` object export with a `fetch` (then `handler`) callable
//! 4. a directly callable `default` export
//!
//! Explicit named exports are unambiguous; the `default`-object shapes
//! accommodate router objects; a bare default function is the minimal
//! fallback. Non-callable exports under any of these names are skipped.

use std::fmt;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::module::{Export, Handler, Module};

/// Which export shape resolution matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportShape {
    NamedFetch,
    NamedHandler,
    DefaultFetch,
    DefaultHandler,
    DefaultFunction,
}

/// The single serving target selected from a module.
#[derive(Clone)]
pub struct ResolvedHandler {
    handler: Arc<dyn Handler>,
    shape: ExportShape,
}

impl ResolvedHandler {
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn shape(&self) -> ExportShape {
        self.shape
    }
}

// The handler itself is an opaque trait object; the shape is the only
// thing worth printing.
impl fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

/// Select the serving callable, or fail with a fatal startup error.
///
/// No valid serving target means the worker cannot serve anything — this
/// is reported on the control channel, never converted to a per-request
/// 500.
pub fn resolve(module: &Module) -> Result<ResolvedHandler, BridgeError> {
    if let Some(Export::Function(handler)) = module.get("fetch") {
        return Ok(found(handler, ExportShape::NamedFetch));
    }
    if let Some(Export::Function(handler)) = module.get("handler") {
        return Ok(found(handler, ExportShape::NamedHandler));
    }
    match module.get("default") {
        Some(Export::Object(members)) => {
            if let Some(handler) = members.get("fetch") {
                return Ok(found(handler, ExportShape::DefaultFetch));
            }
            if let Some(handler) = members.get("handler") {
                return Ok(found(handler, ExportShape::DefaultHandler));
            }
        }
        Some(Export::Function(handler)) => {
            return Ok(found(handler, ExportShape::DefaultFunction));
        }
        _ => {}
    }
    Err(BridgeError::Startup(
        "handler not found: module must export `fetch`, `handler`, \
         a default object with one of those, or a callable default"
            .into(),
    ))
}

fn found(handler: &Arc<dyn Handler>, shape: ExportShape) -> ResolvedHandler {
    tracing::debug!(?shape, "handler resolved");
    ResolvedHandler {
        handler: Arc::clone(handler),
        shape,
    }
}
