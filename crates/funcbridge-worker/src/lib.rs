//! funcbridge-worker — the guest-side half of the execution bridge.
//!
//! A worker process embeds a script engine (an external collaborator,
//! reached through the [`ModuleLoader`] seam), loads exactly one user
//! module, resolves its serving callable once, and then turns request
//! channels into responses while reporting its lifecycle over the control
//! channel.
//!
//! # Architecture
//!
//! ```text
//! WorkerRuntime (composition root, top-level error boundary)
//!   ├── ControlWriter            started / ready / error
//!   ├── ModuleLoader (seam)  ──▶ Module ──▶ resolve() ──▶ ResolvedHandler
//!   └── per request: serve_request()
//!         ├── GuestRequest (metadata + lazy body stream)
//!         ├── Invocation   (request id, set-response, abort, upgrade)
//!         └── finalize: defaults, 500 containment, chunked drain
//! ```

pub mod adapter;
pub mod error;
pub mod module;
pub mod resolver;
pub mod runtime;

pub use adapter::{serve_request, GuestRequest, Invocation, UpgradeHandle};
pub use error::BridgeError;
pub use module::{
    handler_fn, Body, BodyChunkStream, Export, Handler, HandlerFault, HandlerFuture, LoadFuture,
    Module, ModuleLoader, ResponseValue, ReturnValue,
};
pub use resolver::{resolve, ExportShape, ResolvedHandler};
pub use runtime::{RunMode, WorkerOptions, WorkerRuntime};
