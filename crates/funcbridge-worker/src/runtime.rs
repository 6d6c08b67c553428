//! Worker runtime — the guest-side composition root.
//!
//! Wires the control-channel client, the module loader, handler
//! resolution, and the per-request adapter into one lifecycle:
//!
//! ```text
//! connect control ─▶ started ─▶ load module ─▶ resolve handler
//!        ─▶ ready ─▶ serve request cycles ─▶ exit
//! ```
//!
//! Two error boundaries, kept structurally distinct so they can never be
//! conflated: the adapter's per-request boundary (handler failures become
//! 500s, the worker keeps serving) and the top-level boundary here (any
//! failure escaping the serve loop is funneled through one
//! report-fatal-and-terminate path that writes an `error` control message
//! and returns non-zero).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use funcbridge_proto::{ControlMessage, ControlWriter};
use funcbridge_stream::RequestChannel;

use crate::adapter::serve_request;
use crate::error::BridgeError;
use crate::module::ModuleLoader;
use crate::resolver::{resolve, ResolvedHandler};

/// How many request-response cycles one process lifetime drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Serve exactly one request, then exit cleanly.
    OneShot,
    /// Serve requests until the request source closes. `ready` carries
    /// the bound port when the deployment provides one.
    Server { port: Option<u16> },
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Path of the user script/module to load.
    pub script: PathBuf,
    pub mode: RunMode,
    /// Wall-clock bound on a single handler invocation.
    pub handler_timeout: Duration,
}

impl WorkerOptions {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            mode: RunMode::OneShot,
            handler_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }
}

/// The guest-side bridge runtime.
pub struct WorkerRuntime<L> {
    loader: L,
    options: WorkerOptions,
}

impl<L: ModuleLoader> WorkerRuntime<L> {
    pub fn new(loader: L, options: WorkerOptions) -> Self {
        Self { loader, options }
    }

    /// Run the worker lifecycle to completion.
    ///
    /// `control` is the write half of the control transport; `requests`
    /// delivers one [`RequestChannel`] per inbound request. An `Err`
    /// return means the process must exit non-zero; the fatal error has
    /// already been reported on the control channel by then.
    pub async fn run<C>(
        &self,
        control: C,
        requests: mpsc::Receiver<RequestChannel>,
    ) -> Result<(), BridgeError>
    where
        C: AsyncWrite + Unpin,
    {
        let mut control = ControlWriter::new(control);
        control.send(&ControlMessage::Started).await?;

        match self.serve(&mut control, requests).await {
            Ok(()) => {
                tracing::info!("worker finished cleanly");
                Ok(())
            }
            Err(err) => {
                report_fatal(&mut control, &err).await;
                Err(err)
            }
        }
    }

    async fn serve<C>(
        &self,
        control: &mut ControlWriter<C>,
        mut requests: mpsc::Receiver<RequestChannel>,
    ) -> Result<(), BridgeError>
    where
        C: AsyncWrite + Unpin,
    {
        let module = self
            .loader
            .load(&self.options.script)
            .await
            .map_err(|err| BridgeError::Startup(format!("module load failed: {err}")))?;
        let handler = Arc::new(resolve(&module)?);
        tracing::info!(script = %self.options.script.display(), shape = ?handler.shape(), "module loaded");

        let port = match self.options.mode {
            RunMode::OneShot => None,
            RunMode::Server { port } => port,
        };
        control.send(&ControlMessage::Ready { port }).await?;

        let mut inflight: JoinSet<Result<(), BridgeError>> = JoinSet::new();
        loop {
            tokio::select! {
                accepted = requests.recv() => match accepted {
                    Some(channel) => {
                        inflight.spawn(in_flight(Arc::clone(&handler), channel, self.options.handler_timeout));
                        if self.options.mode == RunMode::OneShot {
                            break;
                        }
                    }
                    None => break,
                },
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    settle(joined)?;
                }
            }
        }
        drop(requests);
        while let Some(joined) = inflight.join_next().await {
            settle(joined)?;
        }
        Ok(())
    }
}

async fn in_flight(
    handler: Arc<ResolvedHandler>,
    channel: RequestChannel,
    timeout: Duration,
) -> Result<(), BridgeError> {
    serve_request(&handler, channel, timeout, None).await
}

/// Classify one finished request cycle: request-scoped outcomes are
/// absorbed, worker-scoped failures propagate to the top-level boundary.
fn settle(
    joined: Result<Result<(), BridgeError>, tokio::task::JoinError>,
) -> Result<(), BridgeError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) if err.is_fatal() => Err(err),
        Ok(Err(BridgeError::Cancelled)) => {
            tracing::debug!("request cancelled by the host");
            Ok(())
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "request ended abnormally");
            Ok(())
        }
        // A panic escaping the per-request boundary is a bug in the
        // bridge, not in the handler.
        Err(join_err) => Err(BridgeError::Protocol(format!(
            "request task panicked: {join_err}"
        ))),
    }
}

/// The single report-fatal path of the top-level boundary.
async fn report_fatal<C>(control: &mut ControlWriter<C>, err: &BridgeError)
where
    C: AsyncWrite + Unpin,
{
    tracing::error!(error = %err, "worker fatal error");
    let message = ControlMessage::Error {
        error: err.to_string(),
    };
    if let Err(send_err) = control.send(&message).await {
        tracing::warn!(error = %send_err, "could not report fatal error on the control channel");
    }
}
