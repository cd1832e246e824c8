//! The controller contract between connections and user code.
//!
//! A controller is the external collaborator that turns an exchange into a
//! populated response: `defer` returns a completion signal, and when that
//! signal resolves successfully the exchange's response has been fully
//! configured. An error on the signal routes the exchange down the
//! error-exchange path, where `defer_error` gets a say before the built-in
//! fallback takes over.

use std::future::Future;
use std::pin::Pin;

use crate::exchange::{generic_error_handler, ErrorExchange, Exchange};

/// A boxed completion signal: resolves once the response is configured.
pub type Completion = Pin<Box<dyn Future<Output = crate::Result<()>> + Send + 'static>>;

/// User code that handles exchanges.
///
/// One controller instance serves a whole connection; handler futures may
/// run on any scheduler, their effects cross back to the connection through
/// the response handle and the completion signal.
pub trait Controller: Send + Sync + 'static {
    /// Per-exchange user context, created before the handler runs.
    type Context: Send + Sync + 'static;

    /// Creates the context for a new exchange.
    fn create_context(&self) -> Self::Context;

    /// Handles one exchange. The returned signal resolving `Ok` means the
    /// response is configured and may be sent.
    fn defer(&self, exchange: Exchange<Self::Context>) -> Completion;

    /// Handles a failed exchange by configuring the error response.
    ///
    /// The default forwards to the built-in generic handler, which maps
    /// [`HttpError`](crate::HttpError) causes to their status and anything
    /// else to `500`.
    fn defer_error(&self, exchange: ErrorExchange<Self::Context>) -> Completion {
        let result = generic_error_handler(exchange.response(), exchange.error());
        Box::pin(futures_util::future::ready(result))
    }
}

/// Builds a [`Controller`] with no context from an async closure.
///
/// ```
/// use estuary::service::controller_fn;
///
/// let controller = controller_fn(|mut exchange| async move {
///     let path = exchange.request().headers().path().to_owned();
///     exchange.response().body().string(path);
///     Ok(())
/// });
/// # drop(controller);
/// ```
pub fn controller_fn<F, Fut>(f: F) -> ControllerFn<F>
where
    F: Fn(Exchange<()>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    ControllerFn { f }
}

/// A [`Controller`] backed by a closure, see [`controller_fn`].
#[derive(Debug, Clone, Copy)]
pub struct ControllerFn<F> {
    f: F,
}

impl<F, Fut> Controller for ControllerFn<F>
where
    F: Fn(Exchange<()>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    type Context = ();

    fn create_context(&self) -> Self::Context {}

    fn defer(&self, exchange: Exchange<Self::Context>) -> Completion {
        Box::pin((self.f)(exchange))
    }
}
