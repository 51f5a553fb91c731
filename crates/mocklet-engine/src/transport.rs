//! Transport seam: converts between a server framework's native types and
//! the engine's exchange.

use crate::dispatch::Dispatcher;
use crate::exchange::{Exchange, HttpRequest};
use std::sync::Arc;

/// Implemented once per embedding server framework. The engine never sees
/// the native types; adapters translate at the boundary.
pub trait TransportAdapter: Send + Sync {
    type NativeRequest;
    type NativeResponse;

    /// Translate an inbound native request into an engine request.
    fn read_request(&self, native: Self::NativeRequest) -> anyhow::Result<HttpRequest>;

    /// Translate a completed exchange into a native response. Called only
    /// once the exchange has been dispatched; a closed-connection exchange
    /// is the adapter's to represent however its framework allows.
    fn write_response(&self, exchange: Exchange) -> anyhow::Result<Self::NativeResponse>;
}

/// Drive one native request through the dispatcher and back out through the
/// adapter.
pub async fn serve<A: TransportAdapter>(
    adapter: &A,
    dispatcher: &Arc<Dispatcher>,
    native: A::NativeRequest,
) -> anyhow::Result<A::NativeResponse> {
    let request = adapter.read_request(native)?;
    let exchange = dispatcher.handle(Exchange::new(request)).await;
    adapter.write_response(exchange)
}
