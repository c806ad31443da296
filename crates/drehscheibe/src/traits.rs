use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DrehscheibeError;
use crate::protocol::ServiceResponse;

/// Handles one request on behalf of a worker's advertised service.
///
/// The worker passes the raw serialized request body and expects either a
/// serialized response body or an error to wrap into a failure response.
/// No time limit is imposed; handlers run on their own task and must not
/// block the worker's socket loop.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, DrehscheibeError>;
}

/// Blanket implementation so `Arc<dyn RequestHandler>` can be used directly.
#[async_trait]
impl<T: RequestHandler + ?Sized> RequestHandler for Arc<T> {
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, DrehscheibeError> {
        (**self).handle(request).await
    }
}

/// Upcall invoked by the broker when a hub worker answers the registration
/// handshake with a device list.
///
/// Registered via [`Broker::set_device_list_hook`](crate::broker::Broker::set_device_list_hook);
/// the broker holds a non-owning reference and never retries delivery.
#[async_trait]
pub trait DeviceListHook: Send + Sync {
    async fn on_device_list(&self, response: ServiceResponse);
}
