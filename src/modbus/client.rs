//! Modbus TCP client context
//!
//! Wraps the `tokio-modbus` context so every request is bounded by a
//! per-request timeout and folds exceptions into [`TransportError`].

use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::prelude::*;

use crate::error::TransportError;

pub struct Context {
    inner: tokio_modbus::client::Context,
    request_timeout: Duration,
}

impl Context {
    pub fn new(inner: tokio_modbus::client::Context, request_timeout: Duration) -> Self {
        Self {
            inner,
            request_timeout,
        }
    }

    pub async fn read_holding_registers(
        &mut self,
        addr: u16,
        cnt: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let limit = self.request_timeout;
        let result = timeout(limit, self.inner.read_holding_registers(addr, cnt))
            .await
            .map_err(|_| elapsed(limit))??;
        result.map_err(TransportError::Exception)
    }

    pub async fn write_multiple_registers(
        &mut self,
        addr: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let limit = self.request_timeout;
        let result = timeout(limit, self.inner.write_multiple_registers(addr, values))
            .await
            .map_err(|_| elapsed(limit))??;
        result.map_err(TransportError::Exception)
    }

    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.inner.disconnect().await?.map_err(TransportError::Exception)
    }
}

fn elapsed(limit: Duration) -> TransportError {
    TransportError::RequestTimeout(limit.as_millis() as u64)
}
