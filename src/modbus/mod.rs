//! Modbus register transport
//!
//! The log retrieval core only needs two register-level operations from
//! the wire; they are captured by [`RegisterTransport`]. [`ModbusClient`]
//! provides them over Modbus TCP.

use anyhow::{Context as AnyhowContext, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::error::TransportError;

pub mod client;
pub mod registers;
pub mod sim;

/// Register-level operations against a single device unit
///
/// One value of this trait is one device session. Calls are issued
/// sequentially; the window protocol mutates device-side state, so a
/// session must never be shared between concurrent retrievals.
#[allow(async_fn_in_trait)]
pub trait RegisterTransport {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, TransportError>;

    async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> std::result::Result<(), TransportError>;
}

/// Connection parameters for one meter
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub request_timeout: Duration,
}

/// Modbus TCP client bound to one device unit
pub struct ModbusClient {
    device_id: String,
    addr: SocketAddr,
    context: Option<client::Context>,
}

impl ModbusClient {
    /// Open a TCP connection to the meter
    pub async fn connect(device_id: &str, endpoint: &Endpoint) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", endpoint.host, endpoint.port)
            .parse()
            .with_context(|| format!("Invalid TCP address {}:{}", endpoint.host, endpoint.port))?;

        info!(
            "Connecting to Modbus TCP: {} (unit {}) for device {}",
            addr, endpoint.unit_id, device_id
        );

        let ctx = tokio::time::timeout(
            endpoint.request_timeout,
            tcp::connect_slave(addr, Slave(endpoint.unit_id)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to {}", addr))?
        .with_context(|| format!("Failed to connect to {}", addr))?;

        Ok(Self {
            device_id: device_id.to_string(),
            addr,
            context: Some(client::Context::new(ctx, endpoint.request_timeout)),
        })
    }

    /// Close the connection; further requests fail with `NotConnected`
    pub async fn close(&mut self) {
        if let Some(mut ctx) = self.context.take() {
            if let Err(e) = ctx.disconnect().await {
                warn!("Error closing connection to {}: {}", self.addr, e);
            } else {
                debug!("Disconnected from {} ({})", self.addr, self.device_id);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    fn context(&mut self) -> std::result::Result<&mut client::Context, TransportError> {
        self.context.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl RegisterTransport for ModbusClient {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, TransportError> {
        debug!(
            "Reading {} holding registers from 0x{:04X} on device {}",
            count, address, self.device_id
        );
        self.context()?.read_holding_registers(address, count).await
    }

    async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> std::result::Result<(), TransportError> {
        self.context()?
            .write_multiple_registers(address, values)
            .await?;

        debug!(
            "Wrote {} registers starting at 0x{:04X} on device {}",
            values.len(),
            address,
            self.device_id
        );

        Ok(())
    }
}
