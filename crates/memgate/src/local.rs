//! In-process transport, for hosting the service inside the client process.
//!
//! Only built with the `local` feature; other clients reach the service
//! through the control device and never link it.

use std::sync::Arc;

use memgate_proto::ControlCode;
use memgate_service::{ControlService, Host, IoRequest};

use crate::channel::Channel;
use crate::connect::Connector;
use crate::error::Result;

/// Loops requests back into an in-process service.
pub struct LocalChannel<H: Host> {
    service: Arc<ControlService<H>>,
}

impl<H: Host> LocalChannel<H> {
    pub fn new(service: Arc<ControlService<H>>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &ControlService<H> {
        &self.service
    }
}

impl<H: Host> Channel for LocalChannel<H> {
    fn control(&self, code: ControlCode, buffer: &mut [u8]) -> Result<usize> {
        let completion = self
            .service
            .device_control(IoRequest::new(code.raw(), buffer));
        completion.status.ok()?;
        Ok(completion.information)
    }
}

/// Connects to a service running in this process.
pub struct LocalConnector<H: Host> {
    service: Arc<ControlService<H>>,
}

impl<H: Host> LocalConnector<H> {
    pub fn new(service: Arc<ControlService<H>>) -> Self {
        Self { service }
    }
}

impl<H: Host + 'static> Connector for LocalConnector<H> {
    fn open(&self) -> Result<Box<dyn Channel>> {
        Ok(Box::new(LocalChannel::new(Arc::clone(&self.service))))
    }
}
