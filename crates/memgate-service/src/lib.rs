//! # memgate-service
//!
//! The privileged half of memgate: a control service that answers buffered
//! control requests from a single attached client.
//!
//! - [`ControlService::device_control`] verifies buffer sizes and dispatches
//!   each [`ControlCode`](memgate_proto::ControlCode)
//! - [`Notifier`] feeds process and image events into a lock-free queue
//! - [`regions::enumerate`] walks a target address space
//! - [`copy::copy`] moves bytes between the caller and a target process
//!
//! All OS access goes through the [`Host`] trait. [`SimulatedHost`] backs
//! tests; `WindowsHost` serves an in-process caller on Windows.

pub mod attachment;
pub mod copy;
pub mod events;
pub mod host;
pub mod input;
pub mod regions;
pub mod service;
pub mod sim;

#[cfg(target_os = "windows")]
pub mod windows_host;

pub use attachment::Attachment;
pub use events::{EventQueue, Notifier};
pub use host::{
    AddressSpace, CopyDirection, CopyOutcome, Host, MemoryBasicInformation, ProcessToken,
    ProcessorMode,
};
pub use input::{InputSink, MouseState};
pub use regions::RegionFilter;
pub use service::{ControlService, ControlServiceBuilder, IoRequest, IoStatus};
pub use sim::{SimRegion, SimulatedHost};

#[cfg(target_os = "windows")]
pub use windows_host::WindowsHost;
