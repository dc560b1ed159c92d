//! # memgate
//!
//! Client library for the memgate control service.
//!
//! - [`connect`] opens the control channel, loading the service on demand
//! - [`Device`] issues requests: attach, poll, read/write, region queries,
//!   input injection
//! - [`Scanner`] searches captured or live regions for a [`Signature`]
//! - [`ErrorCode`] folds Win32, HRESULT and NTSTATUS failures into one value
//!
//! The `local` feature adds `LocalChannel` and `LocalConnector`, which host
//! the control service inside the client process.
//!
//! ```no_run
//! use memgate::{Connector, Device, Signature};
//! # fn run(connector: &dyn Connector) -> memgate::Result<()> {
//! let device = Device::create(connector)?;
//! let signature: Signature = "48 8B ?? ?? 89".parse()?;
//! for address in device.scan(4242, &signature, 0)? {
//!     println!("{:#x}", address);
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod connect;
pub mod device;
pub mod error;
pub mod events;
pub mod list;
#[cfg(any(test, feature = "local"))]
pub mod local;
pub mod message;
pub mod scan;
pub mod signature;

pub use channel::Channel;
pub use connect::{CommandLoader, Connector, DriverLoader, NoLoader, connect};
pub use device::Device;
pub use error::{Error, ErrorCode, ErrorDomain, Result};
pub use events::Events;
pub use list::{EventList, RecordList, RecordRef, RegionList};
#[cfg(any(test, feature = "local"))]
pub use local::{LocalChannel, LocalConnector};
pub use scan::Scanner;
pub use signature::Signature;

#[cfg(target_os = "windows")]
pub use channel::DeviceChannel;
#[cfg(target_os = "windows")]
pub use connect::DeviceConnector;
