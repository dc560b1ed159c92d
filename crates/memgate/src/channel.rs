//! Transports that carry control requests to the service.

use memgate_proto::{ControlCode, NtStatus, Wire};

use crate::error::Result;

/// A buffered control channel.
pub trait Channel: Send + Sync {
    /// Send `buffer` as the input of `code` and receive the output into it.
    ///
    /// Returns the number of bytes the service wrote back.
    fn control(&self, code: ControlCode, buffer: &mut [u8]) -> Result<usize>;
}

/// Send a request without payload.
pub(crate) fn request(channel: &dyn Channel, code: ControlCode) -> Result<()> {
    match channel.control(code, &mut [])? {
        0 => Ok(()),
        _ => Err(NtStatus::BUFFER_TOO_SMALL.into()),
    }
}

/// Exchange one fixed-size record; a short reply counts as a failure.
pub(crate) fn exchange<T: Wire>(channel: &dyn Channel, code: ControlCode, value: &mut T) -> Result<()> {
    let returned = channel.control(code, value.as_bytes_mut())?;
    if returned != T::SIZE {
        return Err(NtStatus::BUFFER_TOO_SMALL.into());
    }
    Ok(())
}

#[cfg(target_os = "windows")]
mod device {
    use std::ffi::c_void;

    use memgate_proto::{ControlCode, DEVICE_PATH};
    use tracing::debug;
    use windows::Win32::Foundation::{CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE};
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_MODE, OPEN_EXISTING,
    };
    use windows::Win32::System::IO::DeviceIoControl;
    use windows::core::HSTRING;

    use super::Channel;
    use crate::error::Result;

    /// Handle to the control device.
    pub struct DeviceChannel {
        handle: HANDLE,
    }

    // SAFETY: a device handle may be used from any thread; requests are
    // serialised by the I/O manager.
    unsafe impl Send for DeviceChannel {}
    unsafe impl Sync for DeviceChannel {}

    impl DeviceChannel {
        /// Open the control device exclusively.
        pub fn open() -> Result<Self> {
            // SAFETY: every pointer argument is valid for the call.
            let handle = unsafe {
                CreateFileW(
                    &HSTRING::from(DEVICE_PATH),
                    (GENERIC_READ | GENERIC_WRITE).0,
                    FILE_SHARE_MODE(0),
                    None,
                    OPEN_EXISTING,
                    FILE_FLAGS_AND_ATTRIBUTES(0),
                    HANDLE::default(),
                )
            }?;
            debug!("opened {}", DEVICE_PATH);
            Ok(Self { handle })
        }
    }

    impl Channel for DeviceChannel {
        fn control(&self, code: ControlCode, buffer: &mut [u8]) -> Result<usize> {
            let len = buffer.len() as u32;
            let data = (!buffer.is_empty()).then(|| buffer.as_mut_ptr().cast::<c_void>());
            let mut returned = 0u32;
            // SAFETY: METHOD_BUFFERED; the same buffer serves as input and
            // output and outlives the call.
            unsafe {
                DeviceIoControl(
                    self.handle,
                    code.raw(),
                    data.map(|ptr| ptr as *const c_void),
                    len,
                    data,
                    len,
                    Some(&mut returned),
                    None,
                )
            }?;
            Ok(returned as usize)
        }
    }

    impl Drop for DeviceChannel {
        fn drop(&mut self) {
            // SAFETY: the handle was opened by `open` and is closed once.
            let _ = unsafe { CloseHandle(self.handle) };
        }
    }
}

#[cfg(target_os = "windows")]
pub use device::DeviceChannel;
