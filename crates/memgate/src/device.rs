use std::fmt;

use memgate_proto::{
    ControlCode, CopyRequest, DelayRequest, KeyboardInput, MAX_ADDRESS, MIN_ADDRESS, MouseInput,
    NtStatus, PollRequest, QueryRequest, Record, RegionDescriptor, Version, Wire,
};
use tracing::debug;

use crate::channel::{self, Channel};
use crate::connect::Connector;
use crate::error::{Error, Result, win32};
use crate::list::{EventList, RegionList};
use crate::scan::Scanner;
use crate::signature::Signature;

/// An open, version-checked channel to the control service.
pub struct Device {
    channel: Box<dyn Channel>,
    version: Version,
}

impl Device {
    /// Open a channel and verify the service version. Never reloads.
    pub fn create(connector: &dyn Connector) -> Result<Self> {
        Self::from_channel(connector.open()?)
    }

    pub fn from_channel(channel: Box<dyn Channel>) -> Result<Self> {
        let mut version = Version::default();
        channel::exchange(channel.as_ref(), ControlCode::GetVersion, &mut version)?;
        if !Version::CURRENT.is_compatible(&version) {
            return Err(Error::VersionMismatch {
                expected: Version::CURRENT,
                actual: version,
            });
        }
        debug!("connected to service {}", version);
        Ok(Self { channel, version })
    }

    /// Version the service reported when the device was opened.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn attach(&self) -> Result<()> {
        channel::request(self.channel.as_ref(), ControlCode::Attach)
    }

    pub fn detach(&self) -> Result<()> {
        channel::request(self.channel.as_ref(), ControlCode::Detach)
    }

    /// Move every queued event onto `events`.
    pub fn poll(&self, events: &mut EventList) -> Result<()> {
        let mut request = PollRequest::new(events.handle().0);
        channel::exchange(self.channel.as_ref(), ControlCode::Poll, &mut request)
    }

    fn copy(&self, code: ControlCode, mut request: CopyRequest) -> Result<()> {
        channel::exchange(self.channel.as_ref(), code, &mut request)
    }

    /// Follow a pointer chain: each offset is added to the pointer read at the
    /// current address.
    fn resolve(&self, pid: u64, mut address: u64, offsets: &[u64]) -> Result<u64> {
        for offset in offsets {
            let mut pointer = 0u64;
            self.read(pid, address, &[], pointer.as_bytes_mut())?;
            address = pointer.wrapping_add(*offset);
        }
        Ok(address)
    }

    /// Read `buffer.len()` bytes of process `pid` at the end of the chain.
    pub fn read(&self, pid: u64, address: u64, offsets: &[u64], buffer: &mut [u8]) -> Result<()> {
        let address = self.resolve(pid, address, offsets)?;
        self.copy(
            ControlCode::Read,
            CopyRequest {
                pid,
                src: address,
                dst: buffer.as_mut_ptr() as u64,
                size: buffer.len() as u64,
            },
        )
    }

    /// Write `buffer` into process `pid` at the end of the chain.
    pub fn write(&self, pid: u64, address: u64, offsets: &[u64], buffer: &[u8]) -> Result<()> {
        let address = self.resolve(pid, address, offsets)?;
        self.copy(
            ControlCode::Write,
            CopyRequest {
                pid,
                src: buffer.as_ptr() as u64,
                dst: address,
                size: buffer.len() as u64,
            },
        )
    }

    pub fn read_value<T: Wire>(&self, pid: u64, address: u64, offsets: &[u64]) -> Result<T> {
        let mut bytes = vec![0u8; T::SIZE];
        self.read(pid, address, offsets, &mut bytes)?;
        T::read_from(&bytes).ok_or_else(|| NtStatus::BUFFER_TOO_SMALL.into())
    }

    pub fn write_value<T: Wire>(&self, pid: u64, address: u64, offsets: &[u64], value: &T) -> Result<()> {
        self.write(pid, address, offsets, value.as_bytes())
    }

    /// Describe the committed regions of `pid` inside `[min, max)`, lowest
    /// address first.
    pub fn query_regions(&self, pid: u64, min: u64, max: u64) -> Result<RegionList> {
        let regions = RegionList::new();
        let mut query = QueryRequest {
            pid,
            min,
            max,
            list: regions.handle().0,
        };
        channel::exchange(self.channel.as_ref(), ControlCode::Query, &mut query)?;
        Ok(regions)
    }

    /// [`query_regions`](Self::query_regions) over the whole address window.
    pub fn regions(&self, pid: u64) -> Result<RegionList> {
        self.query_regions(pid, MIN_ADDRESS, MAX_ADDRESS)
    }

    /// Replace each region with a copy that carries its current content.
    ///
    /// Regions that cannot be read are dropped; order is kept.
    pub fn capture_regions(&self, pid: u64, regions: &mut RegionList) -> Result<()> {
        let mut captured = RegionList::new();
        for region in regions.iter() {
            let mut descriptor = *region.header();
            descriptor.copied_size = descriptor.region_size;
            let entry = Record::allocate(descriptor)
                .ok_or_else(|| Error::dword(win32::ERROR_NOT_ENOUGH_MEMORY))?;
            // SAFETY: freshly allocated and not yet shared.
            let data = unsafe { Record::<RegionDescriptor>::payload_mut(entry) };
            match self.read(pid, descriptor.base_address, &[], data) {
                // SAFETY: the record is ours and on no list.
                Ok(()) => unsafe { captured.push(entry) },
                Err(e) => {
                    debug!(
                        "dropping region {:#x} (+{:#x}): {}",
                        descriptor.base_address, descriptor.region_size, e
                    );
                    // SAFETY: never linked, never used again.
                    unsafe { Record::<RegionDescriptor>::free(entry) };
                }
            }
        }
        regions.clear();
        regions.take_reversed(&mut captured);
        Ok(())
    }

    /// Forward a keyboard event. The service may rewrite `input`.
    pub fn inject_keyboard(&self, input: &mut KeyboardInput) -> Result<()> {
        channel::exchange(self.channel.as_ref(), ControlCode::Keyboard, input)
    }

    /// Forward a mouse event. Redundant button transitions are stripped.
    pub fn inject_mouse(&self, input: &mut MouseInput) -> Result<()> {
        channel::exchange(self.channel.as_ref(), ControlCode::Mouse, input)
    }

    pub fn set_injection_delay(&self, offset: i32) -> Result<()> {
        let mut request = DelayRequest { offset };
        channel::exchange(self.channel.as_ref(), ControlCode::Delay, &mut request)
    }

    /// Addresses of up to `max_hits` matches (0 = all) in the live process.
    pub fn scan(&self, pid: u64, signature: &Signature, max_hits: usize) -> Result<Vec<u64>> {
        let mut hits = Vec::new();
        Scanner::new().max_hits(max_hits).scan_process(
            self,
            pid,
            signature,
            MIN_ADDRESS,
            MAX_ADDRESS,
            |address| hits.push(address),
        )?;
        hits.sort_unstable();
        Ok(hits)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use memgate_proto::records::memory::*;
    use memgate_service::{ControlService, SimRegion, SimulatedHost};

    use crate::local::LocalChannel;

    const PID: u64 = 1234;

    fn setup() -> (Arc<ControlService<SimulatedHost>>, Device) {
        let host = SimulatedHost::new();
        host.spawn(PID, r"C:\target.exe");
        let service = Arc::new(ControlService::new(host));
        let device = Device::from_channel(Box::new(LocalChannel::new(Arc::clone(&service)))).unwrap();
        (service, device)
    }

    #[test]
    fn test_version_is_checked() {
        let service = Arc::new(
            ControlService::builder(SimulatedHost::new())
                .version(Version::new(9, 9, 9))
                .build(),
        );
        let err = Device::from_channel(Box::new(LocalChannel::new(service))).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { actual, .. } if actual == Version::new(9, 9, 9)));
    }

    #[test]
    fn test_read_write_values() {
        let (service, device) = setup();
        service
            .host()
            .map(PID, SimRegion::private(0x40_0000, vec![0; 0x1000]))
            .unwrap();

        device.write_value(PID, 0x40_0010, &[], &0xDEAD_BEEFu32).unwrap();
        assert_eq!(device.read_value::<u32>(PID, 0x40_0010, &[]).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_pointer_chain() {
        let (service, device) = setup();
        let mut bytes = vec![0u8; 0x1000];
        // 0x400000 -> 0x400100, +0x20 -> 0x400200, +0x8 -> value
        bytes[0..8].copy_from_slice(&0x40_0100u64.to_ne_bytes());
        bytes[0x120..0x128].copy_from_slice(&0x40_0200u64.to_ne_bytes());
        bytes[0x208..0x20C].copy_from_slice(&77u32.to_ne_bytes());
        service
            .host()
            .map(PID, SimRegion::private(0x40_0000, bytes))
            .unwrap();

        let value: u32 = device.read_value(PID, 0x40_0000, &[0x20, 0x8]).unwrap();
        assert_eq!(value, 77);

        device.write_value(PID, 0x40_0000, &[0x20, 0x8], &78u32).unwrap();
        assert_eq!(device.read_value::<u32>(PID, 0x40_0208, &[]).unwrap(), 78);
    }

    #[test]
    fn test_pointer_chain_failure_stops_early() {
        let (service, device) = setup();
        let mut bytes = vec![0u8; 0x1000];
        bytes[0..8].copy_from_slice(&0x10u64.to_ne_bytes());
        service
            .host()
            .map(PID, SimRegion::private(0x40_0000, bytes))
            .unwrap();

        let err = device.read_value::<u32>(PID, 0x40_0000, &[0]).unwrap_err();
        assert_eq!(err.status(), Some(NtStatus::INVALID_PARAMETER));
    }

    #[test]
    fn test_query_regions_lowest_first() {
        let (service, device) = setup();
        let host = service.host();
        host.map(PID, SimRegion::private(0x60_0000, vec![1; 0x1000])).unwrap();
        host.map(PID, SimRegion::private(0x40_0000, vec![2; 0x2000])).unwrap();

        let regions = device.regions(PID).unwrap();
        let bases: Vec<u64> = regions.iter().map(|r| r.base()).collect();
        assert_eq!(bases, vec![0x40_0000, 0x60_0000]);
        assert!(regions.iter().all(|r| r.data().is_empty()));
    }

    #[test]
    fn test_query_unknown_process() {
        let (_service, device) = setup();
        let err = device.regions(999).unwrap_err();
        assert_eq!(err.status(), Some(NtStatus::NOT_FOUND));
    }

    #[test]
    fn test_capture_drops_failed_reads() {
        let (service, device) = setup();
        let host = service.host();
        host.map(PID, SimRegion::private(0x40_0000, vec![0xAA; 0x1000])).unwrap();
        host.map(
            PID,
            SimRegion::private(0x50_0000, vec![0xBB; 0x1000]).with_protect(PAGE_READWRITE | PAGE_GUARD),
        )
        .unwrap();
        host.map(PID, SimRegion::private(0x60_0000, vec![0xCC; 0x1000])).unwrap();

        let mut regions = device.regions(PID).unwrap();
        assert_eq!(regions.len(), 2);
        host.terminate(PID);
        device.capture_regions(PID, &mut regions).unwrap();
        assert!(regions.is_empty());
    }

    #[test]
    fn test_capture_copies_content_in_order() {
        let (service, device) = setup();
        let host = service.host();
        host.map(PID, SimRegion::private(0x40_0000, vec![0xAA; 0x1000])).unwrap();
        host.map(PID, SimRegion::private(0x60_0000, vec![0xCC; 0x2000])).unwrap();

        let mut regions = device.regions(PID).unwrap();
        device.capture_regions(PID, &mut regions).unwrap();

        let captured: Vec<(u64, usize, u8)> = regions
            .iter()
            .map(|r| (r.base(), r.data().len(), r.data()[0]))
            .collect();
        assert_eq!(
            captured,
            vec![(0x40_0000, 0x1000, 0xAA), (0x60_0000, 0x2000, 0xCC)]
        );
    }

    #[test]
    fn test_delay_reaches_service() {
        let (service, device) = setup();
        device.set_injection_delay(-5).unwrap();
        assert_eq!(service.injection_delay(), -5);
    }
}
