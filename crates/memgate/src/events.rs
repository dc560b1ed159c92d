use memgate_proto::EventHeader;
use tracing::debug;

use crate::device::Device;
use crate::error::{Error, Result, win32};
use crate::list::{EventList, Iter};

/// A subscription to process and image events.
///
/// Opening attaches the calling process to the service; closing (or
/// dropping) detaches it and frees every event still held.
#[derive(Debug, Default)]
pub struct Events<'d> {
    device: Option<&'d Device>,
    list: EventList,
}

impl<'d> Events<'d> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, device: &'d Device) -> Result<()> {
        if self.device.is_some() {
            return Err(Error::dword(win32::ERROR_INVALID_HANDLE));
        }
        device.attach()?;
        self.device = Some(device);
        debug!("event subscription opened");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Fetch every queued event. Each poll yields the newest event first.
    pub fn poll(&mut self) -> Result<()> {
        let device = self
            .device
            .ok_or_else(|| Error::dword(win32::ERROR_INVALID_HANDLE))?;
        device.poll(&mut self.list)
    }

    pub fn iter(&self) -> Iter<'_, EventHeader> {
        self.list.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Free the events received so far.
    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn close(&mut self) -> Result<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        let result = device.detach();
        self.list.clear();
        debug!("event subscription closed");
        result
    }
}

impl Drop for Events<'_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use memgate_proto::EventKind;
    use memgate_service::{ControlService, SimRegion, SimulatedHost};

    use crate::local::LocalChannel;
    use crate::error::ErrorCode;

    fn setup() -> (Arc<ControlService<SimulatedHost>>, Device) {
        let service = Arc::new(ControlService::new(SimulatedHost::new()));
        service.host().connect_notifier(service.notifier());
        let device = Device::from_channel(Box::new(LocalChannel::new(Arc::clone(&service)))).unwrap();
        (service, device)
    }

    #[test]
    fn test_events_newest_first() {
        let (service, device) = setup();
        let mut events = Events::new();
        events.open(&device).unwrap();
        assert!(service.is_attached());

        let host = service.host();
        host.spawn(10, r"C:\a.exe");
        host.load_image(10, r"C:\a.dll", SimRegion::image(0x40_0000, vec![0; 0x1000]))
            .unwrap();
        events.poll().unwrap();

        let seen: Vec<(Option<EventKind>, String)> =
            events.iter().map(|e| (e.kind(), e.text())).collect();
        assert_eq!(
            seen,
            vec![
                (Some(EventKind::ImageLoaded), r"C:\a.dll".to_string()),
                (Some(EventKind::ProcessCreated), r"C:\a.exe".to_string()),
            ]
        );

        events.poll().unwrap();
        assert_eq!(events.iter().count(), 2);
    }

    #[test]
    fn test_double_open_is_refused() {
        let (_service, device) = setup();
        let mut events = Events::new();
        events.open(&device).unwrap();
        let err = events.open(&device).unwrap_err();
        assert_eq!(err.code(), ErrorCode::dword(win32::ERROR_INVALID_HANDLE));
    }

    #[test]
    fn test_poll_requires_open() {
        let mut events = Events::new();
        assert!(events.poll().is_err());
        assert!(events.close().is_ok());
    }

    #[test]
    fn test_drop_detaches() {
        let (service, device) = setup();
        {
            let mut events = Events::new();
            events.open(&device).unwrap();
            service.host().spawn(11, r"C:\b.exe");
            events.poll().unwrap();
            assert!(!events.is_empty());
        }
        assert!(!service.is_attached());
    }
}
