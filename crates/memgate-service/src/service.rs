//! Control request dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use memgate_proto::{
    ControlCode, CopyRequest, DelayRequest, KeyboardInput, ListHandle, MouseInput, NtStatus,
    PollRequest, QueryRequest, Version, Wire,
};
use tracing::{debug, info};

use crate::copy;
use crate::events::{Notifier, Shared};
use crate::host::{CopyDirection, Host};
use crate::input::{InputSink, MouseState};
use crate::regions::{self, RegionFilter};

/// One buffered control request.
///
/// The same buffer carries the input and receives the output, so the two
/// lengths normally equal `buffer.len()`.
#[derive(Debug)]
pub struct IoRequest<'a> {
    pub code: u32,
    pub buffer: &'a mut [u8],
    pub input_len: usize,
    pub output_len: usize,
}

impl<'a> IoRequest<'a> {
    pub fn new(code: u32, buffer: &'a mut [u8]) -> Self {
        let len = buffer.len();
        Self {
            code,
            buffer,
            input_len: len,
            output_len: len,
        }
    }
}

/// Completion of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatus {
    pub status: NtStatus,
    /// Bytes of the buffer that hold output.
    pub information: usize,
}

impl IoStatus {
    fn failed(status: NtStatus) -> Self {
        Self {
            status,
            information: 0,
        }
    }
}

pub struct ControlServiceBuilder<H> {
    host: H,
    version: Version,
    filter: RegionFilter,
    input: Option<Box<dyn InputSink>>,
}

impl<H: Host> ControlServiceBuilder<H> {
    /// Report `version` instead of the build's own protocol version.
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn region_filter(mut self, filter: RegionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn input_sink(mut self, sink: impl InputSink + 'static) -> Self {
        self.input = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> ControlService<H> {
        info!(
            "control service ready (version {}, filter {:?})",
            self.version, self.filter
        );
        ControlService {
            host: self.host,
            shared: Arc::new(Shared::default()),
            version: self.version,
            filter: self.filter,
            input: self.input,
            mouse: MouseState::new(),
            delay: AtomicI32::new(0),
        }
    }
}

/// The privileged side of the protocol.
pub struct ControlService<H: Host> {
    host: H,
    shared: Arc<Shared>,
    version: Version,
    filter: RegionFilter,
    input: Option<Box<dyn InputSink>>,
    mouse: MouseState,
    delay: AtomicI32,
}

fn decode<T: Wire>(buffer: &[u8]) -> Result<T, NtStatus> {
    T::read_from(buffer).ok_or(NtStatus::INVALID_PARAMETER)
}

fn complete(result: Result<(), NtStatus>) -> NtStatus {
    match result {
        Ok(()) => NtStatus::SUCCESS,
        Err(status) => status,
    }
}

impl<H: Host> ControlService<H> {
    pub fn builder(host: H) -> ControlServiceBuilder<H> {
        ControlServiceBuilder {
            host,
            version: Version::CURRENT,
            filter: RegionFilter::ANY,
            input: None,
        }
    }

    pub fn new(host: H) -> Self {
        Self::builder(host).build()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Handle for OS notification glue.
    pub fn notifier(&self) -> Notifier {
        Notifier::new(Arc::clone(&self.shared))
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_attached(&self) -> bool {
        self.shared.attachment.is_attached()
    }

    pub fn injection_delay(&self) -> i32 {
        self.delay.load(Ordering::Acquire)
    }

    /// Drop the attachment and every queued event.
    pub fn unload(&self) {
        self.shared.attachment.detach(None, |_| false);
        self.shared.queue.clear();
        info!("control service unloaded");
    }

    /// Handle one control request.
    ///
    /// Input and output lengths must both equal the size the code expects;
    /// otherwise the request fails with `STATUS_INVALID_BUFFER_SIZE` and the
    /// buffer is left untouched.
    pub fn device_control(&self, request: IoRequest<'_>) -> IoStatus {
        let Some(code) = ControlCode::from_raw(request.code) else {
            debug!("unknown control code {:#x}", request.code);
            return IoStatus::failed(NtStatus::INVALID_PARAMETER);
        };

        let size = code.payload_size();
        if request.input_len != size || request.output_len != size {
            debug!(
                "{}: buffer size mismatch (in {}, out {}, expected {})",
                code, request.input_len, request.output_len, size
            );
            return IoStatus::failed(NtStatus::INVALID_BUFFER_SIZE);
        }
        let Some(buffer) = request.buffer.get_mut(..size) else {
            return IoStatus::failed(NtStatus::INVALID_PARAMETER);
        };

        let status = complete(self.dispatch(code, buffer));
        if !status.is_success() {
            debug!("{} failed with {}", code, status);
            if matches!(code, ControlCode::Read | ControlCode::Write | ControlCode::Query) {
                self.notifier().log(&format!("{code} failed ({status})."));
            }
            return IoStatus::failed(status);
        }

        IoStatus {
            status,
            information: size,
        }
    }

    fn dispatch(&self, code: ControlCode, buffer: &mut [u8]) -> Result<(), NtStatus> {
        match code {
            ControlCode::GetVersion => {
                self.version.write_to(buffer);
                Ok(())
            }
            ControlCode::Attach => self.shared.attachment.attach(self.host.current_process()),
            ControlCode::Detach => {
                self.shared
                    .attachment
                    .detach(self.host.current_process(), |token| {
                        self.host.is_process_alive(token)
                    });
                Ok(())
            }
            ControlCode::Poll => {
                let request: PollRequest = decode(buffer)?;
                self.shared
                    .queue
                    .drain_into(&self.host, ListHandle(request.list))
                    .ok()
            }
            ControlCode::Read | ControlCode::Write => {
                let request: CopyRequest = decode(buffer)?;
                let direction = if code == ControlCode::Read {
                    CopyDirection::FromTarget
                } else {
                    CopyDirection::ToTarget
                };
                copy::copy(&self.host, &request, direction).ok()
            }
            ControlCode::Query => {
                let request: QueryRequest = decode(buffer)?;
                regions::enumerate(&self.host, &self.filter, &request).ok()
            }
            ControlCode::Keyboard => {
                let mut input: KeyboardInput = decode(buffer)?;
                input.unit_id = 0;
                if let Some(sink) = &self.input {
                    sink.keyboard(&input);
                }
                input.write_to(buffer);
                Ok(())
            }
            ControlCode::Mouse => {
                let mut input: MouseInput = decode(buffer)?;
                self.mouse
                    .sanitize(&mut input, self.delay.load(Ordering::Acquire));
                input.unit_id = 0;
                if let Some(sink) = &self.input {
                    sink.mouse(&input);
                }
                input.write_to(buffer);
                Ok(())
            }
            ControlCode::Delay => {
                let request: DelayRequest = decode(buffer)?;
                self.delay.store(request.offset, Ordering::Release);
                if let Some(sink) = &self.input {
                    sink.set_delay(request.offset);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use memgate_proto::records::memory::*;
    use memgate_proto::{EventHeader, EventKind, ListHeader, Record, RegionDescriptor};

    use crate::sim::{SimRegion, SimulatedHost};

    const PID: u64 = 100;

    fn service() -> ControlService<SimulatedHost> {
        let host = SimulatedHost::new();
        host.spawn(PID, "C:\\target.exe");
        host.map(PID, SimRegion::private(0x10_0000_0000, vec![0xAA; 0x2000]))
            .unwrap();
        host.map(PID, SimRegion::private(0x10_0001_0000, vec![0xBB; 0x1000]))
            .unwrap();
        host.map(PID, SimRegion::image(0x10_0002_0000, vec![0x90; 0x1000]))
            .unwrap();
        ControlService::new(host)
    }

    fn call<T: Wire>(service: &ControlService<SimulatedHost>, code: ControlCode, value: &mut T) -> IoStatus {
        service.device_control(IoRequest::new(code.raw(), value.as_bytes_mut()))
    }

    fn bare(service: &ControlService<SimulatedHost>, code: ControlCode) -> IoStatus {
        service.device_control(IoRequest::new(code.raw(), &mut []))
    }

    fn drain_regions(list: &ListHeader) -> Vec<RegionDescriptor> {
        let mut out = Vec::new();
        while let Some(entry) = unsafe { list.pop() } {
            unsafe {
                out.push(*Record::<RegionDescriptor>::header(entry));
                Record::<RegionDescriptor>::free(entry);
            }
        }
        out
    }

    fn drain_events(list: &ListHeader) -> Vec<EventHeader> {
        list.flush()
            .map(|entry| unsafe {
                let header = *Record::<EventHeader>::header(entry);
                Record::<EventHeader>::free(entry);
                header
            })
            .collect()
    }

    #[test]
    fn test_version() {
        let service = service();
        let mut version = Version::default();
        let status = call(&service, ControlCode::GetVersion, &mut version);
        assert_eq!(status.status, NtStatus::SUCCESS);
        assert_eq!(status.information, 16);
        assert_eq!(version, Version::CURRENT);
    }

    #[test]
    fn test_version_override() {
        let service = ControlService::builder(SimulatedHost::new())
            .version(Version::new(9, 9, 9))
            .build();
        let mut version = Version::default();
        call(&service, ControlCode::GetVersion, &mut version);
        assert_eq!(version, Version::new(9, 9, 9));
    }

    #[test]
    fn test_buffer_size_mismatch_leaves_buffer_untouched() {
        let service = service();
        let mut buffer = [0x5Au8; 15];
        let status =
            service.device_control(IoRequest::new(ControlCode::GetVersion.raw(), &mut buffer));
        assert_eq!(status, IoStatus::failed(NtStatus::INVALID_BUFFER_SIZE));
        assert_eq!(buffer, [0x5A; 15]);

        let mut buffer = [0u8; 16];
        let mut request = IoRequest::new(ControlCode::GetVersion.raw(), &mut buffer);
        request.output_len = 8;
        assert_eq!(
            service.device_control(request).status,
            NtStatus::INVALID_BUFFER_SIZE
        );

        let mut buffer = [0u8; 1];
        let status = service.device_control(IoRequest::new(ControlCode::Attach.raw(), &mut buffer));
        assert_eq!(status.status, NtStatus::INVALID_BUFFER_SIZE);
    }

    #[test]
    fn test_unknown_code() {
        let service = service();
        let status = service.device_control(IoRequest::new(0x0022_2FFC, &mut []));
        assert_eq!(status, IoStatus::failed(NtStatus::INVALID_PARAMETER));
    }

    #[test]
    fn test_attach_without_identity() {
        let service = service();
        service.host().set_caller(None);
        assert_eq!(
            bare(&service, ControlCode::Attach).status,
            NtStatus::INVALID_HANDLE
        );
        assert!(!service.is_attached());
    }

    #[test]
    fn test_detach_semantics() {
        let service = service();
        let first = service.host().caller().unwrap();
        assert_eq!(bare(&service, ControlCode::Attach).status, NtStatus::SUCCESS);

        // Another live process cannot detach the owner.
        let second = service.host().new_caller();
        service.host().set_caller(Some(second));
        assert_eq!(bare(&service, ControlCode::Detach).status, NtStatus::SUCCESS);
        assert!(service.is_attached());

        // Once the owner exits, anyone clears it.
        service.host().exit_caller(first);
        bare(&service, ControlCode::Detach);
        assert!(!service.is_attached());
    }

    #[test]
    fn test_query_lists_committed_non_image_regions_ascending() {
        let service = service();
        let list = ListHeader::new();
        let mut query = QueryRequest {
            pid: PID,
            min: memgate_proto::MIN_ADDRESS,
            max: memgate_proto::MAX_ADDRESS,
            list: list.handle().0,
        };
        assert_eq!(
            call(&service, ControlCode::Query, &mut query).status,
            NtStatus::SUCCESS
        );

        let regions = drain_regions(&list);
        let bases: Vec<u64> = regions.iter().map(|r| r.base_address).collect();
        assert_eq!(bases, vec![0x10_0000_0000, 0x10_0001_0000]);
        assert_eq!(regions[0].region_size, 0x2000);
        assert_eq!(regions[0].state, MEM_COMMIT);
        assert_eq!(regions[0].kind, MEM_PRIVATE);
        assert_eq!(regions[0].copied_size, 0);
    }

    #[test]
    fn test_query_applies_filter() {
        let host = SimulatedHost::new();
        host.spawn(PID, "C:\\target.exe");
        host.map(PID, SimRegion::private(0x10_0000_0000, vec![0; 0x2000]))
            .unwrap();
        host.map(PID, SimRegion::private(0x10_0001_0000, vec![0; 0x1000]))
            .unwrap();
        let service = ControlService::builder(host)
            .region_filter(RegionFilter::ANY.region_size(0x1000))
            .build();

        let list = ListHeader::new();
        let mut query = QueryRequest {
            pid: PID,
            min: memgate_proto::MIN_ADDRESS,
            max: memgate_proto::MAX_ADDRESS,
            list: list.handle().0,
        };
        call(&service, ControlCode::Query, &mut query);
        let bases: Vec<u64> = drain_regions(&list).iter().map(|r| r.base_address).collect();
        assert_eq!(bases, vec![0x10_0001_0000]);
    }

    #[test]
    fn test_query_validation() {
        let service = service();
        let list = ListHeader::new();
        let mut inverted = QueryRequest {
            pid: PID,
            min: 0x20_0000_0000,
            max: 0x10_0000_0000,
            list: list.handle().0,
        };
        assert_eq!(
            call(&service, ControlCode::Query, &mut inverted).status,
            NtStatus::INVALID_PARAMETER
        );

        let mut low = QueryRequest {
            min: 0x1000,
            ..inverted
        };
        low.max = memgate_proto::MAX_ADDRESS;
        assert_eq!(
            call(&service, ControlCode::Query, &mut low).status,
            NtStatus::INVALID_PARAMETER
        );

        let mut no_list = QueryRequest {
            pid: PID,
            min: memgate_proto::MIN_ADDRESS,
            max: memgate_proto::MAX_ADDRESS,
            list: 0,
        };
        assert_eq!(
            call(&service, ControlCode::Query, &mut no_list).status,
            NtStatus::INVALID_PARAMETER
        );

        let mut missing = QueryRequest {
            pid: 4242,
            list: list.handle().0,
            ..no_list
        };
        assert_eq!(
            call(&service, ControlCode::Query, &mut missing).status,
            NtStatus::NOT_FOUND
        );
        assert!(list.is_empty());
    }

    #[test]
    fn test_read_and_write() {
        let service = service();
        let mut buffer = [0u8; 16];
        let mut request = CopyRequest {
            pid: PID,
            src: 0x10_0000_1FF8,
            dst: buffer.as_mut_ptr() as u64,
            size: 8,
        };
        assert_eq!(
            call(&service, ControlCode::Read, &mut request).status,
            NtStatus::SUCCESS
        );
        assert_eq!(&buffer[..8], &[0xAA; 8]);

        let payload = [1u8, 2, 3, 4];
        let mut request = CopyRequest {
            pid: PID,
            src: payload.as_ptr() as u64,
            dst: 0x10_0001_0010,
            size: 4,
        };
        assert_eq!(
            call(&service, ControlCode::Write, &mut request).status,
            NtStatus::SUCCESS
        );
        assert_eq!(
            service.host().peek(PID, 0x10_0001_0010, 4),
            Some(payload.to_vec())
        );
    }

    #[test]
    fn test_copy_rejections() {
        let service = service();
        let mut buffer = [0u8; 64];
        let dst = buffer.as_mut_ptr() as u64;

        let mut low = CopyRequest {
            pid: PID,
            src: 0x1000,
            dst,
            size: 8,
        };
        assert_eq!(
            call(&service, ControlCode::Read, &mut low).status,
            NtStatus::INVALID_PARAMETER
        );

        let mut oversize = CopyRequest {
            pid: PID,
            src: memgate_proto::MAX_ADDRESS - 4,
            dst,
            size: 8,
        };
        assert_eq!(
            call(&service, ControlCode::Read, &mut oversize).status,
            NtStatus::INVALID_PARAMETER
        );

        let mut empty = CopyRequest {
            pid: PID,
            src: 0x10_0000_0000,
            dst,
            size: 0,
        };
        assert_eq!(
            call(&service, ControlCode::Read, &mut empty).status,
            NtStatus::INVALID_PARAMETER
        );

        let mut missing = CopyRequest {
            pid: 4242,
            src: 0x10_0000_0000,
            dst,
            size: 8,
        };
        assert_eq!(
            call(&service, ControlCode::Read, &mut missing).status,
            NtStatus::NOT_FOUND
        );
    }

    #[test]
    fn test_short_read_is_buffer_too_small() {
        let service = service();
        let mut buffer = [0u8; 32];
        // The region ends 16 bytes in; the next page is unmapped.
        let mut request = CopyRequest {
            pid: PID,
            src: 0x10_0000_1FF0,
            dst: buffer.as_mut_ptr() as u64,
            size: 32,
        };
        assert_eq!(
            call(&service, ControlCode::Read, &mut request).status,
            NtStatus::BUFFER_TOO_SMALL
        );
    }

    #[test]
    fn test_poll_is_lifo_and_drains() {
        let service = service();
        let host = service.host();
        host.connect_notifier(service.notifier());
        bare(&service, ControlCode::Attach);

        host.spawn(201, "C:\\one.exe");
        host.spawn(202, "C:\\two.exe");
        host.terminate(201);

        let list = ListHeader::new();
        let mut poll = PollRequest::new(list.handle().0);
        assert_eq!(
            call(&service, ControlCode::Poll, &mut poll).status,
            NtStatus::SUCCESS
        );
        let events: Vec<(Option<EventKind>, u64)> = drain_events(&list)
            .iter()
            .map(|e| (e.event_kind(), e.pid))
            .collect();
        // Newest first.
        assert_eq!(
            events,
            vec![
                (Some(EventKind::ProcessTerminated), 201),
                (Some(EventKind::ProcessCreated), 202),
                (Some(EventKind::ProcessCreated), 201),
            ]
        );

        call(&service, ControlCode::Poll, &mut poll);
        assert!(list.is_empty());
    }

    #[test]
    fn test_failed_read_posts_log_event() {
        let service = service();
        bare(&service, ControlCode::Attach);
        let mut buffer = [0u8; 8];
        let mut request = CopyRequest {
            pid: 4242,
            src: 0x10_0000_0000,
            dst: buffer.as_mut_ptr() as u64,
            size: 8,
        };
        call(&service, ControlCode::Read, &mut request);

        let list = ListHeader::new();
        let mut poll = PollRequest::new(list.handle().0);
        call(&service, ControlCode::Poll, &mut poll);
        let events = drain_events(&list);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_kind(), Some(EventKind::Log));
    }

    #[test]
    fn test_events_stop_after_detach() {
        let service = service();
        service.host().connect_notifier(service.notifier());
        bare(&service, ControlCode::Attach);
        bare(&service, ControlCode::Detach);
        service.host().spawn(300, "C:\\late.exe");

        let list = ListHeader::new();
        let mut poll = PollRequest::new(list.handle().0);
        call(&service, ControlCode::Poll, &mut poll);
        assert!(list.is_empty());
    }

    #[derive(Default)]
    struct Recorder {
        keys: Mutex<Vec<KeyboardInput>>,
        mice: Mutex<Vec<MouseInput>>,
        delays: Mutex<Vec<i32>>,
    }

    impl InputSink for Arc<Recorder> {
        fn keyboard(&self, input: &KeyboardInput) {
            self.keys.lock().unwrap().push(*input);
        }

        fn mouse(&self, input: &MouseInput) {
            self.mice.lock().unwrap().push(*input);
        }

        fn set_delay(&self, offset: i32) {
            self.delays.lock().unwrap().push(offset);
        }
    }

    #[test]
    fn test_input_is_forwarded_with_unit_zero() {
        let recorder = Arc::new(Recorder::default());
        let service = ControlService::builder(SimulatedHost::new())
            .input_sink(Arc::clone(&recorder))
            .build();

        let mut key = KeyboardInput {
            unit_id: 3,
            make_code: 0x1E,
            ..Default::default()
        };
        assert_eq!(
            call(&service, ControlCode::Keyboard, &mut key).status,
            NtStatus::SUCCESS
        );
        let mut mouse = MouseInput {
            unit_id: 7,
            last_x: 5,
            ..Default::default()
        };
        call(&service, ControlCode::Mouse, &mut mouse);
        let mut delay = DelayRequest { offset: -3 };
        call(&service, ControlCode::Delay, &mut delay);

        assert_eq!(recorder.keys.lock().unwrap()[0].unit_id, 0);
        assert_eq!(recorder.keys.lock().unwrap()[0].make_code, 0x1E);
        assert_eq!(recorder.mice.lock().unwrap()[0].unit_id, 0);
        assert_eq!(*recorder.delays.lock().unwrap(), vec![-3]);
        assert_eq!(service.injection_delay(), -3);
    }

    #[test]
    fn test_delay_pins_injected_movement() {
        let recorder = Arc::new(Recorder::default());
        let service = ControlService::builder(SimulatedHost::new())
            .input_sink(Arc::clone(&recorder))
            .build();

        let mut absolute = MouseInput {
            flags: MouseInput::MOVE_ABSOLUTE,
            last_x: 640,
            last_y: 480,
            ..Default::default()
        };
        call(&service, ControlCode::Mouse, &mut absolute);

        let mut delay = DelayRequest { offset: 5 };
        call(&service, ControlCode::Delay, &mut delay);

        let mut relative = MouseInput {
            flags: MouseInput::MOVE_RELATIVE,
            last_x: 7,
            last_y: 9,
            ..Default::default()
        };
        call(&service, ControlCode::Mouse, &mut relative);
        assert_eq!((relative.last_x, relative.last_y), (0, 0));

        let mut moved = MouseInput {
            flags: MouseInput::MOVE_ABSOLUTE,
            last_x: 1,
            last_y: 2,
            ..Default::default()
        };
        call(&service, ControlCode::Mouse, &mut moved);

        let mice = recorder.mice.lock().unwrap();
        assert_eq!((mice[0].last_x, mice[0].last_y), (640, 480));
        assert_eq!((mice[1].last_x, mice[1].last_y), (0, 0));
        assert_eq!((mice[2].last_x, mice[2].last_y), (640, 480));
    }

    #[test]
    fn test_input_without_sink_is_a_no_op() {
        let service = service();
        let mut key = KeyboardInput::default();
        assert_eq!(
            call(&service, ControlCode::Keyboard, &mut key).status,
            NtStatus::SUCCESS
        );
    }

    #[test]
    fn test_unload_clears_state() {
        let service = service();
        service.host().connect_notifier(service.notifier());
        bare(&service, ControlCode::Attach);
        service.host().spawn(400, "C:\\x.exe");
        service.unload();
        assert!(!service.is_attached());

        let list = ListHeader::new();
        let mut poll = PollRequest::new(list.handle().0);
        call(&service, ControlCode::Poll, &mut poll);
        assert!(list.is_empty());
    }
}
