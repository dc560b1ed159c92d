use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use memgate::{Device, Events, RecordRef};
use memgate_proto::{EventHeader, EventKind};
use tracing::info;

use super::hex_utils::format_hex_address;
use crate::shutdown::ShutdownSignal;

pub fn describe(event: &RecordRef<'_, EventHeader>) -> String {
    let text = event.text();
    match event.kind() {
        Some(EventKind::ImageLoaded) => format!(
            "[{}] pid {} {} at {} (+{})",
            EventKind::ImageLoaded,
            event.pid(),
            text,
            format_hex_address(event.image_base),
            format_hex_address(event.image_size)
        ),
        Some(kind) => format!("[{}] pid {} {}", kind, event.pid(), text),
        None => format!("[unknown {}] pid {} {}", event.kind, event.pid(), text),
    }
}

/// Print events until `shutdown` is triggered.
pub fn run(
    device: &Device,
    shutdown: &ShutdownSignal,
    interval: Duration,
    out: &mut impl Write,
) -> Result<()> {
    let mut events = Events::new();
    events.open(device)?;
    info!("listening for events, press Ctrl+C to stop");

    loop {
        events.poll()?;
        // Each poll hands back the newest event first.
        let batch: Vec<String> = events.iter().map(|event| describe(&event)).collect();
        for line in batch.iter().rev() {
            writeln!(out, "{}", line)?;
        }
        out.flush()?;
        events.clear();

        if shutdown.wait(interval) {
            break;
        }
    }

    events.close()?;
    Ok(())
}
