//! Shared utilities for integration tests: a scripted PCI on the far end of
//! a memory channel, and fast connection timings.

// Items in this shared module may not be used by all test binaries that
// import it.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use cbus_pci::channel::MemoryHandle;

/// Install a test subscriber once so traces show up under `--nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Spawn a task that plays the PCI: confirms resets with a power-up
/// notification and acknowledges up to `ack_limit` parameter writes (no
/// limit when `None`), then goes silent. Returns the frames it saw, CR
/// stripped, in arrival order.
pub fn spawn_pci(handle: MemoryHandle, ack_limit: Option<usize>) -> Arc<Mutex<Vec<String>>> {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    tokio::spawn(async move {
        let mut buffer: Vec<u8> = Vec::new();
        let mut acknowledged = 0usize;
        loop {
            let written = handle.next_written().await;
            buffer.extend_from_slice(&written);
            while let Some(end) = buffer.iter().position(|&b| b == b'\r') {
                let frame: Vec<u8> = buffer.drain(..=end).collect();
                let text = String::from_utf8_lossy(&frame[..frame.len() - 1]).into_owned();
                observed.lock().unwrap().push(text.clone());
                if text.starts_with("~~~") {
                    handle.feed(b"+\r\n");
                } else if let Some(parameter) = text.strip_prefix("@A3").and_then(|s| s.get(0..2))
                {
                    if ack_limit.is_none_or(|limit| acknowledged < limit) {
                        acknowledged += 1;
                        handle.feed(format!("32{parameter}00\r\n").as_bytes());
                    }
                }
            }
        }
    });
    seen
}

/// Spawn a PCI whose behavior is scripted by `respond`: the closure sees
/// each CR-terminated frame (terminator stripped) and returns the bytes to
/// feed back, if any.
pub fn spawn_scripted_pci(
    handle: MemoryHandle,
    mut respond: impl FnMut(&str) -> Option<Vec<u8>> + Send + 'static,
) {
    init_tracing();
    tokio::spawn(async move {
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let written = handle.next_written().await;
            buffer.extend_from_slice(&written);
            while let Some(end) = buffer.iter().position(|&b| b == b'\r') {
                let frame: Vec<u8> = buffer.drain(..=end).collect();
                let text = String::from_utf8_lossy(&frame[..frame.len() - 1]).into_owned();
                if let Some(reply) = respond(&text) {
                    handle.feed(&reply);
                }
            }
        }
    });
}

/// The scripted handshake half every simulator shares: power-up for resets,
/// acknowledges for parameter writes.
pub fn handshake_response(frame: &str) -> Option<Vec<u8>> {
    if frame.starts_with("~~~") {
        return Some(b"+\r\n".to_vec());
    }
    frame
        .strip_prefix("@A3")
        .and_then(|rest| rest.get(0..2))
        .map(|parameter| format!("32{parameter}00\r\n").into_bytes())
}

/// Connection timings tuned so tests finish quickly.
pub fn fast_config() -> cbus_pci::Config {
    cbus_pci::Config {
        poll_interval: std::time::Duration::from_millis(1),
        settle_delay: std::time::Duration::from_millis(1),
        reset_timeout: std::time::Duration::from_millis(250),
        acknowledge_timeout: std::time::Duration::from_millis(250),
        request_ttl: std::time::Duration::from_millis(250),
        ..cbus_pci::Config::default()
    }
}
