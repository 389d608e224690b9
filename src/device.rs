//! Local capture/inject device.
//!
//! The router sees the container network through one L2 device: frames
//! the bridge emits are captured and handed to the forwarder, and frames
//! arriving from remote peers are injected back. The host side (bridge,
//! veth pairs, iptables) is set up by the launcher script; the router
//! only opens the already-created interface.
//!
//! Two implementations share one handle shape: a TAP device for real
//! deployments, and an in-memory pair for tests and scenario runs.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::forwarder::MAX_FRAME_LEN;

/// Default kernel-side capture buffer, in bytes.
pub const DEFAULT_CAPTURE_BUFFER: usize = 8 * 1024 * 1024;

/// Channel sender for frames to inject into the device.
pub type InjectTx = std::sync::mpsc::Sender<Vec<u8>>;

/// Errors from device setup and I/O.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open capture device: {0}")]
    Open(#[from] tun::Error),

    #[error("device i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// What the capture side delivers to the router.
#[derive(Debug)]
pub enum DeviceEvent {
    /// A frame captured from the device.
    Frame(Vec<u8>),
    /// This many frames were dropped because the capture channel was
    /// full. Overflow never backpressures the device.
    Dropped(u64),
}

/// The router's view of a running device: captured frames come out of
/// `events`, frames to inject go into `inject`.
pub struct DeviceHandle {
    pub events: mpsc::Receiver<DeviceEvent>,
    pub inject: InjectTx,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl DeviceHandle {
    /// Detach the I/O threads; they exit when their channels close.
    pub fn shutdown(mut self) {
        drop(self.reader.take());
        drop(self.writer.take());
    }

    /// Split into the router's two channel ends, detaching the threads.
    pub fn into_parts(mut self) -> (mpsc::Receiver<DeviceEvent>, InjectTx) {
        drop(self.reader.take());
        drop(self.writer.take());
        (self.events, self.inject)
    }
}

/// A TAP interface opened for L2 capture and injection.
pub struct TapDevice {
    device: tun::Device,
    name: String,
}

impl TapDevice {
    /// Open an existing TAP interface by name.
    ///
    /// Requires CAP_NET_ADMIN; the interface is expected to have been
    /// created and attached to the bridge by the launcher.
    pub fn open(name: &str) -> Result<Self, DeviceError> {
        let mut config = tun::Configuration::default();
        #[allow(deprecated)]
        config.name(name).layer(tun::Layer::L2).up();
        let device = tun::create(&config)?;
        info!(name, "capture device open");
        Ok(TapDevice { device, name: name.to_string() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the reader and writer threads and hand back the channels.
    ///
    /// `buffer_frames` sizes the capture channel; a full channel drops
    /// frames and reports the count, it never blocks the device read.
    pub fn start(self, buffer_frames: usize) -> Result<DeviceHandle, DeviceError> {
        let (event_tx, event_rx) = mpsc::channel(buffer_frames.max(1));
        let (inject_tx, inject_rx) = std::sync::mpsc::channel::<Vec<u8>>();

        // Independent write fd so reads and writes do not serialize.
        let fd = self.device.as_raw_fd();
        let write_fd = unsafe { libc::dup(fd) };
        if write_fd < 0 {
            return Err(DeviceError::Io(std::io::Error::last_os_error()));
        }
        let mut write_file = unsafe { File::from_raw_fd(write_fd) };

        let mut device = self.device;
        let reader = thread::spawn(move || {
            let mut buf = vec![0u8; MAX_FRAME_LEN + 64];
            let mut dropped: u64 = 0;
            loop {
                let len = match device.read(&mut buf) {
                    Ok(0) => break,
                    Ok(len) => len,
                    Err(e) => {
                        debug!(error = %e, "capture read ended");
                        break;
                    }
                };
                let frame = buf[..len].to_vec();
                match event_tx.try_send(DeviceEvent::Frame(frame)) {
                    Ok(()) => {
                        if dropped > 0 {
                            // Channel has room again; report the gap.
                            if event_tx.try_send(DeviceEvent::Dropped(dropped)).is_ok() {
                                dropped = 0;
                            }
                        }
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });

        let writer = thread::spawn(move || {
            while let Ok(frame) = inject_rx.recv() {
                if let Err(e) = write_file.write_all(&frame) {
                    warn!(error = %e, "inject write failed");
                    break;
                }
            }
        });

        Ok(DeviceHandle {
            events: event_rx,
            inject: inject_tx,
            reader: Some(reader),
            writer: Some(writer),
        })
    }
}

/// Driver half of an in-memory device, for tests: push frames to be
/// "captured" and read back what the router injected.
pub struct MemoryDeviceDriver {
    capture_tx: mpsc::Sender<DeviceEvent>,
    injected_rx: std::sync::mpsc::Receiver<Vec<u8>>,
}

impl MemoryDeviceDriver {
    /// Emit a frame as if the bridge had produced it.
    pub async fn emit(&self, frame: Vec<u8>) {
        let _ = self.capture_tx.send(DeviceEvent::Frame(frame)).await;
    }

    /// Frames the router injected so far, without blocking.
    pub fn drain_injected(&self) -> Vec<Vec<u8>> {
        self.injected_rx.try_iter().collect()
    }

    /// Wait for one injected frame.
    pub fn recv_injected(&self, timeout: std::time::Duration) -> Option<Vec<u8>> {
        self.injected_rx.recv_timeout(timeout).ok()
    }
}

/// Build an in-memory device: the handle goes to the router, the driver
/// stays with the test.
pub fn memory_device(buffer_frames: usize) -> (DeviceHandle, MemoryDeviceDriver) {
    let (capture_tx, event_rx) = mpsc::channel(buffer_frames.max(1));
    let (inject_tx, injected_rx) = std::sync::mpsc::channel();
    let handle =
        DeviceHandle { events: event_rx, inject: inject_tx, reader: None, writer: None };
    let driver = MemoryDeviceDriver { capture_tx, injected_rx };
    (handle, driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_device_roundtrip() {
        let (mut handle, driver) = memory_device(4);

        driver.emit(vec![1, 2, 3]).await;
        match handle.events.recv().await {
            Some(DeviceEvent::Frame(frame)) => assert_eq!(frame, vec![1, 2, 3]),
            other => panic!("expected frame, got {:?}", other),
        }

        handle.inject.send(vec![4, 5, 6]).unwrap();
        assert_eq!(driver.drain_injected(), vec![vec![4, 5, 6]]);
    }
}
