// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::sync::SyncError;
use crate::transport::{map_io, TcpTransport};

pub const DEFAULT_ADB_PORT: u16 = 5037;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Consumer of device-side shell output, fed line by line as chunks arrive.
pub trait MultiLineReceiver {
    fn process_new_lines(&mut self, lines: &[String]);
    /// Polled between chunks; `true` stops the delivery.
    fn is_cancelled(&self) -> bool;
}

/// Capability to run a shell command on a device and stream its output into
/// a receiver. Split from [`Device`] so listing logic can be exercised
/// without an adb server.
pub trait ShellExecutor: Send + Sync {
    fn execute_shell_command(
        &self,
        command: &str,
        receiver: &mut dyn MultiLineReceiver,
    ) -> Result<()>;
}

enum HostStatus {
    Okay,
    Fail(String),
}

fn send_request(stream: &mut TcpStream, req: &str) -> io::Result<()> {
    let header = format!("{:04x}", req.len());
    stream.write_all(header.as_bytes())?;
    stream.write_all(req.as_bytes())
}

fn read_status(stream: &mut TcpStream) -> io::Result<HostStatus> {
    let mut status = [0u8; 4];
    stream.read_exact(&mut status)?;
    match &status {
        b"OKAY" => Ok(HostStatus::Okay),
        b"FAIL" => {
            let msg = read_hex_block(stream).unwrap_or_default();
            Ok(HostStatus::Fail(msg))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected adb status: {:?}", String::from_utf8_lossy(other)),
        )),
    }
}

/// Reads a `%04x`-length-prefixed payload from the host server.
fn read_hex_block(stream: &mut TcpStream) -> io::Result<String> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let text = std::str::from_utf8(&len_buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = usize::from_str_radix(text, 16)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(String::from_utf8_lossy(&payload).into_owned())
}

fn connect_host(port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout)).ok();
    stream.set_write_timeout(Some(timeout)).ok();
    Ok(stream)
}

#[derive(Debug, Clone)]
pub struct DeviceState {
    pub serial: String,
    pub state: String,
}

/// Queries the adb host server for the devices it knows about.
pub fn list_devices(port: u16, timeout: Duration) -> Result<Vec<DeviceState>> {
    let mut stream =
        connect_host(port, timeout).context("connect adb server 127.0.0.1")?;
    send_request(&mut stream, "host:devices")?;
    match read_status(&mut stream)? {
        HostStatus::Fail(msg) => bail!("adb server refused host:devices: {}", msg),
        HostStatus::Okay => {}
    }
    let payload = read_hex_block(&mut stream)?;
    let mut devices = Vec::new();
    for line in payload.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(serial), Some(state)) = (fields.next(), fields.next()) {
            devices.push(DeviceState { serial: serial.to_string(), state: state.to_string() });
        }
    }
    Ok(devices)
}

/// A device reachable through the local adb host server. Holds no live
/// connection; every operation opens its own stream, so a `Device` is freely
/// shared across threads.
pub struct Device {
    port: u16,
    serial: Option<String>,
    timeout: Duration,
}

impl Device {
    pub fn new(port: u16, serial: Option<String>, timeout: Duration) -> Self {
        Self { port, serial, timeout }
    }

    fn connect(&self) -> Result<TcpStream, SyncError> {
        connect_host(self.port, self.timeout).map_err(map_io)
    }

    /// Points the host connection at this device.
    fn select_target(&self, stream: &mut TcpStream) -> Result<HostStatus, SyncError> {
        let req = match &self.serial {
            Some(serial) => format!("host:transport:{}", serial),
            None => "host:transport-any".to_string(),
        };
        send_request(stream, &req).map_err(map_io)?;
        read_status(stream).map_err(map_io)
    }

    /// Negotiates the `sync:` service. `Ok(None)` means adb refused the
    /// connection; timeouts and I/O errors close the socket before
    /// propagating.
    pub(crate) fn open_sync_channel(&self) -> Result<Option<TcpTransport>, SyncError> {
        let mut stream = self.connect()?;
        match self.negotiate_sync(&mut stream) {
            Ok(HostStatus::Okay) => Ok(Some(TcpTransport::new(stream, self.timeout))),
            Ok(HostStatus::Fail(msg)) => {
                log::warn!("adb refused sync request: {}", msg);
                let _ = stream.shutdown(Shutdown::Both);
                Ok(None)
            }
            Err(e) => {
                log::warn!("error on open sync, closing socket: {}", e);
                let _ = stream.shutdown(Shutdown::Both);
                Err(e)
            }
        }
    }

    fn negotiate_sync(&self, stream: &mut TcpStream) -> Result<HostStatus, SyncError> {
        if let HostStatus::Fail(msg) = self.select_target(stream)? {
            return Ok(HostStatus::Fail(msg));
        }
        send_request(stream, "sync:").map_err(map_io)?;
        read_status(stream).map_err(map_io)
    }
}

impl ShellExecutor for Device {
    /// Runs `shell:<command>` on the device and hands complete output lines
    /// to the receiver until the stream closes or the receiver cancels.
    fn execute_shell_command(
        &self,
        command: &str,
        receiver: &mut dyn MultiLineReceiver,
    ) -> Result<()> {
        let mut stream = self
            .connect()
            .with_context(|| format!("connect adb server for: {}", command))?;
        match self.select_target(&mut stream)? {
            HostStatus::Fail(msg) => bail!("adb rejected device target: {}", msg),
            HostStatus::Okay => {}
        }
        send_request(&mut stream, &format!("shell:{}", command))?;
        match read_status(&mut stream)? {
            HostStatus::Fail(msg) => bail!("adb rejected shell command: {}", msg),
            HostStatus::Okay => {}
        }

        let mut pending = String::new();
        let mut buf = [0u8; 4096];
        loop {
            if receiver.is_cancelled() {
                break;
            }
            let n = stream
                .read(&mut buf)
                .with_context(|| format!("reading output of: {}", command))?;
            if n == 0 {
                break;
            }
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));

            let mut lines = Vec::new();
            while let Some(pos) = pending.find('\n') {
                let rest = pending.split_off(pos + 1);
                let mut line = std::mem::replace(&mut pending, rest);
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                lines.push(line);
            }
            if !lines.is_empty() {
                receiver.process_new_lines(&lines);
            }
        }
        if !pending.is_empty() && !receiver.is_cancelled() {
            let line = pending.trim_end_matches('\r').to_string();
            receiver.process_new_lines(&[line]);
        }
        Ok(())
    }
}
