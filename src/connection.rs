// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::device_info::UsbAddr;
use crate::pool::Channel;

// Transfers are this many packets long.  With 512 byte high-speed packets this gives 32KiB
// transfers, large enough to keep the bus busy without holding much memory per connection.
const PACKETS_PER_TRANSFER: usize = 64;

// How often a connection waiting for the device checks whether its pool was closed.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Why a USB transfer could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCause {
    Usb(rusb::Error),
    PoolClosed,
    NoData,
}

impl fmt::Display for LossCause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LossCause::Usb(err) => write!(f, "{}", err),
            LossCause::PoolClosed => write!(f, "device is being detached"),
            LossCause::NoData => write!(f, "timed out waiting for non-zero USB read"),
        }
    }
}

/// The USB side of a relayed connection failed.  The transaction state on the device is
/// unknown afterwards, so the connection must not be used any more.
#[derive(Debug)]
pub struct TransportLost {
    pub addr: UsbAddr,
    pub cause: LossCause,
}

impl std::error::Error for TransportLost {}

impl fmt::Display for TransportLost {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: USB transport lost: {}", self.addr, self.cause)
    }
}

fn transport_lost(addr: UsbAddr, cause: LossCause) -> io::Error {
    // Interrupted is deliberately not used: std readers retry on it.
    let kind = match cause {
        LossCause::Usb(rusb::Error::Timeout) | LossCause::NoData => io::ErrorKind::TimedOut,
        LossCause::Usb(rusb::Error::Pipe) => io::ErrorKind::BrokenPipe,
        LossCause::Usb(rusb::Error::NoDevice) | LossCause::PoolClosed => {
            io::ErrorKind::NotConnected
        }
        LossCause::Usb(rusb::Error::InvalidParam) => io::ErrorKind::InvalidInput,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, TransportLost { addr, cause })
}

/// Return true if `err` came from the USB side of a connection.
pub fn is_transport_lost(err: &io::Error) -> bool {
    err.get_ref()
        .map(|inner| inner.is::<TransportLost>())
        .unwrap_or(false)
}

/// A leased channel wrapped as a byte stream.
///
/// Writes are buffered and sent in whole packets; `end_message()` sends the rest and makes
/// sure the message ends with a short packet, adding a zero-length packet when needed.
///
/// Reads present the IN endpoint as one continuous stream through `Read` and `BufRead`.
/// A transfer that comes back short marks the end of a device message; `message_reader()`
/// and `read_message()` stop there.
pub struct UsbConnection {
    verbose_log: bool,
    transfer_timeout: Duration,
    channel: Channel,

    in_buf: Vec<u8>,
    in_packet_size: usize,
    in_pos: usize,
    in_len: usize,
    message_end: bool,

    out_buf: Vec<u8>,
    out_transfer_size: usize,
    out_packet_size: usize,
    // Set when the current message has been sent so far in whole packets, in which case the
    // device needs a zero-length packet to see its end.
    out_aligned: bool,
}

impl UsbConnection {
    pub fn new(verbose_log: bool, transfer_timeout: Duration, channel: Channel) -> Self {
        let descriptor = *channel.descriptor();
        let in_packet_size = usize::from(descriptor.in_packet_size).max(1);
        let out_packet_size = usize::from(descriptor.out_packet_size).max(1);
        Self {
            verbose_log,
            transfer_timeout,
            channel,
            in_buf: vec![0; in_packet_size * PACKETS_PER_TRANSFER],
            in_packet_size,
            in_pos: 0,
            in_len: 0,
            message_end: false,
            out_buf: Vec::new(),
            out_transfer_size: out_packet_size * PACKETS_PER_TRANSFER,
            out_packet_size,
            out_aligned: false,
        }
    }

    pub fn addr(&self) -> UsbAddr {
        self.channel.addr()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn check_open(&self) -> io::Result<()> {
        if self.channel.pool_closed() {
            return Err(transport_lost(self.addr(), LossCause::PoolClosed));
        }
        Ok(())
    }

    fn transfer_out(&mut self, data: &[u8]) -> io::Result<()> {
        self.check_open()?;
        let endpoint = self.channel.descriptor().out_endpoint;
        let mut offset = 0;
        loop {
            let written = self
                .channel
                .device()
                .write_bulk(endpoint, &data[offset..], self.transfer_timeout)
                .map_err(|e| transport_lost(self.addr(), LossCause::Usb(e)))?;
            offset += written;
            if offset >= data.len() {
                break;
            }
            if written == 0 {
                return Err(transport_lost(
                    self.addr(),
                    LossCause::Usb(rusb::Error::Io),
                ));
            }
        }
        if self.verbose_log {
            debug!("{}: USB write: {} bytes", self.addr(), data.len());
        }
        self.out_aligned = data.len() % self.out_packet_size == 0;
        Ok(())
    }

    /// Send everything written since the last call and terminate the message with a short
    /// packet.
    pub fn end_message(&mut self) -> io::Result<()> {
        let tail = std::mem::take(&mut self.out_buf);
        if !tail.is_empty() {
            self.transfer_out(&tail)?;
        }
        if self.out_aligned {
            trace!("{}: sending zero-length packet", self.addr());
            self.transfer_out(&[])?;
        }
        self.out_aligned = false;
        Ok(())
    }

    // Wait for the first packet of an IN transfer in short slices, so that closing the pool
    // cancels a connection stuck on a device that never answers.  The slices read a single
    // packet, which a timeout can't cut in half.
    fn wait_first_packet(&mut self) -> io::Result<usize> {
        let endpoint = self.channel.descriptor().in_endpoint;
        let start = Instant::now();
        loop {
            self.check_open()?;
            let remaining = self.transfer_timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(transport_lost(
                    self.addr(),
                    LossCause::Usb(rusb::Error::Timeout),
                ));
            }
            let slice = remaining.min(CANCEL_CHECK_INTERVAL);
            match self.channel.device().read_bulk(
                endpoint,
                &mut self.in_buf[..self.in_packet_size],
                slice,
            ) {
                Ok(read) => return Ok(read),
                Err(rusb::Error::Timeout) => continue,
                Err(e) => return Err(transport_lost(self.addr(), LossCause::Usb(e))),
            }
        }
    }

    /// Perform one IN transfer into the internal buffer.  Returns the number of bytes read,
    /// which may be zero.
    fn transfer_in(&mut self) -> io::Result<usize> {
        let mut read = self.wait_first_packet()?;
        if read == self.in_packet_size {
            // The device is sending; collect the rest of the transfer in one go.
            let endpoint = self.channel.descriptor().in_endpoint;
            read += self
                .channel
                .device()
                .read_bulk(endpoint, &mut self.in_buf[read..], self.transfer_timeout)
                .map_err(|e| transport_lost(self.addr(), LossCause::Usb(e)))?;
        }
        self.in_pos = 0;
        self.in_len = read;
        self.message_end = read < self.in_buf.len();
        if self.verbose_log {
            debug!(
                "{}: USB read: {} bytes{}",
                self.addr(),
                read,
                if self.message_end { ", end of message" } else { "" }
            );
        }
        Ok(read)
    }

    fn buffered(&self) -> usize {
        self.in_len - self.in_pos
    }

    /// A reader over the rest of the current device message.  It reports EOF once the short
    /// packet ending the message has been consumed.
    pub fn message_reader(&mut self) -> MessageReader<'_> {
        MessageReader { conn: self }
    }

    /// Read one complete device message, up to and including its short packet.
    pub fn read_message(&mut self) -> io::Result<Vec<u8>> {
        if self.buffered() == 0 {
            // Whatever ended the previous message has been consumed.
            self.message_end = false;
        }
        let mut message = Vec::new();
        self.message_reader().read_to_end(&mut message)?;
        Ok(message)
    }
}

impl Write for UsbConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out_buf.extend_from_slice(buf);
        while self.out_buf.len() >= self.out_transfer_size {
            let rest = self.out_buf.split_off(self.out_transfer_size);
            let transfer = std::mem::replace(&mut self.out_buf, rest);
            self.transfer_out(&transfer)?;
        }
        Ok(buf.len())
    }

    /// Send all complete packets.  A partial packet stays buffered because sending it would
    /// end the message early.
    fn flush(&mut self) -> io::Result<()> {
        let whole = self.out_buf.len() - self.out_buf.len() % self.out_packet_size;
        if whole > 0 {
            let rest = self.out_buf.split_off(whole);
            let transfer = std::mem::replace(&mut self.out_buf, rest);
            self.transfer_out(&transfer)?;
        }
        Ok(())
    }
}

impl BufRead for UsbConnection {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.buffered() == 0 {
            let start = Instant::now();
            let mut zero_reads = 0;

            // Zero-length packets only mark message boundaries.  Skip them so that stream
            // readers never see EOF.
            while self.transfer_in()? == 0 {
                zero_reads += 1;
                if start.elapsed() > self.transfer_timeout {
                    return Err(transport_lost(self.addr(), LossCause::NoData));
                }
                thread::sleep(Duration::from_millis(10));
            }

            if zero_reads > 0 {
                debug!(
                    "Spent {}ms waiting for {} 0-byte USB reads",
                    start.elapsed().as_millis(),
                    zero_reads
                );
            }
        }
        Ok(&self.in_buf[self.in_pos..self.in_len])
    }

    fn consume(&mut self, amt: usize) {
        self.in_pos = (self.in_pos + amt).min(self.in_len);
    }
}

impl Read for UsbConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

/// See `UsbConnection::message_reader()`.
pub struct MessageReader<'a> {
    conn: &'a mut UsbConnection,
}

impl Read for MessageReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.conn.buffered() == 0 {
            if self.conn.message_end {
                return Ok(0);
            }
            if self.conn.transfer_in()? == 0 {
                return Ok(0);
            }
        }
        let conn = &mut *self.conn;
        let n = conn.buffered().min(buf.len());
        buf[..n].copy_from_slice(&conn.in_buf[conn.in_pos..conn.in_pos + n]);
        conn.consume(n);
        Ok(n)
    }
}
