// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use anyhow::{Context, Result, bail};
use bytes::{Buf, BytesMut};
use nix::{
    errno::Errno,
    sys::socket::{
        AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6, connect,
        getsockopt, socket, sockopt,
    },
};
use tracing::trace;

/// A connected non-blocking socket with a pending-write tail.
///
/// `write` pushes as much as the kernel accepts immediately and keeps the
/// rest in an internal buffer; the owner drains it from its writable
/// callback via [`TcpConnection::flush`]. Reads never block and report
/// short counts.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    wbuf: BytesMut,
    connecting: bool,
}

/// Outcome of a non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were read.
    Data(usize),
    /// The socket has no data right now.
    WouldBlock,
    /// The peer closed its write side.
    Eof,
}

impl TcpConnection {
    /// Adopts an already-connected fd (from `accept4`); the fd must be
    /// non-blocking and close-on-exec.
    pub fn from_accepted(fd: OwnedFd, peer: Option<SocketAddr>) -> Self {
        Self {
            stream: TcpStream::from(fd),
            peer,
            wbuf: BytesMut::new(),
            connecting: false,
        }
    }

    /// Starts a non-blocking connect; completion is signalled by the fd
    /// becoming writable, after which the caller invokes
    /// [`TcpConnection::finish_connect`].
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let fd = socket(
            family,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("socket() failed")?;

        let res = match addr {
            SocketAddr::V4(v4) => {
                connect(fd.as_raw_fd(), &SockaddrIn::from(v4))
            },
            SocketAddr::V6(v6) => {
                connect(fd.as_raw_fd(), &SockaddrIn6::from(v6))
            },
        };
        match res {
            Ok(()) | Err(Errno::EINPROGRESS) => {},
            Err(e) => return Err(e).context("connect() failed"),
        }

        Ok(Self {
            stream: TcpStream::from(fd),
            peer: Some(addr),
            wbuf: BytesMut::new(),
            connecting: true,
        })
    }

    /// Resolves the pending connect once the fd reported writable.
    pub fn finish_connect(&mut self) -> Result<()> {
        if !self.connecting {
            return Ok(());
        }
        let err = getsockopt(&self.stream, sockopt::SocketError)
            .context("getsockopt(SO_ERROR) failed")?;
        if err != 0 {
            bail!("connect failed: {}", Errno::from_raw(err));
        }
        self.connecting = false;
        Ok(())
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Peer IP as text, captured at accept time.
    pub fn peer_ip(&self) -> String {
        self.peer
            .map(|a| a.ip().to_string())
            .unwrap_or_default()
    }

    /// Attempts an immediate send; whatever the kernel does not take is
    /// kept for the next writable event.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.wbuf.is_empty() || self.connecting {
            self.wbuf.extend_from_slice(data);
            return Ok(());
        }
        let mut off = 0;
        while off < data.len() {
            match self.stream.write(&data[off..]) {
                Ok(0) => break,
                Ok(n) => off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("send failed"),
            }
        }
        if off < data.len() {
            self.wbuf.extend_from_slice(&data[off..]);
            trace!(fd = self.fd(), pending = self.wbuf.len(), "short write");
        }
        Ok(())
    }

    /// Drains the pending-write buffer. Returns true once it is empty.
    pub fn flush(&mut self) -> Result<bool> {
        while !self.wbuf.is_empty() {
            match self.stream.write(self.wbuf.chunk()) {
                Ok(0) => break,
                Ok(n) => self.wbuf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("send failed"),
            }
        }
        Ok(self.wbuf.is_empty())
    }

    /// True while buffered bytes are waiting for a writable event.
    pub fn wants_write(&self) -> bool {
        self.connecting || !self.wbuf.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.wbuf.len()
    }

    /// Non-blocking read into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        loop {
            return match self.stream.read(buf) {
                Ok(0) => Ok(ReadOutcome::Eof),
                Ok(n) => Ok(ReadOutcome::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    Ok(ReadOutcome::WouldBlock)
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e).context("recv failed"),
            };
        }
    }

    /// Half-closes the write side after the last byte went out.
    pub fn shutdown_write(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Write);
    }
}

// The raw fd is used as the map key and epoll token by owners.
impl AsRawFd for TcpConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Adopts a raw fd produced by `accept4`.
///
/// Safety: the caller must own the fd and hand it over exactly once.
pub(crate) unsafe fn owned_from_raw(fd: RawFd) -> OwnedFd {
    unsafe { OwnedFd::from_raw_fd(fd) }
}
