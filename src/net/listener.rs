// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::{SocketAddr, SocketAddrV4, SocketAddrV6},
    os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use anyhow::{Context, Result};
use nix::{
    errno::Errno,
    fcntl::{
        FcntlArg::{F_GETFD, F_GETFL, F_SETFD, F_SETFL},
        FdFlag, OFlag, fcntl,
    },
    sys::socket::{
        AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrIn6,
        SockaddrStorage, accept4, bind, getpeername, getsockname, listen,
        setsockopt, socket, sockopt,
    },
};
use tracing::{debug, info};

use crate::net::conn::{TcpConnection, owned_from_raw};

/// A non-blocking listening socket.
///
/// Binds dual-stack when the host supports it (IPv6 with `V6ONLY` off),
/// falling back to plain IPv4. Sockets inherited across a binary upgrade
/// are adopted instead of bound afresh.
#[derive(Debug)]
pub struct TcpListener {
    fd: OwnedFd,
    addr: SocketAddr,
}

impl TcpListener {
    /// Binds `addr` with SO_REUSEADDR, the given backlog, non-blocking and
    /// close-on-exec.
    pub fn bind(addr: SocketAddr, backlog: i32) -> Result<Self> {
        match addr {
            SocketAddr::V6(v6) => Self::bind_v6(v6, backlog),
            SocketAddr::V4(v4) => Self::bind_v4(v4, backlog),
        }
    }

    /// Binds the wildcard address on `port`, preferring a dual-stack
    /// socket.
    pub fn bind_any(port: u16, backlog: i32) -> Result<Self> {
        let v6 = SocketAddrV6::new(std::net::Ipv6Addr::UNSPECIFIED, port, 0, 0);
        match Self::bind_v6(v6, backlog) {
            Ok(listener) => Ok(listener),
            Err(e) => {
                debug!(error = %e, "IPv6 bind failed, falling back to IPv4");
                let v4 =
                    SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port);
                Self::bind_v4(v4, backlog)
            },
        }
    }

    fn bind_v6(addr: SocketAddrV6, backlog: i32) -> Result<Self> {
        let fd = socket(
            AddressFamily::Inet6,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("socket(AF_INET6) failed")?;
        setsockopt(&fd, sockopt::ReuseAddr, &true)
            .context("setsockopt(SO_REUSEADDR) failed")?;
        // Dual-stack: accept IPv4 peers on the same socket where supported.
        if let Err(e) = setsockopt(&fd, sockopt::Ipv6V6Only, &false) {
            debug!(error = %e, "IPV6_V6ONLY=0 not supported");
        }
        bind(fd.as_raw_fd(), &SockaddrIn6::from(addr))
            .with_context(|| format!("bind {addr} failed"))?;
        listen(&fd, Backlog::new(backlog).unwrap_or(Backlog::MAXCONN))
            .context("listen failed")?;
        // Re-read the address: port 0 resolves to the kernel's pick.
        let addr = local_addr(fd.as_raw_fd())?;
        info!(%addr, "listening");
        Ok(Self { fd, addr })
    }

    fn bind_v4(addr: SocketAddrV4, backlog: i32) -> Result<Self> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("socket(AF_INET) failed")?;
        setsockopt(&fd, sockopt::ReuseAddr, &true)
            .context("setsockopt(SO_REUSEADDR) failed")?;
        bind(fd.as_raw_fd(), &SockaddrIn::from(addr))
            .with_context(|| format!("bind {addr} failed"))?;
        listen(&fd, Backlog::new(backlog).unwrap_or(Backlog::MAXCONN))
            .context("listen failed")?;
        let addr = local_addr(fd.as_raw_fd())?;
        info!(%addr, "listening");
        Ok(Self { fd, addr })
    }

    /// Adopts an inherited listening fd (binary upgrade). The fd keeps its
    /// bound address; non-blocking and close-on-exec are re-applied since
    /// exec cleared them.
    pub fn from_inherited(raw: RawFd) -> Result<Self> {
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let flags = fcntl(fd.as_raw_fd(), F_GETFL).context("F_GETFL failed")?;
        fcntl(
            fd.as_raw_fd(),
            F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .context("F_SETFL failed")?;
        let fdflags = fcntl(fd.as_raw_fd(), F_GETFD).context("F_GETFD failed")?;
        fcntl(
            fd.as_raw_fd(),
            F_SETFD(
                FdFlag::from_bits_truncate(fdflags) | FdFlag::FD_CLOEXEC,
            ),
        )
        .context("F_SETFD failed")?;

        let addr = local_addr(fd.as_raw_fd())?;
        info!(%addr, fd = raw, "adopted inherited listener");
        Ok(Self { fd, addr })
    }

    /// Clears close-on-exec so the fd survives a binary-upgrade exec.
    pub fn clear_cloexec(&self) -> Result<()> {
        fcntl(self.fd.as_raw_fd(), F_SETFD(FdFlag::empty()))
            .context("F_SETFD failed")?;
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts one pending connection; `None` when the backlog is empty.
    pub fn accept(&self) -> Result<Option<TcpConnection>> {
        let raw = match accept4(
            self.fd.as_raw_fd(),
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(raw) => raw,
            Err(Errno::EAGAIN) => return Ok(None),
            Err(Errno::ECONNABORTED) => return Ok(None),
            Err(e) => return Err(e).context("accept4 failed"),
        };
        let fd = unsafe { owned_from_raw(raw) };
        let peer = peer_addr(raw);
        Ok(Some(TcpConnection::from_accepted(fd, peer)))
    }
}

fn peer_addr(fd: RawFd) -> Option<SocketAddr> {
    let storage: SockaddrStorage = getpeername(fd).ok()?;
    sockaddr_to_std(&storage)
}

fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let storage: SockaddrStorage =
        getsockname(fd).context("getsockname failed")?;
    sockaddr_to_std(&storage).context("unsupported socket family")
}

fn sockaddr_to_std(storage: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(v4) = storage.as_sockaddr_in() {
        return Some(SocketAddr::V4(SocketAddrV4::new(
            v4.ip(),
            v4.port(),
        )));
    }
    if let Some(v6) = storage.as_sockaddr_in6() {
        return Some(SocketAddr::V6(SocketAddrV6::new(
            v6.ip(),
            v6.port(),
            v6.flowinfo(),
            v6.scope_id(),
        )));
    }
    None
}
