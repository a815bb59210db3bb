// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::RefCell,
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    os::fd::{AsFd, BorrowedFd, RawFd},
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use bitflags::bitflags;
use nix::{
    errno::Errno,
    sys::{
        epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
        signal::{SigmaskHow, Signal, sigprocmask},
        signalfd::{SfdFlags, SigSet, SignalFd},
    },
};
use tracing::{error, trace};

bitflags! {
    /// Readiness interest / delivery mask for an fd watch.
    ///
    /// `HANGUP` and `ERROR` are always delivered regardless of the
    /// registered interest; requesting `HANGUP` additionally arms
    /// `EPOLLRDHUP` so a peer half-close is observed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const HANGUP   = 0b0100;
        const ERROR    = 0b1000;
    }
}

impl Ready {
    fn to_epoll(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.contains(Ready::READABLE) {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.contains(Ready::WRITABLE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        if self.contains(Ready::HANGUP) {
            flags |= EpollFlags::EPOLLRDHUP;
        }
        flags
    }

    fn from_epoll(flags: EpollFlags) -> Self {
        let mut ready = Ready::empty();
        if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI) {
            ready |= Ready::READABLE;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            ready |= Ready::WRITABLE;
        }
        if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP) {
            ready |= Ready::HANGUP;
        }
        if flags.contains(EpollFlags::EPOLLERR) {
            ready |= Ready::ERROR;
        }
        ready
    }
}

/// Identifier of a scheduled timer. Monotonic within one loop.
pub type TimerId = u64;

type IoCallback = Rc<RefCell<dyn FnMut(&mut EventLoop, Ready)>>;
type TimerCallback = Rc<RefCell<dyn FnMut(&mut EventLoop)>>;
type SignalCallback = Rc<RefCell<dyn FnMut(&mut EventLoop, Signal)>>;

struct IoWatch {
    mask: Ready,
    r#gen: u32,
    cb: IoCallback,
}

struct TimerEntry {
    deadline: Instant,
    /// Zero for a one-shot timer.
    interval: Duration,
    cb: TimerCallback,
}

/// Epoll data slot reserved for the signalfd.
const SIGNAL_TOKEN: u64 = u64::MAX;

fn pack(fd: RawFd, r#gen: u32) -> u64 {
    ((r#gen as u64) << 32) | (fd as u32 as u64)
}

fn unpack(data: u64) -> (RawFd, u32) {
    (data as u32 as RawFd, (data >> 32) as u32)
}

/// Single-threaded cooperative event loop.
///
/// One instance per process; every I/O, timer and signal callback runs on
/// the thread that called [`EventLoop::run`]. Callbacks must not block:
/// anything that waits is split over readiness events or timers.
///
/// A callback may freely mutate the loop it runs on, including removing
/// its own registration: event delivery is guarded by a per-watch
/// generation counter, so a watch removed (or removed and re-added) inside
/// the current wake-up batch never receives a stale event.
pub struct EventLoop {
    epoll: Epoll,
    watches: HashMap<RawFd, IoWatch>,
    timers: HashMap<TimerId, TimerEntry>,
    timer_queue: BinaryHeap<Reverse<(Instant, TimerId)>>,
    next_timer_id: TimerId,
    next_gen: u32,
    signal_fd: Option<SignalFd>,
    signal_mask: SigSet,
    signal_cbs: HashMap<i32, SignalCallback>,
    running: bool,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("epoll_create1 failed")?;
        Ok(Self {
            epoll,
            watches: HashMap::new(),
            timers: HashMap::new(),
            timer_queue: BinaryHeap::new(),
            next_timer_id: 1,
            next_gen: 1,
            signal_fd: None,
            signal_mask: SigSet::empty(),
            signal_cbs: HashMap::new(),
            running: false,
        })
    }

    // ── timers ───────────────────────────────────────────────────────────

    /// Schedules a one-shot timer `delay` from now.
    pub fn add_timer<F>(&mut self, delay: Duration, cb: F) -> TimerId
    where F: FnMut(&mut EventLoop) + 'static {
        self.schedule(delay, Duration::ZERO, Rc::new(RefCell::new(cb)))
    }

    /// Schedules a repeating timer: first fire after `delay`, then every
    /// `interval`.
    pub fn add_periodic<F>(
        &mut self,
        delay: Duration,
        interval: Duration,
        cb: F,
    ) -> TimerId
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        self.schedule(delay, interval, Rc::new(RefCell::new(cb)))
    }

    fn schedule(
        &mut self,
        delay: Duration,
        interval: Duration,
        cb: TimerCallback,
    ) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let deadline = Instant::now() + delay;
        self.timers.insert(id, TimerEntry { deadline, interval, cb });
        self.timer_queue.push(Reverse((deadline, id)));
        id
    }

    /// Cancels a timer. Unknown or already-fired ids are a no-op; calling
    /// this from inside the timer's own callback is safe.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    // ── fd watches ───────────────────────────────────────────────────────

    /// Registers a readiness watch for `fd`. The watch never takes
    /// ownership of the fd; the registering component keeps it alive until
    /// [`EventLoop::remove_io`].
    pub fn add_io<F>(&mut self, fd: RawFd, mask: Ready, cb: F) -> Result<()>
    where F: FnMut(&mut EventLoop, Ready) + 'static {
        let r#gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1);

        let mut event = EpollEvent::new(mask.to_epoll(), pack(fd, r#gen));
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if self.watches.contains_key(&fd) {
            self.epoll
                .modify(borrowed, &mut event)
                .with_context(|| format!("epoll_ctl(MOD) failed for fd {fd}"))?;
        } else {
            self.epoll
                .add(borrowed, event)
                .with_context(|| format!("epoll_ctl(ADD) failed for fd {fd}"))?;
        }

        self.watches
            .insert(fd, IoWatch { mask, r#gen, cb: Rc::new(RefCell::new(cb)) });
        Ok(())
    }

    /// Replaces the interest mask of an existing watch, keeping its
    /// callback.
    pub fn modify_io(&mut self, fd: RawFd, mask: Ready) -> Result<()> {
        let watch = self
            .watches
            .get_mut(&fd)
            .with_context(|| format!("modify_io on unwatched fd {fd}"))?;
        watch.mask = mask;
        let mut event = EpollEvent::new(mask.to_epoll(), pack(fd, watch.r#gen));
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .modify(borrowed, &mut event)
            .with_context(|| format!("epoll_ctl(MOD) failed for fd {fd}"))?;
        Ok(())
    }

    /// Removes a watch. Idempotent: removing an unwatched fd is a no-op.
    pub fn remove_io(&mut self, fd: RawFd) {
        if self.watches.remove(&fd).is_none() {
            return;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        // The fd may already be closed by its owner; both outcomes are fine.
        if let Err(e) = self.epoll.delete(borrowed)
            && e != Errno::ENOENT
            && e != Errno::EBADF
        {
            trace!(fd, error = %e, "epoll_ctl(DEL) failed");
        }
    }

    pub fn watch_mask(&self, fd: RawFd) -> Option<Ready> {
        self.watches.get(&fd).map(|w| w.mask)
    }

    // ── signals ──────────────────────────────────────────────────────────

    /// Routes `signal` through a signalfd multiplexed on the same epoll.
    ///
    /// The signal is blocked for the whole process before the signalfd is
    /// (re-)armed, otherwise default disposition would win the race.
    pub fn add_signal<F>(&mut self, signal: Signal, cb: F) -> Result<()>
    where F: FnMut(&mut EventLoop, Signal) + 'static {
        self.signal_mask.add(signal);

        let mut block = SigSet::empty();
        block.add(signal);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&block), None)
            .context("sigprocmask(SIG_BLOCK) failed")?;

        match &mut self.signal_fd {
            Some(sfd) => {
                sfd.set_mask(&self.signal_mask)
                    .context("signalfd mask update failed")?;
            },
            None => {
                let sfd = SignalFd::with_flags(
                    &self.signal_mask,
                    SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC,
                )
                .context("signalfd creation failed")?;
                let event =
                    EpollEvent::new(EpollFlags::EPOLLIN, SIGNAL_TOKEN);
                self.epoll
                    .add(sfd.as_fd(), event)
                    .context("epoll_ctl(ADD) failed for signalfd")?;
                self.signal_fd = Some(sfd);
            },
        }

        self.signal_cbs
            .insert(signal as i32, Rc::new(RefCell::new(cb)));
        Ok(())
    }

    /// Drops the subscription for `signal`; the signal stays blocked so a
    /// later [`EventLoop::add_signal`] can re-arm it without racing.
    pub fn remove_signal(&mut self, signal: Signal) {
        self.signal_cbs.remove(&(signal as i32));
    }

    // ── driving ──────────────────────────────────────────────────────────

    /// Runs until [`EventLoop::stop`] is called. Epoll failures are fatal.
    pub fn run(&mut self) -> Result<()> {
        self.running = true;
        let mut events = vec![EpollEvent::empty(); 256];

        while self.running {
            let timeout = self.next_timeout();
            let n = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => 0,
                Err(e) => {
                    error!(error = %e, "epoll_wait failed, terminating loop");
                    return Err(e).context("epoll_wait failed");
                },
            };

            for event in &events[..n] {
                if !self.running {
                    break;
                }
                if event.data() == SIGNAL_TOKEN {
                    self.drain_signals();
                    continue;
                }

                let (fd, r#gen) = unpack(event.data());
                // Skip events whose watch was removed or replaced earlier
                // in this same batch.
                let cb = match self.watches.get(&fd) {
                    Some(w) if w.r#gen == r#gen => Rc::clone(&w.cb),
                    _ => continue,
                };
                let ready = Ready::from_epoll(event.events());
                (cb.borrow_mut())(self, ready);
            }

            if self.running {
                self.fire_due_timers();
            }
        }
        Ok(())
    }

    /// Requests loop termination; honoured between callbacks.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn drain_signals(&mut self) {
        loop {
            let info = match &mut self.signal_fd {
                Some(sfd) => match sfd.read_signal() {
                    Ok(Some(info)) => info,
                    Ok(None) => break,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        error!(error = %e, "signalfd read failed");
                        break;
                    },
                },
                None => break,
            };

            let signo = info.ssi_signo as i32;
            let Ok(signal) = Signal::try_from(signo) else {
                continue;
            };
            if let Some(cb) = self.signal_cbs.get(&signo).map(Rc::clone) {
                (cb.borrow_mut())(self, signal);
            }
            if !self.running {
                break;
            }
        }
    }

    /// Pops stale heads (cancelled or re-armed timers) and converts the
    /// earliest live deadline into an epoll timeout.
    fn next_timeout(&mut self) -> EpollTimeout {
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = self.timer_queue.peek() {
            match self.timers.get(id) {
                Some(entry) if entry.deadline == *deadline => {
                    let remaining = deadline.saturating_duration_since(now);
                    // Capped wait; the loop simply re-waits for far-away
                    // deadlines.
                    let millis =
                        remaining.as_millis().min(u16::MAX as u128) as u16;
                    return EpollTimeout::from(millis);
                },
                _ => {
                    self.timer_queue.pop();
                },
            }
        }
        EpollTimeout::NONE
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        loop {
            let id = match self.timer_queue.peek() {
                Some(Reverse((deadline, id))) if *deadline <= now => {
                    let id = *id;
                    let deadline = *deadline;
                    self.timer_queue.pop();
                    match self.timers.get(&id) {
                        // Stale heap entry: cancelled, or re-armed with a
                        // newer deadline.
                        Some(entry) if entry.deadline != deadline => continue,
                        None => continue,
                        Some(_) => id,
                    }
                },
                _ => break,
            };

            let Some(entry) = self.timers.get(&id) else {
                continue;
            };
            let cb = Rc::clone(&entry.cb);
            let interval = entry.interval;

            (cb.borrow_mut())(self);

            if interval.is_zero() {
                self.timers.remove(&id);
            } else if let Some(entry) = self.timers.get_mut(&id) {
                // Still present: the callback did not cancel it.
                entry.deadline = now + interval;
                let deadline = entry.deadline;
                self.timer_queue.push(Reverse((deadline, id)));
            }

            if !self.running {
                break;
            }
        }
    }
}
