// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    rc::Rc,
    time::Duration,
};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::{
    event::{EventLoop, Ready},
    pg::{
        connection::{PgConnection, PgState, QueryCallback},
        protocol::PgConnInfo,
        result::PgResult,
    },
};

pub use crate::pg::connection::PgNotification;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PgPoolConfig {
    pub info: PgConnInfo,
    /// Connections opened at start.
    pub min: usize,
    /// Hard ceiling for on-demand growth.
    pub max: usize,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self { info: PgConnInfo::default(), min: 1, max: 4 }
    }
}

type NotifyCallback = Rc<RefCell<dyn FnMut(&mut EventLoop, &PgNotification)>>;

struct Slot {
    conn: PgConnection,
    is_listener: bool,
    backoff: Duration,
}

/// A pending LISTEN/UNLISTEN statement for the listener connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ListenerCmd {
    Listen(String),
    Unlisten(String),
}

struct PoolInner {
    cfg: PgPoolConfig,
    slots: Vec<Slot>,
    listener: Option<usize>,
    queue: VecDeque<(String, QueryCallback)>,
    channels: HashMap<String, NotifyCallback>,
    subscribed: HashSet<String>,
    shutting_down: bool,
}

enum Action {
    Complete(QueryCallback, Vec<PgResult>),
    Notify(NotifyCallback, PgNotification),
    Teardown(usize, String),
}

/// Cloneable handle to the connection pool.
///
/// All queries funnel through one FIFO; the head of the queue is sent the
/// moment any non-listener connection is Ready. A dedicated listener
/// connection carries LISTEN/UNLISTEN and fans notifications out to the
/// channel subscribers; it never runs queries.
///
/// Drop order matters for embedders: shut the pool down (or drop it)
/// before the EventLoop, since teardown deregisters its fd watches.
#[derive(Clone)]
pub struct PgPool {
    inner: Rc<RefCell<PoolInner>>,
}

impl PgPool {
    pub fn new(cfg: PgPoolConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PoolInner {
                cfg,
                slots: Vec::new(),
                listener: None,
                queue: VecDeque::new(),
                channels: HashMap::new(),
                subscribed: HashSet::new(),
                shutting_down: false,
            })),
        }
    }

    /// Opens `min` query connections plus the listener.
    pub fn start(&self, el: &mut EventLoop) -> Result<()> {
        let (min, info) = {
            let inner = self.inner.borrow();
            (inner.cfg.min.max(1), inner.cfg.info.clone())
        };
        for _ in 0..min {
            let idx = self.add_slot(PgConnection::new(info.clone()), false);
            self.open_slot(el, idx);
        }
        let idx = self.add_slot(PgConnection::new(info), true);
        self.inner.borrow_mut().listener = Some(idx);
        self.open_slot(el, idx);
        info!(connections = min, "pg pool started");
        Ok(())
    }

    /// Queues `sql`; dispatched FIFO as soon as a connection is Ready.
    pub fn execute<F>(&self, el: &mut EventLoop, sql: &str, callback: F)
    where F: FnOnce(&mut EventLoop, Vec<PgResult>) + 'static {
        self.inner
            .borrow_mut()
            .queue
            .push_back((sql.to_string(), Box::new(callback)));
        self.kick(el);
    }

    /// Subscribes `channel`; re-armed automatically after a listener
    /// reconnect.
    pub fn listen<F>(&self, el: &mut EventLoop, channel: &str, callback: F)
    where F: FnMut(&mut EventLoop, &PgNotification) + 'static {
        self.inner.borrow_mut().channels.insert(
            channel.to_string(),
            Rc::new(RefCell::new(callback)),
        );
        self.kick(el);
    }

    /// Drops the subscription and issues UNLISTEN.
    pub fn unlisten(&self, el: &mut EventLoop, channel: &str) {
        self.inner.borrow_mut().channels.remove(channel);
        self.kick(el);
    }

    /// Queries waiting for a free connection.
    pub fn queue_size(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Number of query connections (the listener is not counted).
    pub fn connection_count(&self) -> usize {
        self.inner
            .borrow()
            .slots
            .iter()
            .filter(|s| !s.is_listener)
            .count()
    }

    /// Tears down every connection and fails whatever is still queued.
    /// Must run while the EventLoop is still alive.
    pub fn shutdown(&self, el: &mut EventLoop) {
        let (fds, waiting) = {
            let inner = &mut *self.inner.borrow_mut();
            inner.shutting_down = true;
            let fds: Vec<_> =
                inner.slots.iter().filter_map(|s| s.conn.fd()).collect();
            for slot in &mut inner.slots {
                slot.conn.close();
            }
            let waiting: Vec<_> = inner.queue.drain(..).collect();
            (fds, waiting)
        };
        for fd in fds {
            el.remove_io(fd);
        }
        for (_sql, cb) in waiting {
            cb(el, vec![PgResult::failure("pool shut down")]);
        }
        debug!("pg pool shut down");
    }

    // ── internals ────────────────────────────────────────────────────────

    fn add_slot(&self, conn: PgConnection, is_listener: bool) -> usize {
        let mut inner = self.inner.borrow_mut();
        inner.slots.push(Slot {
            conn,
            is_listener,
            backoff: INITIAL_BACKOFF,
        });
        inner.slots.len() - 1
    }

    fn open_slot(&self, el: &mut EventLoop, idx: usize) {
        let fd = {
            let mut inner = self.inner.borrow_mut();
            match inner.slots[idx].conn.start_connect() {
                Ok(fd) => fd,
                Err(e) => {
                    warn!(error = %e, "pg connect failed to start");
                    let slot = &mut inner.slots[idx];
                    slot.backoff = (slot.backoff * 2).min(MAX_BACKOFF);
                    drop(inner);
                    self.schedule_reconnect(el, idx);
                    return;
                },
            }
        };
        let pool = self.clone();
        if let Err(e) = el.add_io(
            fd,
            Ready::READABLE | Ready::WRITABLE | Ready::HANGUP,
            move |el, ready| pool.on_io(el, idx, ready),
        ) {
            error!(error = %e, "cannot watch pg socket");
            self.teardown(el, idx, "epoll registration failed");
        }
    }

    fn on_io(&self, el: &mut EventLoop, idx: usize, ready: Ready) {
        let mut actions = Vec::new();
        {
            let inner = &mut *self.inner.borrow_mut();
            let slot = &mut inner.slots[idx];
            let mut failed: Option<String> = None;

            if ready.contains(Ready::WRITABLE)
                && let Err(e) = slot.conn.on_writable()
            {
                failed = Some(e.to_string());
            }
            if failed.is_none()
                && ready.intersects(Ready::READABLE | Ready::HANGUP)
            {
                match slot.conn.on_readable() {
                    Ok(Some((cb, results))) => {
                        actions.push(Action::Complete(cb, results));
                    },
                    Ok(None) => {},
                    Err(e) => failed = Some(e.to_string()),
                }
            }
            if failed.is_none() && ready.contains(Ready::ERROR) {
                failed = Some("socket error".to_string());
            }

            // A healthy round trip resets the reconnect back-off.
            if failed.is_none() && slot.conn.state() == PgState::Ready {
                slot.backoff = INITIAL_BACKOFF;
            }

            for notification in slot.conn.take_notifications() {
                if let Some(cb) = inner.channels.get(&notification.channel) {
                    actions
                        .push(Action::Notify(Rc::clone(cb), notification));
                }
            }

            if let Some(message) = failed {
                if let Some((cb, results)) =
                    slot.conn.fail_inflight(&message)
                {
                    actions.push(Action::Complete(cb, results));
                }
                actions.push(Action::Teardown(idx, message));
            }
        }

        for action in actions {
            match action {
                Action::Complete(cb, results) => cb(el, results),
                Action::Notify(cb, notification) => {
                    (cb.borrow_mut())(el, &notification);
                },
                Action::Teardown(idx, message) => {
                    self.teardown(el, idx, &message);
                },
            }
        }
        self.kick(el);
    }

    fn teardown(&self, el: &mut EventLoop, idx: usize, message: &str) {
        let fd = {
            let inner = &mut *self.inner.borrow_mut();
            let slot = &mut inner.slots[idx];
            let fd = slot.conn.fd();
            slot.conn.close();
            slot.backoff = (slot.backoff * 2).min(MAX_BACKOFF);
            if slot.is_listener {
                // Subscriptions die with the connection; re-issued once
                // the replacement reaches Ready.
                inner.subscribed.clear();
            }
            fd
        };
        if let Some(fd) = fd {
            el.remove_io(fd);
        }
        warn!(idx, message, "pg connection lost, reconnecting");
        self.schedule_reconnect(el, idx);
    }

    fn schedule_reconnect(&self, el: &mut EventLoop, idx: usize) {
        let delay = {
            let inner = self.inner.borrow();
            if inner.shutting_down {
                return;
            }
            inner.slots[idx].backoff
        };
        let pool = self.clone();
        el.add_timer(delay, move |el| {
            if !pool.inner.borrow().shutting_down {
                pool.open_slot(el, idx);
            }
        });
    }

    /// Dispatches queued work to Ready connections, grows the pool when
    /// saturated, keeps listener subscriptions in sync and refreshes the
    /// epoll masks.
    fn kick(&self, el: &mut EventLoop) {
        loop {
            enum Step {
                Dispatch(usize, String, QueryCallback),
                Grow,
                Done,
            }
            let step = {
                let inner = &mut *self.inner.borrow_mut();
                if inner.queue.is_empty() || inner.shutting_down {
                    Step::Done
                } else {
                    let ready = inner.slots.iter().position(|s| {
                        !s.is_listener && s.conn.state() == PgState::Ready
                    });
                    match ready {
                        Some(idx) => {
                            let (sql, cb) = match inner.queue.pop_front() {
                                Some(entry) => entry,
                                None => break,
                            };
                            Step::Dispatch(idx, sql, cb)
                        },
                        None => {
                            let query_slots = inner
                                .slots
                                .iter()
                                .filter(|s| !s.is_listener)
                                .count();
                            let connecting = inner.slots.iter().any(|s| {
                                !s.is_listener
                                    && matches!(
                                        s.conn.state(),
                                        PgState::Connecting
                                            | PgState::Authenticating
                                    )
                            });
                            if query_slots < inner.cfg.max && !connecting {
                                Step::Grow
                            } else {
                                Step::Done
                            }
                        },
                    }
                }
            };

            match step {
                Step::Dispatch(idx, sql, cb) => {
                    let send_err = {
                        let inner = &mut *self.inner.borrow_mut();
                        inner.slots[idx].conn.send_query(&sql, cb).err()
                    };
                    if let Some(e) = send_err {
                        // The callback stays parked inside the slot;
                        // fail it and recycle the connection.
                        let failed = {
                            let inner = &mut *self.inner.borrow_mut();
                            inner.slots[idx]
                                .conn
                                .fail_inflight(&e.to_string())
                        };
                        if let Some((cb, results)) = failed {
                            cb(el, results);
                        }
                        self.teardown(el, idx, &e.to_string());
                    }
                },
                Step::Grow => {
                    let info = self.inner.borrow().cfg.info.clone();
                    debug!("pg pool growing on demand");
                    let idx = self.add_slot(PgConnection::new(info), false);
                    self.open_slot(el, idx);
                    break;
                },
                Step::Done => break,
            }
        }

        self.sync_listener(el);
        self.update_masks(el);
    }

    /// Brings the listener's LISTEN set in line with the subscriber map,
    /// one statement per Ready window.
    fn sync_listener(&self, el: &mut EventLoop) {
        let cmd = {
            let inner = &mut *self.inner.borrow_mut();
            let Some(idx) = inner.listener else {
                return;
            };
            if inner.slots[idx].conn.state() != PgState::Ready {
                return;
            }
            let wanted: HashSet<String> =
                inner.channels.keys().cloned().collect();
            let add = wanted.difference(&inner.subscribed).next().cloned();
            let remove =
                inner.subscribed.difference(&wanted).next().cloned();
            match (add, remove) {
                (Some(channel), _) => {
                    inner.subscribed.insert(channel.clone());
                    Some((idx, ListenerCmd::Listen(channel)))
                },
                (None, Some(channel)) => {
                    inner.subscribed.remove(&channel);
                    Some((idx, ListenerCmd::Unlisten(channel)))
                },
                (None, None) => None,
            }
        };

        let Some((idx, cmd)) = cmd else {
            return;
        };
        let sql = match &cmd {
            ListenerCmd::Listen(channel) => {
                format!("LISTEN \"{channel}\"")
            },
            ListenerCmd::Unlisten(channel) => {
                format!("UNLISTEN \"{channel}\"")
            },
        };
        let pool = self.clone();
        let send_err = {
            let inner = &mut *self.inner.borrow_mut();
            inner.slots[idx]
                .conn
                .send_query(
                    &sql,
                    Box::new(move |el, results| {
                        if let Some(r) =
                            results.iter().find(|r| !r.ok())
                        {
                            error!(error = r.error_message(),
                                   "listener command failed");
                        }
                        // More subscriptions may be pending.
                        pool.sync_listener(el);
                        pool.update_masks(el);
                    }),
                )
                .err()
        };
        if let Some(e) = send_err {
            self.teardown(el, idx, &e.to_string());
        }
    }

    /// Readable always; writable only while connecting or draining
    /// buffered output.
    fn update_masks(&self, el: &mut EventLoop) {
        let masks: Vec<(i32, Ready)> = {
            let inner = self.inner.borrow();
            inner
                .slots
                .iter()
                .filter_map(|slot| {
                    let fd = slot.conn.fd()?;
                    let mut mask = Ready::READABLE | Ready::HANGUP;
                    if slot.conn.wants_write()
                        || slot.conn.state() == PgState::Connecting
                    {
                        mask |= Ready::WRITABLE;
                    }
                    Some((fd, mask))
                })
                .collect()
        };
        for (fd, mask) in masks {
            if el.watch_mask(fd) == Some(mask) {
                continue;
            }
            if el.watch_mask(fd).is_some()
                && let Err(e) = el.modify_io(fd, mask)
            {
                warn!(fd, error = %e, "mask update failed");
            }
        }
    }
}

/// Maps the application's numeric error convention to an HTTP status:
/// the 401xx family → 401, 40300 → 403, 40400 → 404, everything else 400.
pub fn error_code_to_http(code: i64) -> u16 {
    crate::http::util::error_code_to_status(code)
}

impl PgPool {
    /// First failed result of a batch, if any; convenience for glue code.
    pub fn first_error(results: &[PgResult]) -> Option<&PgResult> {
        results.iter().find(|r| !r.ok())
    }
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("PgPool")
            .field("slots", &inner.slots.len())
            .field("queued", &inner.queue.len())
            .field("channels", &inner.channels.len())
            .finish()
    }
}
