// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Live-database scenarios. They need a reachable PostgreSQL described
//! by the standard PG* environment variables and only run when
//! `PORTICO_TEST_PG` is set; otherwise each test is a silent pass.

use std::{cell::RefCell, rc::Rc, time::Duration};

use anyhow::Result;
use portico::{
    event::EventLoop,
    pg::{PgConnInfo, PgPool, pool::PgPoolConfig},
};

fn pg_enabled() -> bool {
    std::env::var("PORTICO_TEST_PG").is_ok()
}

fn live_pool(min: usize, max: usize) -> (EventLoop, PgPool) {
    let el = EventLoop::new().expect("event loop");
    let pool = PgPool::new(PgPoolConfig {
        info: PgConnInfo::from_env(),
        min,
        max,
    });
    (el, pool)
}

/// Runs the loop until `done` reports true or the timeout trips.
fn drive(el: &mut EventLoop, done: Rc<RefCell<bool>>, timeout: Duration) {
    let flag = Rc::clone(&done);
    el.add_periodic(
        Duration::from_millis(10),
        Duration::from_millis(10),
        move |el| {
            if *flag.borrow() {
                el.stop();
            }
        },
    );
    el.add_timer(timeout, |el| el.stop());
    el.run().expect("loop runs");
}

#[test]
fn select_42_returns_text_value() -> Result<()> {
    if !pg_enabled() {
        return Ok(());
    }
    let (mut el, pool) = live_pool(1, 2);
    pool.start(&mut el)?;

    let done = Rc::new(RefCell::new(false));
    let value = Rc::new(RefCell::new(None));

    let flag = Rc::clone(&done);
    let slot = Rc::clone(&value);
    pool.execute(&mut el, "SELECT 42::int4 AS v", move |_el, results| {
        let result = results.first().expect("one result");
        assert!(result.ok(), "query failed: {}", result.error_message());
        assert_eq!(result.nfields(), 1);
        assert_eq!(result.column_name(0), Some("v"));
        *slot.borrow_mut() =
            result.value(0, 0).map(str::to_string);
        *flag.borrow_mut() = true;
    });

    drive(&mut el, done, Duration::from_secs(10));
    assert_eq!(value.borrow().as_deref(), Some("42"));
    pool.shutdown(&mut el);
    Ok(())
}

#[test]
fn queries_are_fifo_on_a_single_connection() -> Result<()> {
    if !pg_enabled() {
        return Ok(());
    }
    let (mut el, pool) = live_pool(1, 1);
    pool.start(&mut el)?;

    let done = Rc::new(RefCell::new(false));
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 1..=3 {
        let order = Rc::clone(&order);
        let flag = Rc::clone(&done);
        pool.execute(
            &mut el,
            &format!("SELECT {i}::int4 AS v"),
            move |_el, results| {
                let value = results
                    .first()
                    .and_then(|r| r.value(0, 0))
                    .map(str::to_string);
                order.borrow_mut().push(value);
                if i == 3 {
                    *flag.borrow_mut() = true;
                }
            },
        );
    }
    // With max=1 the tail waits in the queue.
    assert!(pool.queue_size() >= 2);

    drive(&mut el, done, Duration::from_secs(10));
    assert_eq!(
        *order.borrow(),
        vec![
            Some("1".to_string()),
            Some("2".to_string()),
            Some("3".to_string())
        ]
    );
    pool.shutdown(&mut el);
    Ok(())
}

#[test]
fn bad_sql_surfaces_as_error_result() -> Result<()> {
    if !pg_enabled() {
        return Ok(());
    }
    let (mut el, pool) = live_pool(1, 1);
    pool.start(&mut el)?;

    let done = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&done);
    pool.execute(&mut el, "SELECT * FROM no_such_table_42", move |_el, results| {
        let result = results.first().expect("one result");
        assert!(!result.ok());
        assert!(!result.error_message().is_empty());
        *flag.borrow_mut() = true;
    });

    drive(&mut el, done, Duration::from_secs(10));

    // The connection survives a per-query error.
    let done = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&done);
    pool.execute(&mut el, "SELECT 1", move |_el, results| {
        assert!(results.first().is_some_and(|r| r.ok()));
        *flag.borrow_mut() = true;
    });
    drive(&mut el, done, Duration::from_secs(10));
    pool.shutdown(&mut el);
    Ok(())
}

#[test]
fn listen_notify_fan_out() -> Result<()> {
    if !pg_enabled() {
        return Ok(());
    }
    let (mut el, pool) = live_pool(1, 2);
    pool.start(&mut el)?;

    let done = Rc::new(RefCell::new(false));
    let alpha = Rc::new(RefCell::new(None));
    let beta = Rc::new(RefCell::new(None));

    let slot = Rc::clone(&alpha);
    pool.listen(&mut el, "portico_chan_a", move |_el, note| {
        *slot.borrow_mut() = Some(note.payload.clone());
    });
    let slot = Rc::clone(&beta);
    let flag = Rc::clone(&done);
    pool.listen(&mut el, "portico_chan_b", move |_el, note| {
        *slot.borrow_mut() = Some(note.payload.clone());
        *flag.borrow_mut() = true;
    });

    // Let the LISTEN statements land before notifying.
    let pool_clone = pool.clone();
    el.add_timer(Duration::from_millis(500), move |el| {
        pool_clone.execute(
            el,
            "SELECT pg_notify('portico_chan_a','alpha'), \
             pg_notify('portico_chan_b','beta')",
            |_el, results| {
                assert!(results.first().is_some_and(|r| r.ok()));
            },
        );
    });

    drive(&mut el, done, Duration::from_secs(10));
    assert_eq!(alpha.borrow().as_deref(), Some("alpha"));
    assert_eq!(beta.borrow().as_deref(), Some("beta"));
    pool.shutdown(&mut el);
    Ok(())
}
