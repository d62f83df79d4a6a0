//! The safe-fork protocol: children are controlled before their first
//! instruction.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use ntest::timeout;

use lariat::{HookAction, Options, Tracer};

mod support;
use support::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Entry {
    Created(i32),
    Event(i32),
}

#[test]
#[timeout(60000)]
fn safe_fork_adopts_the_child_before_it_runs() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::TRACE_CHILDREN | Options::SAFE_TRACE);

    // One ordered log of creations and events, so "notified before any
    // event" is checkable.
    let log = Arc::new(Mutex::new(Vec::new()));

    let creations = log.clone();
    tracer.on_child_create(move |child| {
        creations
            .lock()
            .unwrap()
            .push(Entry::Created(child.pid().as_raw()));
    });

    let events = log.clone();
    let fork_links = Arc::new(Mutex::new(Vec::new()));
    let links = fork_links.clone();
    tracer.set_default_hook(move |child, _event| {
        events.lock().unwrap().push(Entry::Event(child.pid().as_raw()));
        if let Some(new) = child.safe_fork_pid() {
            links.lock().unwrap().push((child.pid().as_raw(), new.as_raw()));
        }
        HookAction::Continue
    });

    // The shell forks for the first command, then exits.
    let root = tracer.spawn(cmd(&["/bin/sh", "-c", "/bin/true; exit 0"]))?;
    tracer.main()?;

    let log = log.lock().unwrap();

    let created: Vec<i32> = log
        .iter()
        .filter_map(|e| match e {
            Entry::Created(pid) => Some(*pid),
            _ => None,
        })
        .collect();

    // The root plus at least one safely forked child.
    assert!(created.contains(&root.as_raw()));
    let forked: Vec<i32> = created
        .iter()
        .copied()
        .filter(|&pid| pid != root.as_raw())
        .collect();
    assert!(!forked.is_empty(), "no child was adopted: {:?}", *log);

    // The parent's safe_fork_pid slot named an adopted child.
    let fork_links = fork_links.lock().unwrap();
    assert!(
        fork_links.iter().any(|&(_, new)| forked.contains(&new)),
        "safe_fork_pid never linked to an adopted child: {:?}",
        *fork_links
    );

    // Every adopted child produced events, and only after its creation
    // notification.
    for &pid in &forked {
        let born = log
            .iter()
            .position(|&e| e == Entry::Created(pid))
            .expect("creation was logged");
        let first_event = log.iter().position(|&e| e == Entry::Event(pid));
        let first_event =
            first_event.unwrap_or_else(|| panic!("no events from adopted child {}", pid));
        assert!(
            born < first_event,
            "child {} produced an event before its creation notification",
            pid
        );
    }

    Ok(())
}

#[test]
#[timeout(60000)]
fn kernel_auto_attach_still_works_without_safe_trace() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::TRACE_CHILDREN);

    let log = Arc::new(Mutex::new(Vec::new()));

    let creations = log.clone();
    tracer.on_child_create(move |child| {
        creations
            .lock()
            .unwrap()
            .push(Entry::Created(child.pid().as_raw()));
    });

    let events = log.clone();
    tracer.set_default_hook(move |child, _event| {
        events.lock().unwrap().push(Entry::Event(child.pid().as_raw()));
        HookAction::Continue
    });

    let root = tracer.spawn(cmd(&["/bin/sh", "-c", "/bin/true; exit 0"]))?;
    tracer.main()?;

    let log = log.lock().unwrap();
    let forked: Vec<i32> = log
        .iter()
        .filter_map(|e| match e {
            Entry::Created(pid) if *pid != root.as_raw() => Some(*pid),
            _ => None,
        })
        .collect();
    assert!(!forked.is_empty(), "no child was adopted: {:?}", *log);

    for &pid in &forked {
        let born = log.iter().position(|&e| e == Entry::Created(pid)).unwrap();
        let first_event = log.iter().position(|&e| e == Entry::Event(pid));
        if let Some(first_event) = first_event {
            assert!(born < first_event);
        }
    }

    Ok(())
}
