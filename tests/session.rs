//! Session lifecycle: spawning, waiting, bookkeeping, shutdown.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use ntest::timeout;

use lariat::{Error, EventKind, HookAction, Options, Pid, Tracer};

mod support;
use support::*;

#[test]
fn wait_with_no_tracees_quits() {
    init_logging();

    let mut tracer = Tracer::new(Options::empty());
    let ev = tracer.wait_event(None).unwrap();

    assert_eq!(ev.kind, EventKind::Quit);
    assert!(ev.pid.is_none());
}

#[test]
#[timeout(10000)]
fn attach_to_dead_pid_is_refused() -> Result<()> {
    init_logging();

    // A pid that is guaranteed stale: spawn and fully reap a process.
    let mut child = std::process::Command::new("/bin/true").spawn()?;
    child.wait()?;
    let stale = Pid::from_raw(child.id() as i32);

    let mut tracer = Tracer::new(Options::empty());
    let err = tracer.attach(stale).unwrap_err();

    assert!(matches!(err, Error::Attach { .. }));
    assert_eq!(tracer.children_count(), 0);

    Ok(())
}

#[test]
#[timeout(30000)]
fn children_count_tracks_admissions_and_removals() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::empty());
    assert_eq!(tracer.children_count(), 0);

    let pid = tracer.spawn(cmd(&["/bin/sleep", "30"]))?;
    assert_eq!(tracer.children_count(), 1);
    assert_eq!(tracer.root_pid(), Some(pid));
    assert!(tracer.child(pid).is_some());

    tracer.kill_child(pid)?;
    assert_eq!(tracer.children_count(), 0);
    assert!(tracer.child(pid).is_none());

    Ok(())
}

#[test]
#[timeout(30000)]
fn remove_child_forgets_without_killing() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::empty());
    let pid = tracer.spawn(cmd(&["/bin/sleep", "30"]))?;

    tracer.remove_child(pid)?;
    assert_eq!(tracer.children_count(), 0);
    assert!(matches!(
        tracer.remove_child(pid),
        Err(Error::UnknownChild { .. })
    ));

    // The forgotten process is still ours to clean up.
    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
    let _ = nix::sys::wait::waitpid(pid, None);

    Ok(())
}

#[test]
#[timeout(30000)]
fn trace_true_until_quit() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::empty());

    // Record the PRE/POST phase of every syscall event the hook consumes.
    let phases = Arc::new(Mutex::new(Vec::new()));
    let recorder = phases.clone();
    tracer.set_default_hook(move |child, event| {
        assert_eq!(event.kind, EventKind::Syscall);
        recorder.lock().unwrap().push(child.is_pre_syscall());
        HookAction::Continue
    });

    tracer.spawn(cmd(&["/bin/true"]))?;

    loop {
        let ev = tracer.wait_event(None)?;
        if ev.kind == EventKind::Quit && ev.pid.is_none() {
            break;
        }
        tracer.continue_event(&ev)?;
    }

    assert_eq!(tracer.children_count(), 0);

    // A finite trace of syscall events, strictly alternating starting at PRE.
    let phases = phases.lock().unwrap();
    assert!(!phases.is_empty());
    for (i, pre) in phases.iter().enumerate() {
        assert_eq!(*pre, i % 2 == 0, "phase inverted at event {}", i);
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn kill_child_hook_action_removes_the_tracee() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::empty());
    tracer.set_default_hook(|_, _| HookAction::KillChild);

    tracer.spawn(cmd(&["/bin/sleep", "30"]))?;

    // The first syscall event triggers the kill; the registry then drains.
    let ev = tracer.wait_event(None)?;
    assert_eq!(ev.kind, EventKind::Quit);
    assert!(ev.pid.is_none());
    assert_eq!(tracer.children_count(), 0);

    Ok(())
}

#[test]
#[timeout(30000)]
fn abort_hook_action_tears_the_session_down() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::empty());
    tracer.set_default_hook(|_, _| HookAction::Abort);

    let pid = tracer.spawn(cmd(&["/bin/sleep", "30"]))?;

    let ev = tracer.wait_event(None)?;
    assert_eq!(ev.kind, EventKind::Quit);
    assert_eq!(ev.pid, Some(pid));
    assert_eq!(tracer.children_count(), 0);

    Ok(())
}
