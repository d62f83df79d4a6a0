//! Hook registration and dispatch against live tracees.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use ntest::timeout;

use lariat::{Error, EventKind, HookAction, Options, Tracer};

mod support;
use support::*;

#[test]
fn unknown_syscall_name_is_an_error() {
    init_logging();

    let mut tracer = Tracer::new(Options::empty());
    let err = tracer
        .set_hook("frobnicate", |_, _| HookAction::Continue)
        .unwrap_err();

    assert!(matches!(err, Error::UnknownSyscall { .. }));
}

#[test]
#[timeout(30000)]
fn reregistering_a_hook_replaces_the_binding() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::empty());
    tracer.set_hook("getpid", |_, _| HookAction::Abort)?;
    tracer.set_hook("getpid", |_, _| HookAction::KillChild)?;

    let pid = tracer.spawn(cmd(&["/bin/sleep", "30"]))?;
    let count = tracer.children_count();

    let ev = loop {
        let ev = tracer.wait_event(None)?;
        if ev.kind == EventKind::Syscall {
            break ev;
        }
        tracer.continue_event(&ev)?;
    };

    // The latest binding wins, and running it by hand applies nothing.
    assert_eq!(tracer.execute_hook("getpid", &ev)?, HookAction::KillChild);
    assert_eq!(tracer.children_count(), count);

    // With no hook for the name, dispatch reports NoHook.
    assert_eq!(tracer.execute_hook("getppid", &ev)?, HookAction::NoHook);

    tracer.kill_child(pid)?;

    Ok(())
}

#[test]
#[timeout(60000)]
fn write_hook_captures_the_tracee_buffer() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::TRACE_CHILDREN);

    let captured = Arc::new(Mutex::new(Vec::new()));
    let recorder = captured.clone();
    tracer.set_hook("write", move |child, event| {
        // Record at POST, once the write has completed.
        if !child.is_pre_syscall() {
            let len = event.args.a2 as usize;
            if len > 0 && len < 4096 {
                let mut buf = vec![0u8; len];
                if let Ok(n) = child.read_mem(event.args.a1, &mut buf) {
                    buf.truncate(n);
                    recorder.lock().unwrap().push(buf);
                }
            }
        }
        HookAction::Continue
    })?;

    tracer.spawn(cmd(&["/bin/sh", "-c", "echo hi"]))?;
    tracer.main()?;

    let captured = captured.lock().unwrap();
    assert!(
        captured.iter().any(|buf| buf.starts_with(b"hi\n")),
        "no write of \"hi\\n\" observed in {:?}",
        captured
    );

    Ok(())
}
