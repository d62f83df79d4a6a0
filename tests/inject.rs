//! Syscall injection, synchronous and asynchronous.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use ntest::timeout;

use lariat::{syscall_number, HookAction, Options, SyscallArgs, Tracer};

mod support;
use support::*;

fn own_uid() -> i64 {
    nix::unistd::getuid().as_raw() as i64
}

#[test]
#[timeout(60000)]
fn synchronous_injection_at_pre() -> Result<()> {
    init_logging();

    let getuid = syscall_number("getuid").expect("getuid exists");
    let mut tracer = Tracer::new(Options::empty());

    let injected = Arc::new(Mutex::new(None));
    let posts = Arc::new(Mutex::new(Vec::new()));

    let injected_rec = injected.clone();
    let posts_rec = posts.clone();
    let mut armed = true;
    tracer.set_hook("mmap", move |child, event| {
        if child.is_pre_syscall() {
            if armed {
                armed = false;
                let ret = child
                    .inject_syscall(getuid, &SyscallArgs::default())
                    .unwrap();
                *injected_rec.lock().unwrap() = Some(ret);
            }
        } else {
            posts_rec.lock().unwrap().push(event.args.return_code);
        }
        HookAction::Continue
    })?;

    tracer.spawn(cmd(&["/bin/true"]))?;
    tracer.main()?;

    // The injected call returned the tracee's uid (ours; it is our fork).
    assert_eq!(injected.lock().unwrap().unwrap(), own_uid());

    // The displaced mmap then ran undisturbed: its result is a mapping
    // address, not an error and not the uid.
    let posts = posts.lock().unwrap();
    assert!(!posts.is_empty(), "tracee made no mmap calls");
    assert!(posts[0] > 0, "first mmap failed: {}", posts[0]);
    assert_eq!(posts[0] % 4096, 0, "mmap result is not page-aligned");

    Ok(())
}

#[test]
#[timeout(60000)]
fn synchronous_injection_at_post_spares_the_next_pre() -> Result<()> {
    init_logging();

    let getuid = syscall_number("getuid").expect("getuid exists");
    let mmap = syscall_number("mmap").expect("mmap exists");
    let mut tracer = Tracer::new(Options::empty());

    let injected = Arc::new(Mutex::new(None));
    let phases = Arc::new(Mutex::new(Vec::new()));

    let injected_rec = injected.clone();
    let phases_rec = phases.clone();
    let mut armed = true;
    tracer.set_default_hook(move |child, event| {
        phases_rec.lock().unwrap().push(child.is_pre_syscall());

        if !child.is_pre_syscall() && armed && event.syscall == mmap {
            armed = false;
            let ret = child
                .inject_syscall(getuid, &SyscallArgs::default())
                .unwrap();
            *injected_rec.lock().unwrap() = Some(ret);
        }

        HookAction::Continue
    });

    tracer.spawn(cmd(&["/bin/true"]))?;
    tracer.main()?;

    assert_eq!(injected.lock().unwrap().unwrap(), own_uid());

    // The injection consumed its own stops: the visible trace still
    // alternates strictly, so the PRE after the injection point was not
    // disturbed.
    let phases = phases.lock().unwrap();
    assert!(!phases.is_empty());
    for (i, pre) in phases.iter().enumerate() {
        assert_eq!(*pre, i % 2 == 0, "phase inverted at event {}", i);
    }

    Ok(())
}

#[test]
#[timeout(60000)]
fn asynchronous_injection_completes_exactly_once() -> Result<()> {
    init_logging();

    let getuid = syscall_number("getuid").expect("getuid exists");
    let mut tracer = Tracer::new(Options::empty());

    let completions = Arc::new(Mutex::new(Vec::new()));

    let completions_rec = completions.clone();
    let mut armed = true;
    tracer.set_hook("mmap", move |child, _event| {
        if child.is_pre_syscall() && armed {
            armed = false;
            let completions_rec = completions_rec.clone();
            child
                .inject_pre_start(getuid, &SyscallArgs::default(), move |child, _ev| {
                    let ret = child.inject_pre_end().unwrap();
                    completions_rec.lock().unwrap().push(ret);
                    HookAction::Continue
                })
                .unwrap();
        }
        HookAction::Continue
    })?;

    tracer.spawn(cmd(&["/bin/true"]))?;
    tracer.main()?;

    let completions = completions.lock().unwrap();
    assert_eq!(completions.len(), 1, "callback ran {} times", completions.len());
    assert_eq!(completions[0], own_uid());

    Ok(())
}

#[test]
#[timeout(30000)]
fn injection_outside_a_syscall_stop_is_a_protocol_violation() -> Result<()> {
    init_logging();

    let getuid = syscall_number("getuid").expect("getuid exists");
    let mut tracer = Tracer::new(Options::empty());
    let pid = tracer.spawn(cmd(&["/bin/sleep", "30"]))?;

    // Fresh from spawn, the tracee has no syscall-stop context yet.
    let child = tracer.child_mut(pid).unwrap();
    let err = child
        .inject_syscall(getuid, &SyscallArgs::default())
        .unwrap_err();
    assert!(matches!(err, lariat::Error::ProtocolViolation { .. }));

    tracer.kill_child(pid)?;

    Ok(())
}
