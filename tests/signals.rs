//! Signal events: re-delivery by default, suppression on request.

use anyhow::Result;
use ntest::timeout;

use lariat::{EventKind, Options, Signal, Tracer};

mod support;
use support::*;

#[test]
#[timeout(30000)]
fn signals_are_redelivered_on_continue() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::empty());
    let pid = tracer.spawn(cmd(&["/bin/sleep", "30"]))?;

    nix::sys::signal::kill(pid, Signal::SIGTERM)?;

    let mut saw_signal = false;
    loop {
        let ev = tracer.wait_event(None)?;
        match ev.kind {
            EventKind::Signal => {
                assert_eq!(ev.pending, Some(Signal::SIGTERM));
                saw_signal = true;
                tracer.continue_event(&ev)?;
            }
            EventKind::Quit => {
                match ev.pid {
                    None => break,
                    Some(_) => {
                        // The re-delivered SIGTERM terminated the tracee.
                        assert_eq!(ev.pending, Some(Signal::SIGTERM));
                        tracer.continue_event(&ev)?;
                    }
                }
            }
            _ => tracer.continue_event(&ev)?,
        }
    }

    assert!(saw_signal, "the SIGTERM delivery stop was never observed");

    Ok(())
}

#[test]
#[timeout(30000)]
fn suppressed_signals_never_reach_the_tracee() -> Result<()> {
    init_logging();

    let mut tracer = Tracer::new(Options::empty());
    let pid = tracer.spawn(cmd(&["/bin/sleep", "30"]))?;

    nix::sys::signal::kill(pid, Signal::SIGTERM)?;

    // Swallow the delivery stop, then check the tracee is still alive by
    // watching it make another syscall.
    let mut suppressed = false;
    let mut alive_after = false;
    loop {
        let mut ev = tracer.wait_event(None)?;
        match ev.kind {
            EventKind::Signal => {
                suppressed = true;
                ev.suppress();
                tracer.continue_event(&ev)?;
            }
            EventKind::Syscall if suppressed => {
                alive_after = true;
                break;
            }
            EventKind::Quit => {
                assert!(ev.pid.is_some(), "tracee registry drained unexpectedly");
                panic!("tracee died despite signal suppression");
            }
            _ => tracer.continue_event(&ev)?,
        }
    }

    assert!(alive_after);
    tracer.kill_child(pid)?;

    Ok(())
}
