//! A tiny strace: print every syscall of a command and its children.
//!
//! ```text
//! cargo run --example trace -- /bin/echo hi
//! ```

use std::env;

use lariat::{syscall_name, Command, HookAction, Options, Tracer};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let argv: Vec<String> = env::args().skip(1).collect();
    if argv.is_empty() {
        eprintln!("usage: trace PROGRAM [ARGS...]");
        std::process::exit(2);
    }

    let mut tracer = Tracer::new(Options::TRACE_CHILDREN);

    tracer.set_default_hook(|child, event| {
        let name = syscall_name(event.syscall).unwrap_or("<unknown>");

        if child.is_pre_syscall() {
            eprint!(
                "{:>7} {}({:#x}, {:#x}, {:#x}, ...)",
                child.pid(),
                name,
                event.args.a0,
                event.args.a1,
                event.args.a2,
            );
        } else {
            eprintln!(" = {}", event.args.return_code);
        }

        HookAction::Continue
    });

    tracer.spawn(Command::new(argv)?)?;
    tracer.main()?;

    Ok(())
}
