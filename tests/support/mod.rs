#![allow(dead_code)]

use lariat::Command;

/// Build a tracee command from a literal argv.
pub fn cmd(argv: &[&str]) -> Command {
    Command::new(argv.to_vec()).expect("argv strings contain no NUL")
}

/// Install a test-friendly tracing subscriber, once per test binary.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
