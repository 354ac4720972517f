//! POSIX signal name/number table.
//!
//! MI stop notifications are free to carry only a signal name or only a
//! numeric code; the resolver fills in whichever half is missing before
//! surfacing an exception to the embedder.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Linux x86-64 numbering.
static SIGNALS: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    HashMap::from([
        ("SIGHUP", 1),
        ("SIGINT", 2),
        ("SIGQUIT", 3),
        ("SIGILL", 4),
        ("SIGTRAP", 5),
        ("SIGABRT", 6),
        ("SIGBUS", 7),
        ("SIGFPE", 8),
        ("SIGKILL", 9),
        ("SIGUSR1", 10),
        ("SIGSEGV", 11),
        ("SIGUSR2", 12),
        ("SIGPIPE", 13),
        ("SIGALRM", 14),
        ("SIGTERM", 15),
        ("SIGSTKFLT", 16),
        ("SIGCHLD", 17),
        ("SIGCONT", 18),
        ("SIGSTOP", 19),
        ("SIGTSTP", 20),
        ("SIGTTIN", 21),
        ("SIGTTOU", 22),
        ("SIGURG", 23),
        ("SIGXCPU", 24),
        ("SIGXFSZ", 25),
        ("SIGVTALRM", 26),
        ("SIGPROF", 27),
        ("SIGWINCH", 28),
        ("SIGIO", 29),
        ("SIGPWR", 30),
        ("SIGSYS", 31),
        // glibc real-time plumbing signals, reported by gdb under these names
        ("SIG32", 32),
        ("SIG33", 33),
    ])
});

pub fn code_by_name(name: &str) -> Option<u32> {
    SIGNALS.get(name).copied()
}

pub fn name_by_code(code: u32) -> Option<&'static str> {
    SIGNALS
        .iter()
        .find(|(_, &c)| c == code)
        .map(|(&name, _)| name)
}

/// Complete a (name, code) pair where MI omitted one of the two.
/// Unknown names keep code 0, unknown codes keep the name absent.
pub fn complete(name: Option<&str>, code: Option<u32>) -> (Option<String>, u32) {
    match (name, code) {
        (Some(name), Some(code)) => (Some(name.to_string()), code),
        (Some(name), None) => (Some(name.to_string()), code_by_name(name).unwrap_or(0)),
        (None, Some(code)) => (name_by_code(code).map(str::to_string), code),
        (None, None) => (None, 0),
    }
}
