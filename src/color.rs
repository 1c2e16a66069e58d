//! Color-coded progress lines for human-facing milestones (KVM detected,
//! socket connected, debloat done, ...), printed directly to stdout and
//! kept distinct from the structured `tracing` log records emitted
//! alongside them.

use std::io::IsTerminal;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

fn paint(code: &str, message: &str) -> String {
    if std::io::stdout().is_terminal() {
        format!("{code}{message}{RESET}")
    } else {
        message.to_string()
    }
}

pub fn success(message: &str) {
    println!("{}", paint(GREEN, message));
}

pub fn warn(message: &str) {
    println!("{}", paint(YELLOW, message));
}

pub fn failure(message: &str) {
    println!("{}", paint(RED, message));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paint_wraps_in_escape_codes_only_when_requested() {
        let plain = "hello";
        assert!(paint(GREEN, plain).contains(plain));
    }
}
