//! Auxilliary functions for logging information to `stderr`.
use std::io::stderr;
use std::sync::atomic::{AtomicU8, Ordering};

use colored::Colorize;
use crossterm::{
    cursor,
    terminal::{Clear, ClearType},
    ExecutableCommand,
};

/// Diagnostic severities, in decreasing order of urgency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

static VERBOSITY: AtomicU8 = AtomicU8::new(Level::Warn as u8);

/// Set the maximum level that will be printed.
pub fn set_verbosity(level: Level) {
    VERBOSITY.store(level as u8, Ordering::Relaxed);
}

/// Map a numeric `-v` argument onto a level; out-of-range values
/// saturate at debug.
pub fn level_from_arg(v: u8) -> Level {
    match v {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        _ => Level::Debug,
    }
}

fn enabled(level: Level) -> bool {
    level as u8 <= VERBOSITY.load(Ordering::Relaxed)
}

fn indent_with(header: colored::ColoredString, msg: String) {
    // clear current line
    let _ = stderr().execute(Clear(ClearType::CurrentLine));

    let _ = stderr().execute(cursor::MoveToColumn(0));
    eprint!("{:>12} ", header);
    for (i, line) in msg.lines().enumerate() {
        if i == 0 {
            eprintln!("{}", line);
        } else {
            eprintln!("{:>12} {}", " ", line);
        }
    }
}

/// Progress line that is overwritten in place.
pub fn cont_status(header: &str, msg: String) {
    let _ = stderr().execute(cursor::MoveToColumn(0));
    eprint!("{:>12} {}", header.green().bold(), msg);
    let _ = stderr().execute(cursor::MoveToColumn(0));
}

pub fn status(header: &str, msg: String) {
    indent_with(header.green().bold(), msg);
}

pub fn err(msg: String) {
    if enabled(Level::Error) {
        indent_with("Error".red().bold(), msg);
    }
}

pub fn warn(msg: String) {
    if enabled(Level::Warn) {
        indent_with("Warning".yellow().bold(), msg);
    }
}

pub fn info(msg: String) {
    if enabled(Level::Info) {
        indent_with("Info".cyan().bold(), msg);
    }
}

pub fn debug(msg: String) {
    if enabled(Level::Debug) {
        indent_with("Debug".dimmed(), msg);
    }
}

pub fn hint(msg: String) {
    indent_with("Hint".blue().bold(), msg);
}
