//! Minimal terminal output helpers.
use std::fmt;

pub fn success(msg: impl fmt::Display) {
    println!("✓ {msg}");
}

pub fn error(msg: impl fmt::Display) {
    eprintln!("✗ {msg}");
}
