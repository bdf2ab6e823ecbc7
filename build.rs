//! Build-time target checks and configuration.
//!
//! Bootstrapping relocates a live frame by copying raw stack bytes, which is
//! only meaningful on targets with a single stack pointer register and a
//! downward-growing stack. Anything else is rejected here rather than at run
//! time.
//!
//! The default stack size can be overridden with the
//! `JUMPSTACK_DEFAULT_STACK_SIZE` environment variable (in bytes).

use std::env;
use std::fs;
use std::path::PathBuf;

const STACK_SIZE_VAR: &str = "JUMPSTACK_DEFAULT_STACK_SIZE";
const FALLBACK_STACK_SIZE: usize = 1024 * 1024;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed={}", STACK_SIZE_VAR);

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let family = env::var("CARGO_CFG_TARGET_FAMILY").unwrap_or_default();
    if !matches!(arch.as_str(), "x86_64" | "aarch64") || family.split(',').all(|f| f != "unix") {
        panic!(
            "unsupported target {}: frame relocation requires a unix x86_64 or aarch64 target",
            env::var("TARGET").unwrap()
        );
    }

    let stack_size = match env::var(STACK_SIZE_VAR) {
        Ok(s) => parse_size(&s)
            .unwrap_or_else(|| panic!("{} must be a positive byte count, got {:?}", STACK_SIZE_VAR, s)),
        Err(_) => FALLBACK_STACK_SIZE,
    };

    let out = PathBuf::from(env::var("OUT_DIR").unwrap()).join("config.rs");
    fs::write(
        out,
        format!(
            "/// Stack size used when no explicit size is given to a coroutine.\n\
             pub const DEFAULT_STACK_SIZE: usize = {};\n",
            stack_size
        ),
    )
    .unwrap();
}

/// Accepts a plain byte count, optionally suffixed with `k`/`K` or `m`/`M`.
fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, scale) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1024),
        'm' | 'M' => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    let n: usize = digits.parse().ok()?;
    n.checked_mul(scale).filter(|&n| n > 0)
}
