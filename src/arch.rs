//! Platform-specific execution-context switching backends.
//!
//! Everything above the scheduler is written against this narrow interface:
//! a saved register set ([`Context`]), a way to prepare one so its first
//! resumption enters a trampoline ([`Context::first_entry`]), and a single
//! [`switch`] primitive that suspends the running context and resumes
//! another.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
