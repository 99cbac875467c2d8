//! Architecture glue.
//!
//! Everything hardware-facing lives below this module, compiled only
//! for kernel targets. The portable crates reach it through their
//! registered hooks (TLB flush, TXU notify, tick source, CPU id), all
//! installed during bring-up.

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub mod x86_64;
