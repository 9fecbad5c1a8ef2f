//! Architecture-specific context switching
//!
//! Each backend provides:
//!
//! - `Context`: the callee-saved register file of a suspended fiber
//! - `init_context`: arm a context so the first switch enters `entry(arg)`
//!   on a fresh stack
//! - `switch_context`: save the running registers into one context and
//!   resume another
//!
//! The entry function must never return. If it does, the trampoline calls
//! `fiber_fell_through`, which aborts.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{init_context, switch_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{init_context, switch_context, Context};
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Entry point signature for a fresh context
pub type EntryFn = extern "C" fn(usize);

/// Reached only if a fiber entry function returns instead of switching away
extern "C" fn fiber_fell_through() -> ! {
    fibrio_core::kfatal!("fiber entry returned past its final switch")
}
