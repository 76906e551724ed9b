//! `x86_64` is the only target this kernel boots on (see `bootloader_api`
//! in `kernel/Cargo.toml`); kept as its own module the way the teacher's
//! multi-arch layout did rather than inlined into `lib.rs`.

pub mod x86_64;
pub use self::x86_64::*;
