pub mod config;
pub mod device;
pub mod port;
pub mod protocol;
pub mod registry;
pub mod regs;
