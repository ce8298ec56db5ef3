pub mod configuration;
pub mod context;
pub mod driver;
pub mod errors;
pub mod log_file;
pub mod network;
pub mod process;
pub mod qmp;
pub mod types;

#[cfg(test)]
mod testing;

pub use context::QemuContext;
pub use driver::{QEMU_DRIVER_NAME, QemuDriver};
pub use errors::DriverError;
