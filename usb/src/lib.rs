pub use rusb;
pub mod changes;
pub mod control;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod poller;
pub mod report_descriptor;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
