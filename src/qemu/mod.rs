//! QEMU command construction and process supervision.

pub mod args;
pub mod plan;
pub mod vm;

pub use args::{OptionList, QemuOption};
pub use plan::{
    DeviceOverrides, DisplayOptions, LaunchFlags, LaunchPlan, LaunchPlanBuilder, PortRequests,
    SessionPorts, VncSetting,
};
pub use vm::{QemuOutput, QemuProcess};
