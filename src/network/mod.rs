pub mod ports;
pub mod types;

pub use ports::{
    BindProbe, PortAllocation, PortAllocator, PortProbe, PortRequest, PortRole,
    DEFAULT_SCAN_LIMIT, SERIAL_BASE_PORT, SSH_BASE_PORT, VNC_BASE_PORT, VNC_SCAN_LIMIT,
    WEB_CONSOLE_BASE_PORT,
};
pub use types::*;
