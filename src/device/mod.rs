//! Attached display/motor controller
//!
//! The serial link, its line protocol, port discovery, payload rendering and
//! the display operations built on top of them.

pub mod discovery;
mod display;
pub mod link;
pub mod protocol;
pub mod render;

pub use discovery::{PortInfo, discover_port, list_ports};
pub use display::{AnimationStats, DisplayDriver};
pub use link::{
    Backoff, DeviceLink, LinkPolicy, LinkSettings, LinkState, NoPorts, PortOpener, SerialIo,
    SharedLink, SystemPorts,
};
pub use protocol::Command;
pub use render::{Canvas, PixelFormat, Renderer};
