#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]

pub mod control;
pub mod device;
pub mod discovery;
pub mod error;
pub mod matching;
pub mod notifier;
pub mod status;
pub mod streaming;
pub mod time_echo;

pub use control::Control;
pub use device::Device;
pub use discovery::{DiscoveredDevice, Discovery};
pub use status::Status;
