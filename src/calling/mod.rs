//! Call lifecycle: permission, negotiation, monitoring and teardown of one
//! peer-to-peer call at a time, plus the UI-side presentation and ringtone
//! state that follow it.
//!
//! The relay only carries signaling. Media flows over whatever
//! `TransportFactory` the engine is given.

pub mod directory;
pub mod ice;
pub mod loopback;
pub mod media;
pub mod permission;
pub mod presentation;
pub mod ringtone;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod session;
pub mod transport;

#[cfg(test)]
mod scenarios;

pub use directory::ActiveCallPointer;
pub use loopback::LoopbackNetwork;
pub use media::{DevicePolicy, SyntheticDevices};
pub use session::{
    CallContext, CallEngine, CallHandle, CallPhase, CallSettings, CallSnapshot, Notice,
};
