//! Test harnesses for the camnode control plane.
//!
//! Provides fake drivers, a scripted command link, `TestNode` for router
//! and capture tests, and `TestStream` for the HTTP stream server.

pub mod fakes;
pub mod link;
pub mod node;
pub mod stream;

pub use fakes::{
    FailingStore, FakeCamera, FixedProbe, FixedSensors, Published, RecordingActuators,
    RecordingBus, Write,
};
pub use link::{LinkHandle, ScriptedLink};
pub use node::TestNode;
pub use stream::{TestError, TestStream};
