pub mod scripted;
pub mod stub;
pub mod unloaded;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::{ScriptProbe, ScriptedBackend};
pub use stub::StubBackend;
pub use unloaded::UnloadedBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
