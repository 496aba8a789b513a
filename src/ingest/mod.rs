//! Frame sources.
//!
//! - `stub://` URLs: synthetic frames paced at the target rate.
//! - `ChannelSource`: frames pushed in by an external ingestion layer.
//!
//! Camera drivers and network decoding are not part of this crate; anything
//! else must be adapted through `frame_channel`.

mod channel;
mod synthetic;

use anyhow::{bail, Result};

use crate::frame::FrameSource;

pub use channel::{frame_channel, ChannelSource, FrameFeeder};
pub use synthetic::SyntheticSource;

/// Source parameters shared by all source kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://front_camera".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// Resolve a source URL to a pull-based source.
pub fn open_source(config: SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config)));
    }
    bail!(
        "source {} requires external ingestion; push frames through frame_channel",
        config.url
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_urls_resolve_and_others_are_rejected() {
        assert!(open_source(SourceConfig::default()).is_ok());
        let err = open_source(SourceConfig {
            url: "rtsp://10.0.0.5/stream".into(),
            ..SourceConfig::default()
        })
        .err()
        .expect("rtsp rejected");
        assert!(err.to_string().contains("external ingestion"));
    }
}
