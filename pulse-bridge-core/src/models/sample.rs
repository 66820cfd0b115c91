use serde::{Deserialize, Serialize};

/// Sample encodings understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    ALaw,
    ULaw,
    S16Le,
    S16Be,
    Float32Le,
    Float32Be,
    S32Le,
    S32Be,
    S24Le,
    S24Be,
    S24In32Le,
    S24In32Be,
    Invalid,
}

/// Sample format, rate and channel count of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self {
            format: SampleFormat::S16Le,
            rate: 44100,
            channels: 2,
        }
    }
}

/// Buffering hints; `u32::MAX` lets the server choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAttributes {
    pub max_length: u32,
    pub target_length: u32,
    pub pre_buffering: u32,
    pub minimum_request: u32,
    pub fragment_size: u32,
}

impl Default for BufferAttributes {
    fn default() -> Self {
        Self {
            max_length: u32::MAX,
            target_length: u32::MAX,
            pre_buffering: u32::MAX,
            minimum_request: u32::MAX,
            fragment_size: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    Playback,
    Record,
    Upload,
}

impl StreamDirection {
    pub fn can_read(&self) -> bool {
        matches!(self, Self::Record)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Self::Playback | Self::Upload)
    }
}
