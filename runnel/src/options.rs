//! Construction-time configuration. Every options type has sensible defaults,
//! consuming `with_*` setters, and loads from any serde format with missing
//! fields falling back to their defaults.
//!
//! ```rust
//! use runnel::options::{DuplexOptions, WritableOptions};
//!
//! let options = DuplexOptions::default()
//!     .with_allow_half_open(false)
//!     .with_writable(WritableOptions::default().with_high_water_mark(4));
//! ```
use crate::stream::Encoding;
use serde::{Deserialize, Serialize};

/// Buffered chunks (not bytes) at which backpressure starts
pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadableOptions {
    pub high_water_mark: usize,
}

impl Default for ReadableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl ReadableOptions {
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WritableOptions {
    pub high_water_mark: usize,
    /// Label attached to writes that do not name an encoding
    pub default_encoding: Option<Encoding>,
    /// A persistent destination is never ended by a pipe whose source ends
    pub persistent: bool,
}

impl Default for WritableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            default_encoding: None,
            persistent: false,
        }
    }
}

impl WritableOptions {
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub fn with_default_encoding<T: Into<Encoding>>(mut self, encoding: T) -> Self {
        self.default_encoding = Some(encoding.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplexOptions {
    pub readable: ReadableOptions,
    pub writable: WritableOptions,
    /// When false the stream reports itself as not readable
    pub readable_enabled: bool,
    /// When false the stream reports itself as not writable
    pub writable_enabled: bool,
    /// When false, the writable side is ended once the readable side ends
    pub allow_half_open: bool,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            readable: ReadableOptions::default(),
            writable: WritableOptions::default(),
            readable_enabled: true,
            writable_enabled: true,
            allow_half_open: true,
        }
    }
}

impl DuplexOptions {
    pub fn with_readable(mut self, readable: ReadableOptions) -> Self {
        self.readable = readable;
        self
    }

    pub fn with_writable(mut self, writable: WritableOptions) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_readable_enabled(mut self, enabled: bool) -> Self {
        self.readable_enabled = enabled;
        self
    }

    pub fn with_writable_enabled(mut self, enabled: bool) -> Self {
        self.writable_enabled = enabled;
        self
    }

    pub fn with_allow_half_open(mut self, allow_half_open: bool) -> Self {
        self.allow_half_open = allow_half_open;
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeOptions {
    /// End the destination when the source ends
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

impl PipeOptions {
    pub fn with_end(mut self, end: bool) -> Self {
        self.end = end;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults() {
        assert_eq!(ReadableOptions::default().high_water_mark, 16);
        let writable = WritableOptions::default();
        assert_eq!(writable.high_water_mark, 16);
        assert!(!writable.persistent);
        let duplex = DuplexOptions::default();
        assert!(duplex.allow_half_open);
        assert!(duplex.readable_enabled && duplex.writable_enabled);
        assert!(PipeOptions::default().end);
    }

    #[rstest]
    #[case("{}", DuplexOptions::default())]
    #[case(r#"{"allow_half_open": false}"#, DuplexOptions::default().with_allow_half_open(false))]
    #[case(
        r#"{"writable": {"high_water_mark": 2, "persistent": true}}"#,
        DuplexOptions::default().with_writable(
            WritableOptions::default()
                .with_high_water_mark(2)
                .with_persistent(true)
        )
    )]
    #[case(
        r#"{"readable": {"high_water_mark": 1}, "readable_enabled": false}"#,
        DuplexOptions::default()
            .with_readable(ReadableOptions::default().with_high_water_mark(1))
            .with_readable_enabled(false)
    )]
    fn duplex_options_from_json(#[case] json: &str, #[case] expected: DuplexOptions) {
        let parsed: DuplexOptions = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn writable_options_serialize() {
        let options = WritableOptions::default().with_default_encoding("utf8");
        let json = serde_json::to_string(&options).unwrap();
        let back: WritableOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.default_encoding.as_deref(), Some("utf8"));
        let pipe: PipeOptions = serde_json::from_str(r#"{"end": false}"#).unwrap();
        assert!(!pipe.end);
    }
}
