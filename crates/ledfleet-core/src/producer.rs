//! The frame-producer capability.
//!
//! Producers fill a site's pixel buffer once per scheduler tick. The engine
//! only depends on the [`FrameProducer`] trait; concrete producers are built
//! from [`ProducerSpec`] values found in site configuration.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pixel::Rgb;

/// Error returned by a producer that could not render a frame.
///
/// The scheduler reports it and skips the tick; the buffer keeps its
/// previous contents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("producer '{producer}' failed: {reason}")]
pub struct ProducerError {
    pub producer: String,
    pub reason: String,
}

impl ProducerError {
    pub fn new(producer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            reason: reason.into(),
        }
    }
}

/// Renders pixel content into a site buffer.
///
/// `render` is called with the site buffer write-locked, so implementations
/// should do their work and return promptly.
pub trait FrameProducer: Send {
    /// Short name shown in telemetry.
    fn name(&self) -> &str;

    /// Draws one frame for wall-clock time `now`.
    fn render(&mut self, pixels: &mut [Rgb], now: DateTime<Local>) -> Result<(), ProducerError>;
}

impl fmt::Debug for dyn FrameProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameProducer")
            .field("name", &self.name())
            .finish()
    }
}

/// Configuration-level description of a built-in producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProducerSpec {
    /// Every pixel set to one colour
    Solid { color: Rgb },

    /// Lit pixels every `spacing` positions, scrolling at `speed` pixels/sec
    Marquee {
        color: Rgb,
        #[serde(default = "default_spacing")]
        spacing: usize,
        #[serde(default = "default_speed")]
        speed: f64,
    },

    /// All pixels dark
    Off,
}

fn default_spacing() -> usize {
    8
}

fn default_speed() -> f64 {
    10.0
}

impl ProducerSpec {
    /// Name a producer built from this spec reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Solid { .. } => "solid",
            Self::Marquee { .. } => "marquee",
            Self::Off => "off",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_toml_inline_table() {
        #[derive(Deserialize)]
        struct Holder {
            producer: ProducerSpec,
        }

        let h: Holder =
            toml::from_str("producer = { kind = \"marquee\", color = \"#ff8800\", spacing = 12 }")
                .unwrap();
        assert_eq!(
            h.producer,
            ProducerSpec::Marquee {
                color: Rgb::new(0xff, 0x88, 0x00),
                spacing: 12,
                speed: 10.0,
            }
        );
        assert_eq!(h.producer.kind(), "marquee");

        let off: Holder = toml::from_str("producer = { kind = \"off\" }").unwrap();
        assert_eq!(off.producer, ProducerSpec::Off);
    }

    #[test]
    fn test_spec_unknown_kind_rejected() {
        let result = serde_json::from_str::<ProducerSpec>(r#"{"kind":"plasma"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_producer_error_display() {
        let err = ProducerError::new("solid", "boom");
        assert_eq!(err.to_string(), "producer 'solid' failed: boom");
    }
}
