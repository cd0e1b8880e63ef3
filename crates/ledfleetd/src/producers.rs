//! Built-in frame producers.
//!
//! These cover the configuration-selectable [`ProducerSpec`] kinds. Richer
//! effects plug in by implementing [`FrameProducer`] directly.

use chrono::{DateTime, Local};

use ledfleet_core::{FrameProducer, ProducerError, ProducerSpec, Rgb};

/// Builds the producer described by `spec`.
pub fn build_producer(spec: &ProducerSpec) -> Box<dyn FrameProducer> {
    match spec {
        ProducerSpec::Solid { color } => Box::new(SolidFill::new(*color)),
        ProducerSpec::Marquee {
            color,
            spacing,
            speed,
        } => Box::new(Marquee::new(*color, *spacing, *speed)),
        ProducerSpec::Off => Box::new(SolidFill::off()),
    }
}

/// Fills every pixel with one colour.
#[derive(Debug, Clone)]
pub struct SolidFill {
    color: Rgb,
    name: &'static str,
}

impl SolidFill {
    pub fn new(color: Rgb) -> Self {
        Self {
            color,
            name: "solid",
        }
    }

    /// All pixels dark.
    pub fn off() -> Self {
        Self {
            color: Rgb::BLACK,
            name: "off",
        }
    }
}

impl FrameProducer for SolidFill {
    fn name(&self) -> &str {
        self.name
    }

    fn render(&mut self, pixels: &mut [Rgb], _now: DateTime<Local>) -> Result<(), ProducerError> {
        pixels.fill(self.color);
        Ok(())
    }
}

/// Evenly spaced lit pixels that scroll along the strip.
///
/// Position is derived from wall-clock time, so every site running a
/// marquee with the same parameters moves in step.
#[derive(Debug, Clone)]
pub struct Marquee {
    color: Rgb,
    spacing: usize,
    speed: f64,
}

impl Marquee {
    pub fn new(color: Rgb, spacing: usize, speed: f64) -> Self {
        Self {
            color,
            spacing,
            speed,
        }
    }

    fn phase(&self, now: DateTime<Local>) -> usize {
        let secs = now.timestamp_millis() as f64 / 1000.0;
        let travelled = (secs * self.speed).rem_euclid(self.spacing as f64);
        travelled as usize % self.spacing
    }
}

impl FrameProducer for Marquee {
    fn name(&self) -> &str {
        "marquee"
    }

    fn render(&mut self, pixels: &mut [Rgb], now: DateTime<Local>) -> Result<(), ProducerError> {
        if self.spacing == 0 {
            return Err(ProducerError::new(self.name(), "spacing must be non-zero"));
        }
        if !self.speed.is_finite() {
            return Err(ProducerError::new(self.name(), "speed must be finite"));
        }

        let phase = self.phase(now);
        for (i, px) in pixels.iter_mut().enumerate() {
            *px = if (i + self.spacing - phase) % self.spacing == 0 {
                self.color
            } else {
                Rgb::BLACK
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_millis(ms: i64) -> DateTime<Local> {
        Local.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_solid_and_off() {
        let mut pixels = vec![Rgb::WHITE; 4];
        let red = Rgb::new(255, 0, 0);

        let mut solid = build_producer(&ProducerSpec::Solid { color: red });
        solid.render(&mut pixels, Local::now()).unwrap();
        assert_eq!(solid.name(), "solid");
        assert!(pixels.iter().all(|p| *p == red));

        let mut off = build_producer(&ProducerSpec::Off);
        off.render(&mut pixels, Local::now()).unwrap();
        assert_eq!(off.name(), "off");
        assert!(pixels.iter().all(|p| *p == Rgb::BLACK));
    }

    #[test]
    fn test_marquee_spacing_and_motion() {
        let color = Rgb::new(0, 0, 255);
        let mut marquee = Marquee::new(color, 4, 1.0);
        let mut pixels = vec![Rgb::BLACK; 8];

        marquee.render(&mut pixels, at_millis(0)).unwrap();
        let lit: Vec<usize> = (0..8).filter(|i| pixels[*i] == color).collect();
        assert_eq!(lit, vec![0, 4]);

        // One second at one pixel per second moves the pattern by one
        marquee.render(&mut pixels, at_millis(1000)).unwrap();
        let lit: Vec<usize> = (0..8).filter(|i| pixels[*i] == color).collect();
        assert_eq!(lit, vec![1, 5]);
    }

    #[test]
    fn test_marquee_zero_spacing_is_an_error() {
        let mut marquee = Marquee::new(Rgb::WHITE, 0, 1.0);
        let mut pixels = vec![Rgb::BLACK; 3];
        assert!(marquee.render(&mut pixels, Local::now()).is_err());
    }
}
