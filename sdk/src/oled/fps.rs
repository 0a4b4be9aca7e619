use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::bail;
use common::error::SdkError;

/// Caps how often frames are rendered and keeps render statistics
#[derive(Debug, Default)]
pub struct FpsRegulator {
    /// `None` renders as fast as possible
    frame_period: Option<Duration>,
    frames: u64,
    render_time: Duration,
    started: Option<Instant>,
    entered: Option<Instant>,
    last: Option<Instant>,
}

impl FpsRegulator {
    pub fn new(max_fps: f64) -> anyhow::Result<Self> {
        let mut regulator = Self::default();
        regulator.set_max_fps(max_fps)?;

        Ok(regulator)
    }

    /// Zero disables the limit
    pub fn set_max_fps(&mut self, max_fps: f64) -> anyhow::Result<()> {
        if !max_fps.is_finite() || max_fps < 0.0 {
            bail!(SdkError::validation(format!(
                "Max fps must be a positive number, got {max_fps}"
            )));
        }

        self.frame_period = (max_fps > 0.0).then(|| Duration::from_secs_f64(1.0 / max_fps));
        Ok(())
    }

    pub fn max_fps(&self) -> f64 {
        self.frame_period
            .map(|period| 1.0 / period.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn start_timer(&mut self) {
        let now = Instant::now();

        self.entered = Some(now);
        self.started.get_or_insert(now);
        self.last.get_or_insert(now);
    }

    /// Sleeps out the rest of the frame period
    pub fn stop_timer(&mut self) {
        let now = Instant::now();

        if let Some(entered) = self.entered.take() {
            self.render_time += now - entered;
            self.frames += 1;
        }

        if let (Some(period), Some(last)) = (self.frame_period, self.last) {
            let elapsed = now - last;
            if elapsed < period {
                thread::sleep(period - elapsed);
            }
        }

        self.last = Some(Instant::now());
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Frames per second since the first frame
    pub fn effective_fps(&self) -> f64 {
        let Some(started) = self.started else {
            return 0.0;
        };

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn average_render_time(&self) -> Duration {
        if self.frames == 0 {
            return Duration::ZERO;
        }

        Duration::from_secs_f64(self.render_time.as_secs_f64() / self.frames as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_to_max_fps() {
        let mut fps = FpsRegulator::new(20.0).unwrap();

        let start = Instant::now();
        for _ in 0..4 {
            fps.start_timer();
            fps.stop_timer();
        }

        // Every frame waits out the rest of its 50ms
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(fps.frames(), 4);
        assert!(fps.effective_fps() <= 20.0 + 1.0);
    }

    #[test]
    fn zero_disables() {
        let mut fps = FpsRegulator::new(0.0).unwrap();
        assert_eq!(fps.max_fps(), 0.0);

        let start = Instant::now();
        for _ in 0..100 {
            fps.start_timer();
            fps.stop_timer();
        }

        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(fps.average_render_time() < Duration::from_millis(1));
    }

    #[test]
    fn rejects_negative() {
        assert!(FpsRegulator::new(-1.0).is_err());
        assert!(FpsRegulator::new(f64::NAN).is_err());
        assert_eq!(FpsRegulator::default().average_render_time(), Duration::ZERO);
    }
}
