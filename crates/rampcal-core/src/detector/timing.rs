use crate::domain::{CalibError, CalibResult};
use serde::{Deserialize, Serialize};

/// Readout cadence and electrical constants of the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorTiming {
    /// Seconds per frame.
    pub frame_time: f64,
    pub frames_per_group: usize,
    pub drop_frames_per_group: usize,
    pub first_frame_delay: usize,
    pub group_count: usize,
    /// e-/DN.
    pub gain: f64,
    /// Pixels per second per channel.
    pub pixel_rate: f64,
    /// Non-science pixel clocks appended to every row.
    pub line_overhead: usize,
    /// Non-science rows appended to every frame.
    pub extra_lines: usize,
    /// e-/s; derived from the dark ramp when absent.
    pub dark_current: Option<f64>,
    /// e- per frame; derived from the effective noise when absent.
    pub read_noise: Option<f64>,
}

impl Default for DetectorTiming {
    fn default() -> Self {
        Self {
            frame_time: 10.73677,
            frames_per_group: 1,
            drop_frames_per_group: 0,
            first_frame_delay: 0,
            group_count: 108,
            gain: 2.0,
            pixel_rate: 1.0e5,
            line_overhead: 12,
            extra_lines: 1,
            dark_current: None,
            read_noise: None,
        }
    }
}

impl DetectorTiming {
    pub fn validate(&self) -> CalibResult<()> {
        if !(self.frame_time.is_finite() && self.frame_time > 0.0) {
            return Err(CalibError::invalid_configuration(
                "CONFIG.TIMING_FRAME_TIME",
                format!("frame time must be positive, got {}", self.frame_time),
            ));
        }
        if self.frames_per_group == 0 || self.group_count == 0 {
            return Err(CalibError::invalid_configuration(
                "CONFIG.TIMING_FRAMES",
                format!(
                    "frames per group ({}) and group count ({}) must be non-zero",
                    self.frames_per_group, self.group_count
                ),
            ));
        }
        if !(self.gain.is_finite() && self.gain > 0.0) || !(self.pixel_rate > 0.0) {
            return Err(CalibError::invalid_configuration(
                "CONFIG.TIMING_ELECTRONICS",
                format!(
                    "gain ({}) and pixel rate ({}) must be positive",
                    self.gain, self.pixel_rate
                ),
            ));
        }
        Ok(())
    }

    pub fn group_time(&self) -> f64 {
        (self.frames_per_group + self.drop_frames_per_group) as f64 * self.frame_time
    }

    /// `t_k = (k + 1) * group_time` for `k` in `0..groups`.
    pub fn time_axis(&self, groups: usize) -> Vec<f64> {
        let step = self.group_time();
        (0..groups).map(|k| (k + 1) as f64 * step).collect()
    }

    pub fn pattern(&self) -> ReadoutPattern {
        ReadoutPattern {
            name: "CONFIGURED".to_string(),
            frames_per_group: self.frames_per_group,
            drop_frames_per_group: self.drop_frames_per_group,
            first_frame_delay: self.first_frame_delay,
        }
    }

    /// Same detector read out with another pattern, group count derived from
    /// this timing's frame budget.
    pub fn with_pattern(&self, pattern: &ReadoutPattern) -> Self {
        let mut timing = self.clone();
        timing.frames_per_group = pattern.frames_per_group;
        timing.drop_frames_per_group = pattern.drop_frames_per_group;
        timing.first_frame_delay = pattern.first_frame_delay;
        timing.group_count = pattern.group_count_from(self.group_count);
        timing
    }
}

/// MULTIACCUM readout pattern: `nf` averaged frames, `nd2` dropped frames
/// between groups, `nd1` dropped frames before the first group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadoutPattern {
    pub name: String,
    pub frames_per_group: usize,
    pub drop_frames_per_group: usize,
    #[serde(default)]
    pub first_frame_delay: usize,
}

impl ReadoutPattern {
    pub fn new(name: &str, frames_per_group: usize, drop_frames_per_group: usize) -> Self {
        Self {
            name: name.to_string(),
            frames_per_group,
            drop_frames_per_group,
            first_frame_delay: 0,
        }
    }

    pub fn standard_patterns() -> Vec<Self> {
        vec![
            Self::new("RAPID", 1, 0),
            Self::new("BRIGHT1", 1, 1),
            Self::new("BRIGHT2", 2, 0),
            Self::new("SHALLOW2", 2, 3),
            Self::new("SHALLOW4", 4, 1),
            Self::new("MEDIUM2", 2, 8),
            Self::new("MEDIUM8", 8, 2),
            Self::new("DEEP2", 2, 18),
            Self::new("DEEP8", 8, 12),
        ]
    }

    pub fn is_rapid(&self) -> bool {
        self.frames_per_group == 1 && self.drop_frames_per_group == 0 && self.first_frame_delay == 0
    }

    /// Groups obtainable from a rapid ramp of `frames` frames.
    pub fn group_count_from(&self, frames: usize) -> usize {
        let stride = self.frames_per_group + self.drop_frames_per_group;
        if stride == 0 || frames + self.drop_frames_per_group < self.first_frame_delay {
            return 0;
        }
        (frames + self.drop_frames_per_group - self.first_frame_delay) / stride
    }

    pub fn frames_required(&self, groups: usize) -> usize {
        if groups == 0 {
            return self.first_frame_delay;
        }
        self.first_frame_delay
            + groups * self.frames_per_group
            + (groups - 1) * self.drop_frames_per_group
    }

    /// Mid-times of each averaged group.
    pub fn group_times(&self, groups: usize, frame_time: f64) -> Vec<f64> {
        let stride = (self.frames_per_group + self.drop_frames_per_group) as f64;
        let center = (self.frames_per_group as f64 + 1.0) / 2.0;
        (0..groups)
            .map(|k| (self.first_frame_delay as f64 + k as f64 * stride + center) * frame_time)
            .collect()
    }
}

/// Excess variance `12 (n-1)/(n+1) p0² - p1/√m` of the integrated signal, in e-².
pub fn excess_variance_model(groups: f64, frames_per_group: f64, params: [f64; 2]) -> f64 {
    12.0 * (groups - 1.0) / (groups + 1.0) * params[0] * params[0]
        - params[1] / frames_per_group.sqrt()
}

/// Expected slope noise in e-/s for a fit over `groups` groups.
///
/// `excess` adds [`excess_variance_model`] to the integrated variance.
pub fn theoretical_slope_noise(
    groups: usize,
    timing: &DetectorTiming,
    read_noise: f64,
    dark_current: f64,
    excess: Option<[f64; 2]>,
) -> f64 {
    if groups < 2 {
        return f64::NAN;
    }
    let n = groups as f64;
    let m = timing.frames_per_group as f64;
    let t_g = timing.group_time();
    let t_f = timing.frame_time;

    let read_term = 12.0 * (n - 1.0) / (m * n * (n + 1.0)) * read_noise * read_noise;
    let shot_term = (6.0 * (n * n + 1.0) / (5.0 * n * (n + 1.0)) * (n - 1.0) * t_g
        - 2.0 * (2.0 * m - 1.0) * (n - 1.0) / (m * n * (n + 1.0)) * t_f)
        * dark_current;
    let excess_term = excess.map_or(0.0, |params| excess_variance_model(n, m, params));

    // Variance is for the integrated signal; convert to a rate.
    let variance = read_term + shot_term + excess_term;
    variance.max(0.0).sqrt() / ((n - 1.0) * t_g)
}
