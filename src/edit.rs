//! Non-destructive edit parameters
//!
//! An [`EditDescriptor`] is the single validation gate in front of every
//! export: once constructed it is known to satisfy all bounds, and the export
//! pipeline turns it into transcoder arguments without checking again.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};

/// Lowest accepted linear gain
pub const MIN_VOLUME: f64 = 0.0;
/// Highest accepted linear gain
pub const MAX_VOLUME: f64 = 2.0;
/// Longest accepted fade, in seconds
pub const MAX_FADE_SECS: f64 = 5.0;

/// Absorbs float noise such as 0.1 + 0.2 when comparing sums against bounds
const EPSILON: f64 = 1e-9;

/// Validated, immutable edit parameters (all times in seconds)
///
/// Fades are relative to the trimmed clip: `fade_in` starts at the first
/// kept sample, `fade_out` ends at the last.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EditParams")]
pub struct EditDescriptor {
    trim_start: f64,
    trim_end: f64,
    volume: f64,
    fade_in: f64,
    fade_out: f64,
}

/// Unvalidated edit parameters, as received from the UI collaborator
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditParams {
    /// Trim window start
    pub trim_start: f64,
    /// Trim window end
    pub trim_end: f64,
    /// Linear gain multiplier
    #[serde(default = "default_volume")]
    pub volume: f64,
    /// Fade-in length
    #[serde(default)]
    pub fade_in: f64,
    /// Fade-out length
    #[serde(default)]
    pub fade_out: f64,
    /// Source duration, when already known
    #[serde(default)]
    pub source_duration: Option<f64>,
}

fn default_volume() -> f64 {
    1.0
}

impl TryFrom<EditParams> for EditDescriptor {
    type Error = ValidationError;

    fn try_from(p: EditParams) -> Result<Self, Self::Error> {
        EditDescriptor::build(
            p.trim_start,
            p.trim_end,
            p.volume,
            p.fade_in,
            p.fade_out,
            p.source_duration,
        )
    }
}

impl EditDescriptor {
    /// Validate and construct
    ///
    /// `source_duration` is checked against `trim_end` only when known.
    pub fn build(
        trim_start: f64,
        trim_end: f64,
        volume: f64,
        fade_in: f64,
        fade_out: f64,
        source_duration: Option<f64>,
    ) -> Result<Self, ValidationError> {
        for (field, value) in [
            ("trim_start", trim_start),
            ("trim_end", trim_end),
            ("volume", volume),
            ("fade_in", fade_in),
            ("fade_out", fade_out),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::NotFinite {
                    field: field.to_string(),
                });
            }
        }

        for (field, value) in [("trim_start", trim_start), ("trim_end", trim_end)] {
            if value < 0.0 {
                return Err(ValidationError::Negative {
                    field: field.to_string(),
                    value,
                });
            }
        }

        if trim_start > trim_end {
            return Err(ValidationError::TrimOrder {
                trim_start,
                trim_end,
            });
        }

        if let Some(source_duration) = source_duration.filter(|d| d.is_finite())
            && trim_end > source_duration + EPSILON
        {
            return Err(ValidationError::TrimBeyondSource {
                trim_end,
                source_duration,
            });
        }

        if !(MIN_VOLUME..=MAX_VOLUME).contains(&volume) {
            return Err(ValidationError::VolumeOutOfRange {
                volume,
                min: MIN_VOLUME,
                max: MAX_VOLUME,
            });
        }

        for (field, value) in [("fade_in", fade_in), ("fade_out", fade_out)] {
            if !(0.0..=MAX_FADE_SECS).contains(&value) {
                return Err(ValidationError::FadeOutOfRange {
                    field: field.to_string(),
                    value,
                    max: MAX_FADE_SECS,
                });
            }
        }

        let clip = trim_end - trim_start;
        let total = fade_in + fade_out;
        if total > clip + EPSILON {
            return Err(ValidationError::FadesExceedClip { total, clip });
        }

        Ok(Self {
            trim_start,
            trim_end,
            volume,
            fade_in,
            fade_out,
        })
    }

    /// Whole source at unity gain with no fades
    pub fn passthrough(source_duration: f64) -> Result<Self, ValidationError> {
        Self::build(0.0, source_duration, 1.0, 0.0, 0.0, Some(source_duration))
    }

    /// Trim window start
    pub fn trim_start(&self) -> f64 {
        self.trim_start
    }

    /// Trim window end
    pub fn trim_end(&self) -> f64 {
        self.trim_end
    }

    /// Linear gain multiplier
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Fade-in length
    pub fn fade_in(&self) -> f64 {
        self.fade_in
    }

    /// Fade-out length
    pub fn fade_out(&self) -> f64 {
        self.fade_out
    }

    /// Length of the trimmed clip
    pub fn clip_duration(&self) -> f64 {
        self.trim_end - self.trim_start
    }

    /// Offset of the fade-out start on the trimmed timeline
    pub fn fade_out_start(&self) -> f64 {
        (self.clip_duration() - self.fade_out).max(0.0)
    }
}
