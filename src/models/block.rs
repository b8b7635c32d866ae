//! Block model.
//!
//! A block is the atomic unit of scheduling: a named UTC interval
//! `[t0, t1]` with a classification (`subtype`, `tag`) and a variant
//! payload. Blocks are values. Rules never edit a block in place; they
//! build a replacement with one of the `with_*` methods.
//!
//! # Variants
//! - **Scan**: a pointing (azimuth, altitude, throw) held for the interval.
//! - **Source**: a visibility window of a named celestial source.
//! - **Iv**: a detector IV calibration window.
//! - **Maintenance**: a hardware maintenance window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Seconds to a duration, rounded to the millisecond. Out-of-range values
/// saturate.
pub(crate) fn seconds(secs: f64) -> Duration {
    let ms = (secs * 1000.0).round() as i64;
    Duration::try_milliseconds(ms).unwrap_or(if ms < 0 { Duration::MIN } else { Duration::MAX })
}

/// A time interval `[t0, t1]`.
///
/// For overlap purposes intervals are half-open: two windows that only
/// touch at an endpoint do not overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Interval start.
    pub t0: DateTime<Utc>,
    /// Interval end.
    pub t1: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a new window.
    pub fn new(t0: DateTime<Utc>, t1: DateTime<Utc>) -> Self {
        Self { t0, t1 }
    }

    /// Duration of this window.
    #[inline]
    pub fn duration(&self) -> Duration {
        self.t1 - self.t0
    }

    /// Whether a timestamp falls within `[t0, t1)`.
    #[inline]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.t0 && t < self.t1
    }

    /// Whether two windows overlap. Touching endpoints do not count.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.t0 < other.t1 && other.t0 < self.t1
    }
}

/// Pointing payload of a scan block (degrees).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pointing {
    /// Azimuth of the scan start.
    pub az: f64,
    /// Altitude (elevation).
    pub alt: f64,
    /// Azimuth throw of the scan.
    pub throw: f64,
    /// Commanded boresight rotation, if the scan requires one.
    pub boresight_rot: Option<f64>,
    /// Azimuth drift rate (deg/s) for drift scans.
    pub az_drift: f64,
}

impl Pointing {
    /// Creates a pointing with no boresight rotation and no drift.
    pub fn new(az: f64, alt: f64, throw: f64) -> Self {
        Self {
            az,
            alt,
            throw,
            boresight_rot: None,
            az_drift: 0.0,
        }
    }

    /// Sets the boresight rotation.
    pub fn with_boresight_rot(mut self, rot: f64) -> Self {
        self.boresight_rot = Some(rot);
        self
    }

    /// Sets the azimuth drift rate.
    pub fn with_az_drift(mut self, az_drift: f64) -> Self {
        self.az_drift = az_drift;
        self
    }

    /// Whether the telescope must move to reach this pointing.
    pub fn differs_from(&self, az: f64, alt: f64) -> bool {
        self.az != az || self.alt != alt
    }
}

/// Whether a source is rising or setting during a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftMode {
    Rising,
    Setting,
}

/// Visibility window payload of a source block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceWindow {
    /// Source name (e.g. "jupiter").
    pub source: String,
    /// Rising or setting.
    pub mode: DriftMode,
    /// Reference azimuth at window start (deg).
    pub az: f64,
    /// Reference altitude at window start (deg).
    pub alt: f64,
}

/// Variant payload of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlockKind {
    Scan(Pointing),
    Source(SourceWindow),
    Iv,
    Maintenance,
}

impl BlockKind {
    /// Short variant name, used in logs and summaries.
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Scan(_) => "scan",
            BlockKind::Source(_) => "source",
            BlockKind::Iv => "iv",
            BlockKind::Maintenance => "maintenance",
        }
    }
}

/// An immutable scheduling block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    name: String,
    t0: DateTime<Utc>,
    t1: DateTime<Utc>,
    subtype: String,
    tag: String,
    kind: BlockKind,
}

impl Block {
    /// Creates a block, rejecting `t0 > t1`.
    pub fn new(
        name: impl Into<String>,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        kind: BlockKind,
    ) -> Result<Self> {
        let name = name.into();
        if t0 > t1 {
            return Err(Error::MalformedInterval { name, t0, t1 });
        }
        Ok(Self {
            name,
            t0,
            t1,
            subtype: String::new(),
            tag: String::new(),
            kind,
        })
    }

    /// Creates a scan block.
    pub fn scan(
        name: impl Into<String>,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        pointing: Pointing,
    ) -> Result<Self> {
        Self::new(name, t0, t1, BlockKind::Scan(pointing))
    }

    /// Creates a source visibility block.
    pub fn source(
        name: impl Into<String>,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        window: SourceWindow,
    ) -> Result<Self> {
        Self::new(name, t0, t1, BlockKind::Source(window))
    }

    /// Creates a block without payload.
    pub fn maintenance(name: impl Into<String>, t0: DateTime<Utc>, t1: DateTime<Utc>) -> Result<Self> {
        Self::new(name, t0, t1, BlockKind::Maintenance)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn t0(&self) -> DateTime<Utc> {
        self.t0
    }

    pub fn t1(&self) -> DateTime<Utc> {
        self.t1
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn kind(&self) -> &BlockKind {
        &self.kind
    }

    /// `t1 - t0`.
    #[inline]
    pub fn duration(&self) -> Duration {
        self.t1 - self.t0
    }

    /// The block's interval.
    #[inline]
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.t0, self.t1)
    }

    /// Whether two blocks overlap in time (touching endpoints do not).
    pub fn overlaps(&self, other: &Block) -> bool {
        self.window().overlaps(&other.window())
    }

    /// Pointing payload, if this is a scan block.
    pub fn pointing(&self) -> Option<&Pointing> {
        match &self.kind {
            BlockKind::Scan(p) => Some(p),
            _ => None,
        }
    }

    /// Whether this block is a calibration block.
    pub fn is_calibration(&self) -> bool {
        self.subtype == "cal"
    }

    /// Returns a copy with a new interval.
    pub fn with_interval(&self, t0: DateTime<Utc>, t1: DateTime<Utc>) -> Result<Self> {
        if t0 > t1 {
            return Err(Error::MalformedInterval {
                name: self.name.clone(),
                t0,
                t1,
            });
        }
        Ok(Self {
            t0,
            t1,
            ..self.clone()
        })
    }

    /// Returns a copy clipped to `window`, or `None` if nothing remains.
    ///
    /// A block that only touches the window at an endpoint is dropped unless
    /// it is itself zero-length and inside the window.
    pub fn clipped(&self, window: &TimeWindow) -> Option<Self> {
        let t0 = self.t0.max(window.t0);
        let t1 = self.t1.min(window.t1);
        if t0 > t1 || (t0 == t1 && self.t0 != self.t1) {
            return None;
        }
        Some(Self {
            t0,
            t1,
            ..self.clone()
        })
    }

    /// Returns a copy with a new name.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Returns a copy with a new subtype.
    pub fn with_subtype(&self, subtype: impl Into<String>) -> Self {
        Self {
            subtype: subtype.into(),
            ..self.clone()
        }
    }

    /// Returns a copy with the tag replaced.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..self.clone()
        }
    }

    /// Returns a copy with `tag` appended to the comma-joined tag list.
    pub fn append_tag(&self, tag: &str) -> Self {
        let tag = if self.tag.is_empty() {
            tag.to_string()
        } else {
            format!("{},{}", self.tag, tag)
        };
        self.with_tag(tag)
    }

    /// Returns a copy with a new payload.
    pub fn with_kind(&self, kind: BlockKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_block_new_rejects_reversed_interval() {
        let err = Block::maintenance("m", t(10), t(5)).unwrap_err();
        assert!(matches!(err, Error::MalformedInterval { .. }));
        assert!(Block::maintenance("m", t(5), t(5)).is_ok());
    }

    #[test]
    fn test_block_duration_and_window() {
        let b = Block::scan("s", t(0), t(600), Pointing::new(180.0, 60.0, 20.0)).unwrap();
        assert_eq!(b.duration(), Duration::seconds(600));
        assert_eq!(b.window(), TimeWindow::new(t(0), t(600)));
        assert_eq!(b.pointing().unwrap().az, 180.0);
        assert_eq!(b.kind().name(), "scan");
    }

    #[test]
    fn test_time_window_overlap_boundaries() {
        let a = TimeWindow::new(t(0), t(100));
        let b = TimeWindow::new(t(50), t(150));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));

        // touching but not overlapping
        let c = TimeWindow::new(t(100), t(200));
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));

        // containment
        let d = TimeWindow::new(t(10), t(20));
        assert!(a.overlaps(&d));
    }

    #[test]
    fn test_time_window_contains() {
        let w = TimeWindow::new(t(100), t(200));
        assert!(w.contains(t(100)));
        assert!(w.contains(t(199)));
        assert!(!w.contains(t(200)));
    }

    #[test]
    fn test_clipped() {
        let b = Block::maintenance("m", t(0), t(100)).unwrap();
        let w = TimeWindow::new(t(50), t(200));
        let c = b.clipped(&w).unwrap();
        assert_eq!(c.t0(), t(50));
        assert_eq!(c.t1(), t(100));
        assert_eq!(c.name(), "m");

        assert!(b.clipped(&TimeWindow::new(t(100), t(200))).is_none());
        assert!(b.clipped(&TimeWindow::new(t(300), t(400))).is_none());
    }

    #[test]
    fn test_replacement_preserves_payload() {
        let b = Block::scan("s", t(0), t(10), Pointing::new(1.0, 2.0, 3.0))
            .unwrap()
            .with_subtype("cmb")
            .append_tag("a")
            .append_tag("b");
        assert_eq!(b.tag(), "a,b");
        assert_eq!(b.subtype(), "cmb");

        let moved = b.with_interval(t(2), t(8)).unwrap();
        assert_eq!(moved.pointing(), b.pointing());
        assert_eq!(moved.tag(), "a,b");
        assert!(b.with_interval(t(8), t(2)).is_err());
    }

    #[test]
    fn test_is_calibration() {
        let b = Block::maintenance("m", t(0), t(1)).unwrap();
        assert!(!b.is_calibration());
        assert!(b.with_subtype("cal").is_calibration());
    }

    #[test]
    fn test_pointing_differs() {
        let p = Pointing::new(180.0, 60.0, 10.0).with_boresight_rot(45.0);
        assert!(!p.differs_from(180.0, 60.0));
        assert!(p.differs_from(181.0, 60.0));
        assert_eq!(p.boresight_rot, Some(45.0));
    }
}
