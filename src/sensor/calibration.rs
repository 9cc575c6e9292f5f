// Raw sample -> pressure -> force conversion for the 6x6 array
//
// pressure_kPa = slope * raw + intercept - offset
// force_N      = pressure_kPa * 1000 * site_area_m2

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::frame::{PressureFrame, SENSOR_COUNT};

/// Sites are 2.5 mm x 2.5 mm
pub const SITE_AREA_M2: f32 = 2.5e-3 * 2.5e-3;

/// The array is a 6x6 grid
pub const GRID_SIZE: usize = 6;

/// Idle frames needed for a zero-offset pass
pub const MIN_ZERO_FRAMES: usize = 10;

/// Factory (slope, intercept) pairs, site 0 first
const FACTORY_TABLE: [(f32, f32); SENSOR_COUNT] = [
    (0.562714, -14.79), (0.395393, 10.1), (0.418163, -23.95),
    (0.446264, -2.56), (0.320379, -5.81), (0.339545, -0.79),
    (0.880961, -79.67), (0.511704, -2.75), (0.532828, -48.19),
    (0.579626, -38.1), (0.459192, -66.58), (0.457822, -28.08),
    (0.554179, -49.81), (0.408191, -1.81), (0.517851, -48.86),
    (0.613271, -21.8), (0.451063, -67.59), (0.390688, -62.41),
    (0.647005, -82.75), (0.414492, -20.47), (0.49972, -78.84),
    (0.510365, -32.84), (0.454021, -60.85), (0.565351, -38.52),
    (0.773406, -53.7), (0.418644, -3.49), (0.437578, -42.11),
    (0.528323, -15.28), (0.356723, -34.61), (0.502185, -32.73),
    (0.710866, -77.16), (0.616831, -22.65), (0.672263, -60.23),
    (0.673123, 3.31), (0.45524, -11.36), (0.471449, 5.94),
];

/// Error types for calibration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("Insufficient frames for zero calibration: got {got}, need {needed}")]
    InsufficientFrames { got: usize, needed: usize },

    #[error("Calibration table must have {expected} entries, got {actual}")]
    TableSize { expected: usize, actual: usize },
}

/// Linear raw -> kPa mapping for one site
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    pub slope: f32,
    pub intercept: f32,
}

impl CalibrationEntry {
    pub fn pressure_kpa(&self, raw: u16) -> f32 {
        self.slope * raw as f32 + self.intercept
    }
}

/// One entry per site; always exactly `SENSOR_COUNT` long
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    entries: [CalibrationEntry; SENSOR_COUNT],
}

impl CalibrationTable {
    pub fn factory() -> Self {
        let mut entries = [CalibrationEntry::default(); SENSOR_COUNT];
        for (entry, &(slope, intercept)) in entries.iter_mut().zip(FACTORY_TABLE.iter()) {
            *entry = CalibrationEntry { slope, intercept };
        }
        Self { entries }
    }

    pub fn uniform(entry: CalibrationEntry) -> Self {
        Self {
            entries: [entry; SENSOR_COUNT],
        }
    }

    pub fn from_entries(entries: &[CalibrationEntry]) -> Result<Self, CalibrationError> {
        let entries: [CalibrationEntry; SENSOR_COUNT] =
            entries.try_into().map_err(|_| CalibrationError::TableSize {
                expected: SENSOR_COUNT,
                actual: entries.len(),
            })?;
        Ok(Self { entries })
    }

    pub fn entry(&self, site: usize) -> &CalibrationEntry {
        &self.entries[site]
    }

    pub fn entries(&self) -> &[CalibrationEntry; SENSOR_COUNT] {
        &self.entries
    }
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self::factory()
    }
}

/// Per-site baseline (kPa) measured with no load
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZeroOffset {
    pub kpa: [f32; SENSOR_COUNT],
}

impl ZeroOffset {
    pub fn zero() -> Self {
        Self {
            kpa: [0.0; SENSOR_COUNT],
        }
    }
}

/// Convert one raw sample into force (N). Pure.
pub fn to_force(raw: u16, entry: &CalibrationEntry, offset_kpa: f32) -> f32 {
    let pressure_kpa = entry.pressure_kpa(raw) - offset_kpa;
    pressure_kpa * 1000.0 * SITE_AREA_M2
}

/// Compute the zero offset from a window of idle frames
///
/// Only frames flagged valid count towards the window.
pub fn zero_calibrate(frames: &[PressureFrame], table: &CalibrationTable) -> Result<ZeroOffset, CalibrationError> {
    let valid: Vec<&PressureFrame> = frames.iter().filter(|f| f.valid).collect();
    if valid.len() < MIN_ZERO_FRAMES {
        return Err(CalibrationError::InsufficientFrames {
            got: valid.len(),
            needed: MIN_ZERO_FRAMES,
        });
    }

    let mut offset = ZeroOffset::zero();
    for (site, kpa) in offset.kpa.iter_mut().enumerate() {
        let entry = table.entry(site);
        let sum: f32 = valid.iter().map(|f| entry.pressure_kpa(f.samples[site])).sum();
        *kpa = sum / valid.len() as f32;
    }

    info!("Zero offset computed from {} frames", valid.len());
    debug!("Zero offset (kPa): {:?}", offset.kpa);
    Ok(offset)
}

/// Grip force estimate derived from one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateForce {
    /// Sum of per-site forces (N), each site floored at zero
    pub total_n: f32,
    /// Site with the highest offset-corrected pressure
    pub peak_site: usize,
    pub peak_pressure_kpa: f32,
}

/// Sum the 36 calibrated, offset-corrected site forces
///
/// Negative site forces (reading below the zero baseline) contribute nothing.
pub fn aggregate(frame: &PressureFrame, table: &CalibrationTable, offset: &ZeroOffset) -> AggregateForce {
    let mut total_n = 0.0;
    let mut peak_site = 0;
    let mut peak_pressure_kpa = f32::NEG_INFINITY;

    for site in 0..SENSOR_COUNT {
        let entry = table.entry(site);
        let raw = frame.samples[site];

        let pressure = entry.pressure_kpa(raw) - offset.kpa[site];
        if pressure > peak_pressure_kpa {
            peak_pressure_kpa = pressure;
            peak_site = site;
        }

        total_n += to_force(raw, entry, offset.kpa[site]).max(0.0);
    }

    AggregateForce {
        total_n,
        peak_site,
        peak_pressure_kpa,
    }
}

/// Grid (x, y) of a site, Y axis inverted to match the physical layout
pub fn grid_position(site: usize) -> Option<(usize, usize)> {
    if site >= SENSOR_COUNT {
        return None;
    }
    let x = site % GRID_SIZE;
    let y = GRID_SIZE - 1 - site / GRID_SIZE;
    Some((x, y))
}

pub fn site_at(x: usize, y: usize) -> Option<usize> {
    if x >= GRID_SIZE || y >= GRID_SIZE {
        return None;
    }
    Some((GRID_SIZE - 1 - y) * GRID_SIZE + x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(f: impl Fn(usize) -> u16) -> PressureFrame {
        let mut samples = [0u16; SENSOR_COUNT];
        for (site, s) in samples.iter_mut().enumerate() {
            *s = f(site);
        }
        PressureFrame::new(samples)
    }

    #[test]
    fn test_to_force() {
        let entry = CalibrationEntry { slope: 0.5, intercept: -10.0 };
        // 0.5 * 200 - 10 - 20 = 70 kPa -> 70e3 Pa * 6.25e-6 m² = 0.4375 N
        let force = to_force(200, &entry, 20.0);
        assert!((force - 0.4375).abs() < 1e-6);
    }

    #[test]
    fn test_zero_frame_with_zero_table_is_zero_force() {
        let table = CalibrationTable::uniform(CalibrationEntry { slope: 0.0, intercept: 0.0 });
        let force = aggregate(&frame_with(|_| 0), &table, &ZeroOffset::zero());
        assert_eq!(force.total_n, 0.0);
    }

    #[test]
    fn test_factory_table_has_every_site() {
        let table = CalibrationTable::factory();
        assert_eq!(table.entries().len(), SENSOR_COUNT);
        assert_eq!(*table.entry(0), CalibrationEntry { slope: 0.562714, intercept: -14.79 });
        assert_eq!(*table.entry(35), CalibrationEntry { slope: 0.471449, intercept: 5.94 });
    }

    #[test]
    fn test_table_size_is_enforced() {
        let entries = vec![CalibrationEntry::default(); 35];
        assert_eq!(
            CalibrationTable::from_entries(&entries),
            Err(CalibrationError::TableSize { expected: 36, actual: 35 })
        );
    }

    #[test]
    fn test_zero_calibration_removes_window_mean() {
        let table = CalibrationTable::factory();
        let frames: Vec<PressureFrame> = (0..12)
            .map(|k| frame_with(|site| 150 + (site as u16 * 3) + (k % 4) as u16 * 5))
            .collect();

        let offset = zero_calibrate(&frames, &table).unwrap();

        for site in 0..SENSOR_COUNT {
            let entry = table.entry(site);
            let mean: f32 = frames
                .iter()
                .map(|f| entry.pressure_kpa(f.samples[site]) - offset.kpa[site])
                .sum::<f32>()
                / frames.len() as f32;
            assert!(mean.abs() < 1e-3, "site {} residual mean {}", site, mean);
        }
    }

    #[test]
    fn test_zero_calibration_needs_enough_valid_frames() {
        let table = CalibrationTable::factory();
        let mut frames = vec![frame_with(|_| 100); 12];
        for frame in frames.iter_mut().take(4) {
            frame.valid = false;
        }

        assert_eq!(
            zero_calibrate(&frames, &table),
            Err(CalibrationError::InsufficientFrames { got: 8, needed: 10 })
        );
    }

    #[test]
    fn test_aggregate_ignores_sites_below_baseline() {
        let table = CalibrationTable::uniform(CalibrationEntry { slope: 1.0, intercept: 0.0 });
        let mut offset = ZeroOffset::zero();
        offset.kpa = [100.0; SENSOR_COUNT];

        // site 7 loaded to 180 kPa above baseline, the rest sit 20 kPa below it
        let frame = frame_with(|site| if site == 7 { 280 } else { 80 });
        let force = aggregate(&frame, &table, &offset);

        assert!((force.total_n - 180.0 * 1000.0 * SITE_AREA_M2).abs() < 1e-5);
        assert_eq!(force.peak_site, 7);
        assert!((force.peak_pressure_kpa - 180.0).abs() < 1e-4);
    }

    #[test]
    fn test_grid_mapping() {
        assert_eq!(grid_position(0), Some((0, 5)));
        assert_eq!(grid_position(5), Some((5, 5)));
        assert_eq!(grid_position(35), Some((5, 0)));
        assert_eq!(grid_position(36), None);

        for site in 0..SENSOR_COUNT {
            let (x, y) = grid_position(site).unwrap();
            assert_eq!(site_at(x, y), Some(site));
        }
    }
}
