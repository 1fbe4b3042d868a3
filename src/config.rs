use serde::{Deserialize, Serialize};

/// Which algorithm the drift detector runs, and what reference data it keeps.
/// Immutable for the lifetime of an active session (§3.1).
#[derive(Debug, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMode {
    Selection,
    WeightedSelection,
    Donuts,
    Centroid,
}

/// Filters the sign of declination corrections (§3.2). Cannot be toggled
/// into or out of `Both` while a guiding session is active.
#[derive(Debug, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecGuidingMode {
    Both,
    NorthOnly,
    SouthOnly,
    None,
}

/// How the guiding loop reacts to a capture or detection failure (§4.5, §9
/// supplemented-features list).
#[derive(Debug, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryPolicy {
    FailOnError,
    ContinueOnError,
    ResetOnError,
}

/// Dither offset strategy (§4.5).
#[derive(Debug, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DitherStrategy {
    Random,
    Spiral,
    RandomizedSpiral,
}

/// An axis-aligned rectangle in sensor pixel coordinates, used for DONUTS
/// include/exclude regions and for auto-subframe bookkeeping.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Calibration outputs and tunables held as a single record (§3.4). Mutable
/// between sessions, treated as read-only snapshot during one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub exposure_s: f64,
    pub delay_s: f64,

    pub calibration_step_s: f64,
    pub backlash_clear_max_steps: u32,
    pub backlash_clear_min_drift_px: f64,
    pub calibration_max_steps: u32,
    pub calibration_min_drift_px: f64,

    // Computed outputs of calibration.
    pub angle_deg: f64,
    pub side_of_pier: i8,
    pub backlash_px: f64,
    pub speed_ra_px_per_s: f64,
    pub speed_dec_px_per_s: f64,

    pub min_err_px: f64,
    pub min_pulse_s: f64,
    pub max_pulse_s: f64,

    pub aggr_ra_pct: f64,
    pub aggr_dec_pct: f64,
    pub i_gain_ra: f64,
    pub i_gain_dec: f64,
    pub stack_size: usize,

    pub dither_amount_px: f64,
    pub dither_settle_s: f64,
    pub dither_settle_frames: u32,
    pub dither_strategy: DitherStrategy,

    pub dec_guiding_mode: DecGuidingMode,
    pub flip_reverses_dec: bool,

    pub recovery_policy: RecoveryPolicy,
    pub min_usable_stars: u32,
    pub wait_all_stars: bool,
    pub silence_warnings: bool,

    pub auto_subframe_enabled: bool,
    pub auto_subframe_radius_px: u32,
    pub auto_subframe_margin_px: u32,

    pub use_include_for_donuts: bool,
    pub edge_clipping_px: u32,
    pub include_rect: Option<Rect>,
    pub exclude_rect: Option<Rect>,

    pub selection_radius_px: f64,

    pub log_path_template: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exposure_s: 1.0,
            delay_s: 1.0,
            calibration_step_s: 0.2,
            backlash_clear_max_steps: 5,
            backlash_clear_min_drift_px: 3.0,
            calibration_max_steps: 20,
            calibration_min_drift_px: 20.0,
            angle_deg: 0.0,
            side_of_pier: 0,
            backlash_px: 0.0,
            speed_ra_px_per_s: 0.0,
            speed_dec_px_per_s: 0.0,
            min_err_px: 0.3,
            min_pulse_s: 0.0,
            max_pulse_s: 3.0,
            aggr_ra_pct: 70.0,
            aggr_dec_pct: 70.0,
            i_gain_ra: 0.0,
            i_gain_dec: 0.0,
            stack_size: 10,
            dither_amount_px: 5.0,
            dither_settle_s: 10.0,
            dither_settle_frames: 3,
            dither_strategy: DitherStrategy::Random,
            dec_guiding_mode: DecGuidingMode::Both,
            flip_reverses_dec: true,
            recovery_policy: RecoveryPolicy::ResetOnError,
            min_usable_stars: 1,
            wait_all_stars: false,
            silence_warnings: false,
            auto_subframe_enabled: false,
            auto_subframe_radius_px: 32,
            auto_subframe_margin_px: 16,
            use_include_for_donuts: false,
            edge_clipping_px: 20,
            include_rect: None,
            exclude_rect: None,
            selection_radius_px: 16.0,
            log_path_template: "guider-%Y%m%d-%H%M%S.csv".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from the platform config location under `app_name`,
    /// falling back to defaults if none were ever saved (mirrors the
    /// teacher's `confy::load_path` usage for its own settings file).
    pub fn load(app_name: &str) -> crate::error::Result<Self> {
        confy::load(app_name, None).map_err(|e| {
            crate::error::GuiderError::new(
                crate::error::ErrorKind::InvalidValue,
                format!("failed to load settings: {e}"),
            )
        })
    }

    pub fn save(&self, app_name: &str) -> crate::error::Result<()> {
        confy::store(app_name, None, self).map_err(|e| {
            crate::error::GuiderError::new(
                crate::error::ErrorKind::InvalidValue,
                format!("failed to save settings: {e}"),
            )
        })
    }

    /// Settings that may not change while a session is active (§6, §7's
    /// `ConfigurationLocked`).
    pub fn locked_during_session(field: &str) -> bool {
        matches!(
            field,
            "edge_clipping_px" | "detection_mode" | "min_usable_stars" | "dec_guiding_mode_both"
        )
    }
}
