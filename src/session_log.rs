use crate::error::{ErrorKind, GuiderError, Result};
use crate::stats::SessionLogRecord;
use chrono::Local;
use std::fs::File;
use std::path::PathBuf;

/// Per-session CSV log (§3.11, §6's documented header), opened on session
/// start and closed on session end or abort (§5's cancellation contract).
/// Mirrors the teacher's habit of wrapping a `csv::Writer` rather than
/// shelling out to hand-rolled line formatting.
pub struct SessionLog {
    writer: csv::Writer<File>,
    path: PathBuf,
}

impl SessionLog {
    /// Expands `template` as an `strftime` pattern against the current
    /// local time and opens the resulting path for writing. The header
    /// row is written automatically by `csv::Writer` on the first
    /// `serialize` call.
    pub fn open(template: &str) -> Result<Self> {
        let path = PathBuf::from(Local::now().format(template).to_string());
        let file = File::create(&path).map_err(|e| {
            GuiderError::new(ErrorKind::InvalidValue, format!("could not open log file {path:?}: {e}"))
        })?;
        let writer = csv::Writer::from_writer(file);
        Ok(Self { writer, path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn write_record(&mut self, record: &SessionLogRecord) -> Result<()> {
        self.writer
            .serialize(record)
            .map_err(|e| GuiderError::new(ErrorKind::InvalidValue, format!("log write failed: {e}")))?;
        self.writer
            .flush()
            .map_err(|e| GuiderError::new(ErrorKind::InvalidValue, format!("log flush failed: {e}")))
    }

    pub fn close(mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| GuiderError::new(ErrorKind::InvalidValue, format!("log flush failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::SessionLogRecord;

    #[test]
    fn writes_header_and_rows() {
        let dir = std::env::temp_dir();
        let template = dir.join("guider-test-%Y.csv");
        let mut log = SessionLog::open(template.to_str().unwrap()).unwrap();
        log.write_record(&SessionLogRecord {
            phase: "Guiding".to_string(),
            frame: 1,
            ref_x: 0.0,
            ref_y: 0.0,
            drift_x: 0.1,
            drift_y: -0.2,
            drift_ra: 0.1,
            drift_dec: -0.2,
            corr_ra: 0.05,
            corr_dec: -0.1,
            rmse_ra: 0.05,
            rmse_dec: 0.1,
            rmse_dith: 0.0,
            snr: 30.0,
        })
        .unwrap();
        let path = log.path().to_path_buf();
        log.close().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("phase,frame,ref_x"));
        let _ = std::fs::remove_file(&path);
    }
}
