//! Per-vehicle append log.
//!
//! A plain text file recording received peer packets and own positions,
//! one record per line, flushed on every write. This is the only telemetry
//! persistence the runtime does.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

/// Append-only log for one vehicle, written as `{dir}/{vehicle_id}.log`.
#[derive(Debug)]
pub struct PacketLog {
    writer: Mutex<BufWriter<File>>,
}

impl PacketLog {
    /// Create (truncating) the log file for `vehicle_id` under `dir`.
    pub fn create(dir: &Path, vehicle_id: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = File::create(dir.join(format!("{vehicle_id}.log")))?;
        Ok(Self { writer: Mutex::new(BufWriter::new(file)) })
    }

    /// Record a received peer packet.
    pub fn log_packet(&self, source: &str, payload: &str) -> std::io::Result<()> {
        self.write_line(&format!("RX_MSG;{};{source};{payload}", wall_clock()))
    }

    /// Record the vehicle's own position.
    pub fn log_position(&self, x: f64, y: f64) -> std::io::Result<()> {
        self.write_line(&format!("POS;{};{x};{y}", wall_clock()))
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}")?;
        writer.flush()
    }
}

fn wall_clock() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0.0, |d| d.as_secs_f64())
}
