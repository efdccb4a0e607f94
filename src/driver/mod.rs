//! Modem driver surface shared by all concrete drivers.
//!
//! A driver owns the physical link and exposes exactly two inbound methods
//! (`handle_initiate_transmission` from the MAC, plus its `do_work` tick) and
//! a synchronous event sink wired at construction. Handlers run on the
//! caller's thread; a transmission grant issued from inside a handler is
//! deferred to the driver's next tick instead of being processed
//! recursively, so handlers never re-enter the driver beyond depth one.

pub mod iridium;
pub mod transmission;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::driver::transmission::ModemTransmission;

/// Synchronous sink for the driver's outbound signals.
#[cfg_attr(test, automock)]
pub trait DriverEvents {
    /// Last chance to adjust a transmission before the data request runs.
    fn modify_transmission(&mut self, _transmission: &mut ModemTransmission) {}

    /// Fill the transmission's frames with outbound payload.
    fn data_request(&mut self, transmission: &mut ModemTransmission);

    /// A complete transmission arrived from the link.
    fn receive(&mut self, transmission: ModemTransmission);

    /// Raw line as read from the wire (logging / diagnostics).
    fn raw_incoming(&mut self, _raw: &str) {}

    /// Raw line as written to the wire.
    fn raw_outgoing(&mut self, _raw: &str) {}
}

/// Optional raw traffic log: one line per I/O, `[rx] ` / `[tx] ` prefixed.
/// The filename pattern is strftime-expanded once at startup.
pub struct RawLog {
    out: BufWriter<File>,
}

impl RawLog {
    pub fn create(pattern: &str, now: DateTime<Utc>) -> anyhow::Result<RawLog> {
        let file_name = now.format(pattern).to_string();
        debug!(file = %file_name, "logging raw modem traffic");
        let file = File::create(Path::new(&file_name))?;
        Ok(RawLog {
            out: BufWriter::new(file),
        })
    }

    pub fn rx(&mut self, raw: &str) {
        self.write_line("[rx] ", raw);
    }

    pub fn tx(&mut self, raw: &str) {
        self.write_line("[tx] ", raw);
    }

    fn write_line(&mut self, prefix: &str, raw: &str) {
        let line = format!("{}{}\n", prefix, raw.trim_end_matches(['\r', '\n']));
        if let Err(e) = self.out.write_all(line.as_bytes()).and_then(|_| self.out.flush()) {
            warn!(error = %e, "failed to write raw log line");
        }
    }
}
