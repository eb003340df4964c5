//! Publication of the frequency report to readers

use chrono::{DateTime, Local};

use std::{
    convert::TryFrom,
    io,
    sync::{Arc, PoisonError, RwLock},
};

/// Immutable snapshot of the frequency report
#[derive(Debug)]
pub struct Report {
    /// Rendered report text
    text: String,

    /// Time at which this report was published
    published_at: DateTime<Local>,
}

impl Report {
    /// Stamp a report with the current local time
    fn new(text: String) -> Self {
        Self {
            text,
            published_at: Local::now(),
        }
    }

    /// Rendered report text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Rendered report, as bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    /// Time at which this report was published
    ///
    /// The empty initial report counts as published when the publication
    /// channel is set up.
    ///
    pub fn published_at(&self) -> DateTime<Local> {
        self.published_at
    }

    /// Copy the part of the report starting at `*pos` into `buf`
    ///
    /// Advances `*pos` by the number of bytes copied, which is returned. Zero
    /// is returned once `*pos` reaches the end of the report.
    ///
    pub fn read_at(&self, buf: &mut [u8], pos: &mut u64) -> usize {
        let bytes = self.as_bytes();
        let start = match usize::try_from(*pos) {
            Ok(start) if start < bytes.len() => start,
            _ => return 0,
        };
        let len = buf.len().min(bytes.len() - start);
        buf[..len].copy_from_slice(&bytes[start..start + len]);
        *pos += len as u64;
        len
    }
}

/// Slot holding the currently published report
///
/// The lock is only held long enough to clone or swap the `Arc`, so readers
/// never wait for a refresh to complete and never see a partial report.
///
type Slot = Arc<RwLock<Arc<Report>>>;

/// Set up a report publication channel, initially holding an empty report
pub fn publication() -> (Publisher, ReportEndpoint) {
    let slot = Slot::new(RwLock::new(Arc::new(Report::new(String::new()))));
    (
        Publisher { slot: slot.clone() },
        ReportEndpoint { slot },
    )
}

/// Writing side of the report publication channel
pub struct Publisher {
    slot: Slot,
}

impl Publisher {
    /// Replace the published report with a new one
    pub fn publish(&self, text: String) -> Arc<Report> {
        let report = Arc::new(Report::new(text));
        let mut current = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *current = report.clone();
        report
    }

    /// Get a read-only view of the published report
    pub fn endpoint(&self) -> ReportEndpoint {
        ReportEndpoint {
            slot: self.slot.clone(),
        }
    }
}

/// Read-only access to the most recently published report
#[derive(Clone)]
pub struct ReportEndpoint {
    slot: Slot,
}

impl ReportEndpoint {
    /// Currently published report
    pub fn snapshot(&self) -> Arc<Report> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read the currently published report, starting at `*pos`
    ///
    /// Each call reads from the report that is published at the time of the
    /// call. Use `open()` to read a single report in several chunks.
    ///
    pub fn read(&self, buf: &mut [u8], pos: &mut u64) -> usize {
        self.snapshot().read_at(buf, pos)
    }

    /// Start reading the currently published report
    pub fn open(&self) -> ReportCursor {
        ReportCursor {
            report: self.snapshot(),
            pos: 0,
        }
    }
}

/// Reader of one report snapshot, unaffected by later publications
pub struct ReportCursor {
    report: Arc<Report>,
    pos: u64,
}

impl ReportCursor {
    /// Report being read
    pub fn report(&self) -> &Report {
        &self.report
    }
}

impl io::Read for ReportCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.report.read_at(buf, &mut self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;

    const REPORT: &str = "CPU 0 Frequency: 2500 MHz, Max: 3400 MHz, Min: 1200 MHz\n\
                          CPU 2 Frequency: 1800 MHz, Max: 1800 MHz, Min: 1800 MHz\n";

    #[test]
    fn initial_report_is_empty() {
        let (_publisher, endpoint) = publication();
        let mut buf = [0u8; 64];
        let mut pos = 0;
        assert_eq!(endpoint.read(&mut buf, &mut pos), 0);
        assert_eq!(pos, 0);
    }

    #[test]
    fn whole_read() {
        let (publisher, endpoint) = publication();
        publisher.publish(REPORT.to_owned());
        let mut buf = vec![0u8; 4096];
        let mut pos = 0;
        let len = endpoint.read(&mut buf, &mut pos);
        assert_eq!(&buf[..len], REPORT.as_bytes());
        assert_eq!(pos, REPORT.len() as u64);
        assert_eq!(endpoint.read(&mut buf, &mut pos), 0);
    }

    #[test]
    fn chunked_reads_match_whole_read() {
        let (publisher, endpoint) = publication();
        publisher.publish(REPORT.to_owned());
        for split in 0..=REPORT.len() {
            let mut pos = 0;
            let mut first = vec![0u8; split];
            let first_len = endpoint.read(&mut first, &mut pos);
            assert_eq!(first_len, split);
            let mut rest = vec![0u8; 4096];
            let rest_len = endpoint.read(&mut rest, &mut pos);
            let mut joined = first;
            joined.extend_from_slice(&rest[..rest_len]);
            assert_eq!(joined, REPORT.as_bytes());
        }
    }

    #[test]
    fn reads_past_the_end() {
        let (publisher, endpoint) = publication();
        publisher.publish(REPORT.to_owned());
        let mut buf = [0u8; 8];
        let mut pos = u64::MAX;
        assert_eq!(endpoint.read(&mut buf, &mut pos), 0);
        assert_eq!(pos, u64::MAX);
    }

    #[test]
    fn publication_replaces_report() {
        let (publisher, endpoint) = publication();
        let initial = endpoint.snapshot();
        let old = publisher.publish("old\n".to_owned());
        let new = publisher.publish("new\n".to_owned());
        assert_eq!(endpoint.snapshot().text(), "new\n");
        assert!(initial.published_at() <= old.published_at());
        assert!(old.published_at() <= new.published_at());
        assert_eq!(endpoint.snapshot().published_at(), new.published_at());
        assert_eq!(publisher.endpoint().snapshot().text(), "new\n");
    }

    #[test]
    fn cursor_pins_its_snapshot() {
        let (publisher, endpoint) = publication();
        publisher.publish(REPORT.to_owned());
        let mut cursor = endpoint.open();
        let mut head = [0u8; 10];
        cursor.read_exact(&mut head).unwrap();
        publisher.publish("something else entirely\n".to_owned());
        let mut tail = String::new();
        cursor.read_to_string(&mut tail).unwrap();
        assert_eq!(format!("{}{}", String::from_utf8_lossy(&head), tail), REPORT);
        assert_eq!(cursor.report().text(), REPORT);
    }

    #[test]
    fn concurrent_readers_see_whole_reports() {
        let (publisher, endpoint) = publication();
        let reports = ["a\n".repeat(100), "bb\n".repeat(100)];
        publisher.publish(reports[0].clone());
        let readers = (0..4)
            .map(|_| {
                let endpoint = endpoint.clone();
                let reports = reports.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut text = String::new();
                        endpoint.open().read_to_string(&mut text).unwrap();
                        assert!(reports.contains(&text));
                    }
                })
            })
            .collect::<Vec<_>>();
        for i in 0..1000 {
            publisher.publish(reports[i % 2].clone());
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
