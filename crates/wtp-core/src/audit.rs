//! Append-only packet audit record, one `type seqNum length checksum` line per
//! packet, flushed after every line.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use wtp_abstract::PacketHeader;

pub struct AuditLog<W: Write> {
    writer: W,
    lines: u64,
}

impl AuditLog<BufWriter<File>> {
    /// Open `path` for writing, truncating anything already there.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> AuditLog<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, lines: 0 }
    }

    pub fn record(&mut self, header: &PacketHeader) -> io::Result<()> {
        writeln!(self.writer, "{header}")?;
        self.writer.flush()?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wtp_abstract::PacketType;

    #[test]
    fn writes_one_line_per_header() {
        let mut log = AuditLog::new(Vec::new());
        let data = PacketHeader::sealed(PacketType::Data, 4, b"abc");
        log.record(&data).unwrap();
        log.record(&PacketHeader::ack(5)).unwrap();
        assert_eq!(log.lines(), 2);

        let text = String::from_utf8(log.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!("2 4 3 {}", data.checksum));
        assert!(lines[1].starts_with("3 5 0 "));
    }
}
