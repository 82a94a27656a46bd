use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc::UnboundedSender;

use crate::common::error::SinkError;
use crate::ordering::message::Envelope;
use crate::ordering::peers::PeerIdentity;

/// Where delivered application messages end up, in delivery order.
pub trait DeliverySink {
    fn deliver(&mut self, envelope: &Envelope) -> Result<(), SinkError>;
}

pub fn format_delivery(envelope: &Envelope) -> String {
    format!("{}: {}", envelope.peer_ip, envelope.text)
}

/// Appends `<origin>: <payload>` lines to `messages_<id>.log` and echoes
/// them to stdout.
pub struct LogFileSink {
    path: PathBuf,
    file: File,
    echo: bool,
}

impl LogFileSink {
    pub fn open(dir: &Path, id: &PeerIdentity) -> Result<Self, SinkError> {
        let path = dir.join(log_file_name(id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(LogFileSink {
            path,
            file,
            echo: true,
        })
    }

    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeliverySink for LogFileSink {
    fn deliver(&mut self, envelope: &Envelope) -> Result<(), SinkError> {
        let line = format_delivery(envelope);
        if self.echo {
            println!("{line}");
        }
        writeln!(self.file, "{line}")?;
        Ok(())
    }
}

pub fn log_file_name(id: &PeerIdentity) -> String {
    format!("messages_{}.log", id.as_str().replace(':', "_"))
}

/// Hands delivered envelopes to another task.
pub struct ChannelSink(pub UnboundedSender<Envelope>);

impl DeliverySink for ChannelSink {
    fn deliver(&mut self, envelope: &Envelope) -> Result<(), SinkError> {
        self.0.send(envelope.clone()).map_err(|_| SinkError::Closed)
    }
}

impl DeliverySink for Vec<Envelope> {
    fn deliver(&mut self, envelope: &Envelope) -> Result<(), SinkError> {
        self.push(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_appends_one_line_per_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let id = PeerIdentity::from("127.0.0.1:4001");

        let mut sink = LogFileSink::open(dir.path(), &id).unwrap().quiet();
        sink.deliver(&Envelope::new("Dunk", 1, "10.0.0.1".into())).unwrap();
        sink.deliver(&Envelope::new("Layup", 2, "10.0.0.2".into())).unwrap();

        // Reopening appends rather than truncates.
        let mut sink = LogFileSink::open(dir.path(), &id).unwrap().quiet();
        sink.deliver(&Envelope::new("Steal", 3, "10.0.0.3".into())).unwrap();

        assert_eq!(sink.path(), dir.path().join("messages_127.0.0.1_4001.log"));
        let contents = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(contents, "10.0.0.1: Dunk\n10.0.0.2: Layup\n10.0.0.3: Steal\n");
    }

    #[test]
    fn test_channel_sink_reports_closed_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sink = ChannelSink(tx);
        drop(rx);

        let result = sink.deliver(&Envelope::new("Dunk", 1, "a".into()));
        assert!(matches!(result, Err(SinkError::Closed)));
    }
}
