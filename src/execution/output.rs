//! Per-call console capture.
//!
//! The sandbox holds an [`OutputCollector`]; the coordinator holds the
//! matching [`CapturedOutput`]. Finishing the capture seals it, and every
//! write that arrives afterwards is dropped.

use tokio::sync::mpsc::{self, error::TryRecvError};

#[derive(Debug, Clone)]
pub struct OutputCollector {
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug)]
pub struct CapturedOutput {
    rx: mpsc::UnboundedReceiver<String>,
}

pub fn channel() -> (OutputCollector, CapturedOutput) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutputCollector { tx }, CapturedOutput { rx })
}

impl OutputCollector {
    /// Records one console line. Returns false once the capture is sealed.
    pub fn write(&self, line: String) -> bool {
        self.tx.send(line).is_ok()
    }

    pub fn is_sealed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl CapturedOutput {
    /// Seals the capture and returns the lines written so far, joined with
    /// `\n`. Nothing written, or only empty text, is `None`.
    pub fn finish(mut self) -> Option<String> {
        self.rx.close();
        let mut lines = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(line) => lines.push(line),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        let text = lines.join("\n");
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}
