use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;

use super::{RawTick, TickSource};

/// In-process source fed through a channel
pub struct ChannelSource {
    name: String,
    rx: mpsc::Receiver<RawTick>,
}

impl ChannelSource {
    pub fn new(name: &str, buffer: usize) -> (mpsc::Sender<RawTick>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            tx,
            Self {
                name: name.to_string(),
                rx,
            },
        )
    }
}

#[async_trait]
impl TickSource for ChannelSource {
    async fn next_raw(&mut self) -> crate::Result<Option<RawTick>> {
        Ok(self.rx.recv().await)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Newline-delimited JSON ticks from any async reader (stdin replay)
///
/// Blank lines are skipped; a malformed line is an error for that line only.
pub struct JsonLinesSource<R> {
    name: String,
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(name: &str, reader: R) -> Self {
        Self {
            name: name.to_string(),
            lines: reader.lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> TickSource for JsonLinesSource<R> {
    async fn next_raw(&mut self) -> crate::Result<Option<RawTick>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let raw: RawTick = serde_json::from_str(line)?;
            return Ok(Some(raw));
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
