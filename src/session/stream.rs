//! Channel stream endpoints
//!
//! A channel pulls its stdin from an [`InputSource`] and pushes stdout/stderr
//! into [`OutputSink`]s once per tick. Both are plain traits so callers can
//! plug in closures; [`ChannelStreams::queued`] wires them to bounded tokio
//! queues for async consumers.

use tokio::sync::mpsc;

use crate::ssh::SshError;

/// ETX, what a terminal sends for Ctrl-C
pub const ETX: u8 = 0x03;

/// What the input source has for this tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Data(Vec<u8>),
    /// Nothing right now
    Idle,
    /// No more input will ever come
    Done,
}

pub trait InputSource: Send {
    fn pull(&mut self) -> Input;
}

impl<F> InputSource for F
where
    F: FnMut() -> Input + Send,
{
    fn pull(&mut self) -> Input {
        self()
    }
}

pub trait OutputSink: Send {
    /// When false the channel leaves data buffered in the protocol layer.
    fn has_capacity(&self) -> bool {
        true
    }

    /// An empty chunk means "no new data this tick".
    fn push(&mut self, chunk: &[u8]);
}

impl<F> OutputSink for F
where
    F: FnMut(&[u8]) + Send,
{
    fn push(&mut self, chunk: &[u8]) {
        self(chunk)
    }
}

/// Stream endpoints handed to `create_terminal` / `run_command`
#[derive(Default)]
pub struct ChannelStreams {
    pub stdin: Option<Box<dyn InputSource>>,
    pub stdout: Option<Box<dyn OutputSink>>,
    pub stderr: Option<Box<dyn OutputSink>>,
}

impl ChannelStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdin(mut self, source: impl InputSource + 'static) -> Self {
        self.stdin = Some(Box::new(source));
        self
    }

    pub fn stdout(mut self, sink: impl OutputSink + 'static) -> Self {
        self.stdout = Some(Box::new(sink));
        self
    }

    pub fn stderr(mut self, sink: impl OutputSink + 'static) -> Self {
        self.stderr = Some(Box::new(sink));
        self
    }

    /// Endpoints backed by bounded queues, plus the caller's ends of them.
    pub fn queued(depth: usize) -> (Self, StreamHandles) {
        let depth = depth.max(1);
        let (input, input_queue) = input_queue(depth);
        let (stdout_queue, stdout) = output_queue(depth);
        let (stderr_queue, stderr) = output_queue(depth);
        (
            Self::new()
                .stdin(input_queue)
                .stdout(stdout_queue)
                .stderr(stderr_queue),
            StreamHandles {
                input,
                stdout,
                stderr,
            },
        )
    }
}

/// Caller side of [`ChannelStreams::queued`]
pub struct StreamHandles {
    pub input: InputWriter,
    pub stdout: OutputReader,
    pub stderr: OutputReader,
}

pub fn input_queue(depth: usize) -> (InputWriter, InputQueue) {
    let (tx, rx) = mpsc::channel(depth);
    (InputWriter { tx }, InputQueue { rx })
}

pub fn output_queue(depth: usize) -> (OutputQueue, OutputReader) {
    let (tx, rx) = mpsc::channel(depth);
    (
        OutputQueue {
            tx,
            flushed: false,
        },
        OutputReader { rx },
    )
}

/// Writes stdin bytes. Dropping it (or [`InputWriter::finish`]) ends input.
#[derive(Clone)]
pub struct InputWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl InputWriter {
    pub async fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<(), SshError> {
        self.tx
            .send(bytes.into())
            .await
            .map_err(|_| SshError::Disconnected)
    }

    pub fn try_write(&self, bytes: impl Into<Vec<u8>>) -> Result<(), SshError> {
        self.tx.try_send(bytes.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SshError::Channel("input queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => SshError::Disconnected,
        })
    }

    /// Signal end of input.
    pub fn finish(self) {}

    /// Send ETX and end input.
    pub async fn interrupt(self) -> Result<(), SshError> {
        self.write(vec![ETX]).await
    }
}

pub struct InputQueue {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl InputSource for InputQueue {
    /// Everything queued so far goes out as one write.
    fn pull(&mut self) -> Input {
        let mut pending: Vec<u8> = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(bytes) => pending.extend_from_slice(&bytes),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if pending.is_empty() {
                        return Input::Done;
                    }
                    break;
                }
            }
        }
        if pending.is_empty() {
            Input::Idle
        } else {
            Input::Data(pending)
        }
    }
}

/// Queue-backed sink. Consecutive idle ticks collapse into one empty chunk.
pub struct OutputQueue {
    tx: mpsc::Sender<Vec<u8>>,
    flushed: bool,
}

impl OutputSink for OutputQueue {
    fn has_capacity(&self) -> bool {
        self.tx.capacity() > 0 || self.tx.is_closed()
    }

    fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            if self.flushed {
                return;
            }
            self.flushed = true;
        } else {
            self.flushed = false;
        }
        // Reader gone or full: the bytes have nowhere to go
        let _ = self.tx.try_send(chunk.to_vec());
    }
}

pub struct OutputReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl OutputReader {
    /// Next chunk including idle markers; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Next non-empty chunk.
    pub async fn recv_data(&mut self) -> Option<Vec<u8>> {
        loop {
            let chunk = self.rx.recv().await?;
            if !chunk.is_empty() {
                return Some(chunk);
            }
        }
    }

    /// All data available right now, without waiting.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_input_queue_coalesces_and_finishes() {
        let (writer, mut queue) = input_queue(8);
        assert_eq!(queue.pull(), Input::Idle);

        writer.write(b"ab".to_vec()).await.unwrap();
        writer.write(b"cd".to_vec()).await.unwrap();
        assert_eq!(queue.pull(), Input::Data(b"abcd".to_vec()));

        writer.write(b"e".to_vec()).await.unwrap();
        writer.finish();
        assert_eq!(queue.pull(), Input::Data(b"e".to_vec()));
        assert_eq!(queue.pull(), Input::Done);
        assert_eq!(queue.pull(), Input::Done);
    }

    #[tokio::test]
    async fn test_interrupt_sends_etx_then_done() {
        let (writer, mut queue) = input_queue(8);
        writer.interrupt().await.unwrap();
        assert_eq!(queue.pull(), Input::Data(vec![ETX]));
        assert_eq!(queue.pull(), Input::Done);
    }

    #[test]
    fn test_try_write_full_queue() {
        let (writer, _queue) = input_queue(1);
        writer.try_write(b"a".to_vec()).unwrap();
        assert!(matches!(
            writer.try_write(b"b".to_vec()),
            Err(SshError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn test_output_queue_collapses_idle_markers() {
        let (mut sink, mut reader) = output_queue(8);
        sink.push(&[]);
        sink.push(&[]);
        sink.push(b"hi");
        sink.push(&[]);
        sink.push(&[]);
        drop(sink);

        assert_eq!(reader.recv().await, Some(vec![]));
        assert_eq!(reader.recv().await, Some(b"hi".to_vec()));
        assert_eq!(reader.recv().await, Some(vec![]));
        assert_eq!(reader.recv().await, None);
    }

    #[test]
    fn test_output_queue_capacity() {
        let (mut sink, mut reader) = output_queue(1);
        assert!(sink.has_capacity());
        sink.push(b"x");
        assert!(!sink.has_capacity());
        assert_eq!(reader.drain(), b"x".to_vec());
        assert!(sink.has_capacity());
    }

    #[test]
    fn test_closures_as_endpoints() {
        let mut seen = Vec::new();
        {
            let mut sink = |chunk: &[u8]| seen.extend_from_slice(chunk);
            OutputSink::push(&mut sink, b"ok");
        }
        assert_eq!(seen, b"ok");

        let mut once = Some(b"ls\n".to_vec());
        let mut source = move || once.take().map(Input::Data).unwrap_or(Input::Done);
        assert_eq!(source.pull(), Input::Data(b"ls\n".to_vec()));
        assert_eq!(source.pull(), Input::Done);
    }
}
