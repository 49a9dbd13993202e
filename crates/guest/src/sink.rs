//! Destination for user-visible log lines.

use std::sync::{Arc, Mutex};

/// Where `ctx.log(..)` lines go. The container guest writes to stdout,
/// which the sandbox captures from the container's log stream; the thread
/// guest appends to a buffer shared with its sandbox, optionally mirroring
/// into the supervisor's own log output.
#[derive(Clone, Default)]
pub struct LogSink {
    buffer: Option<Arc<Mutex<Vec<String>>>>,
    echo: bool,
}

impl LogSink {
    /// Plain stdout sink for containerized guests.
    pub fn stdout() -> Self {
        Self {
            buffer: None,
            echo: false,
        }
    }

    /// In-process buffer sink; `echo` mirrors lines into tracing output.
    pub fn buffered(echo: bool) -> (Self, Arc<Mutex<Vec<String>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (Self::into_buffer(buffer.clone(), echo), buffer)
    }

    /// Buffer sink writing into an existing shared buffer.
    pub fn into_buffer(buffer: Arc<Mutex<Vec<String>>>, echo: bool) -> Self {
        Self {
            buffer: Some(buffer),
            echo,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        match &self.buffer {
            Some(buffer) => {
                if self.echo {
                    tracing::info!(target: "guest", "{}", line);
                }
                buffer.lock().unwrap().push(line);
            }
            None => println!("{line}"),
        }
    }
}
