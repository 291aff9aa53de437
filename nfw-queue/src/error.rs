use std::io;

use nfw_common::ErrorReporter;
use nfw_transport::ProtocolFamily;
use thiserror::Error;

/// Errors of the queue lifecycle manager and its worker.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("firewall is already running")]
    AlreadyRunning,
    #[error("can't open queue session: {0}")]
    Open(#[source] io::Error),
    #[error("can't bind protocol family {family}: {source}")]
    BindFamily { family: ProtocolFamily, source: io::Error },
    #[error("can't create queue {queue}: {source}")]
    CreateQueue { queue: u16, source: io::Error },
    #[error("can't set copy mode of queue {queue}: {source}")]
    SetMode { queue: u16, source: io::Error },
    #[error("can't set flags of queue {queue}: {source}")]
    SetFlags { queue: u16, source: io::Error },
    #[error("can't set maximum length of queue {queue}: {source}")]
    SetMaxLen { queue: u16, source: io::Error },
    #[error("can't spawn queue worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("verdict for packet {id} on queue {queue} failed: {source}")]
    Verdict { queue: u16, id: u32, source: io::Error },
    #[error("handler of queue {queue} panicked, packet {id} accepted")]
    Handler { queue: u16, id: u32 },
    #[error("kernel reported an error for request {seq}: {source}")]
    Kernel { seq: u32, source: io::Error },
    #[error("waiting for packets failed: {0}")]
    Poll(#[source] io::Error),
    #[error("receiving packets failed: {0}")]
    Recv(#[source] io::Error),
    #[error("can't destroy queue {queue}: {source}")]
    DestroyQueue { queue: u16, source: io::Error },
    #[error("can't close queue session: {0}")]
    Close(#[source] io::Error),
    #[error("queue worker panicked")]
    WorkerPanicked,
}

impl QueueError {
    /// The name of the failed operation, as forwarded to the [`ErrorReporter`].
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "start",
            Self::Open(_) => "open",
            Self::BindFamily { .. } => "bind_family",
            Self::CreateQueue { .. } => "create_queue",
            Self::SetMode { .. } => "set_mode",
            Self::SetFlags { .. } => "set_flags",
            Self::SetMaxLen { .. } => "set_max_len",
            Self::Spawn(_) => "spawn",
            Self::Verdict { .. } => "verdict",
            Self::Handler { .. } => "handler",
            Self::Kernel { .. } => "kernel",
            Self::Poll(_) => "poll",
            Self::Recv(_) => "recv",
            Self::DestroyQueue { .. } => "destroy_queue",
            Self::Close(_) => "close",
            Self::WorkerPanicked => "stop",
        }
    }

    /// The platform error code, 0 if the error didn't come from the OS.
    pub fn code(&self) -> i32 {
        self.io().and_then(io::Error::raw_os_error).unwrap_or(0)
    }

    fn io(&self) -> Option<&io::Error> {
        match self {
            Self::Open(source) |
            Self::Spawn(source) |
            Self::Poll(source) |
            Self::Recv(source) |
            Self::Close(source) |
            Self::BindFamily { source, .. } |
            Self::CreateQueue { source, .. } |
            Self::SetMode { source, .. } |
            Self::SetFlags { source, .. } |
            Self::SetMaxLen { source, .. } |
            Self::Verdict { source, .. } |
            Self::Kernel { source, .. } |
            Self::DestroyQueue { source, .. } => Some(source),
            Self::AlreadyRunning | Self::Handler { .. } | Self::WorkerPanicked => None,
        }
    }

    /// Forwards the error to `reporter`.
    pub fn report_to(&self, reporter: &dyn ErrorReporter) {
        reporter.report(self.operation(), &self.to_string(), self.code());
    }
}
