use std::sync::Arc;

use crate::codec::CompressKind;

/// Tuning knobs for one client channel.
#[derive(Clone)]
pub struct ChannelOptions {
    /// Kernel recv buffer size (bytes) applied to the socket.
    pub rbuf_size: usize,
    /// Kernel send buffer size (bytes) applied to the socket.
    pub sbuf_size: usize,
    /// Low watermark of the user-mode recv buffer (initial capacity).
    pub min_rbuf_size: usize,
    /// High watermark of the user-mode recv buffer. Capacity above this is
    /// given back once the buffer drains.
    pub max_rbuf_size: usize,
    /// Low watermark of the user-mode send buffer (initial capacity).
    pub min_sbuf_size: usize,
    /// High watermark of the user-mode send buffer.
    pub max_sbuf_size: usize,
    /// Connect timeout in milliseconds. A connect attempt still pending
    /// after this long is torn down and retried.
    pub connect_timeout: u64,
    /// Interval in milliseconds before retrying a failed connect.
    pub retry_interval: u64,
    /// Heartbeat probe interval in milliseconds. Zero disables heartbeat.
    pub heartbeat_interval: u64,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            rbuf_size: 16 * 1024,
            sbuf_size: 16 * 1024,
            min_rbuf_size: 32 * 1024,
            max_rbuf_size: 1024 * 1024,
            min_sbuf_size: 32 * 1024,
            max_sbuf_size: 1024 * 1024,
            connect_timeout: 5000,
            retry_interval: 1000,
            heartbeat_interval: 600000,
        }
    }
}

/// Per-worker context handed to the server init/exit hooks.
pub struct WorkerInfo {
    pub name: String,
    pub index: usize,
}

pub type WorkerHook = Arc<dyn Fn(&WorkerInfo) + Send + Sync>;

/// Tuning knobs for a server.
#[derive(Clone)]
pub struct ServerOptions {
    pub rbuf_size: usize,
    pub sbuf_size: usize,
    pub min_rbuf_size: usize,
    pub max_rbuf_size: usize,
    pub min_sbuf_size: usize,
    pub max_sbuf_size: usize,
    /// Seconds an accepted connection may stay idle (no request received,
    /// no response written) before it is closed.
    pub keep_alive_time: u64,
    /// Number of worker threads accepting dispatched connections.
    pub num_worker_threads: usize,
    /// Runs on each worker thread right after it starts.
    pub init_hook: Option<WorkerHook>,
    /// Runs on each worker thread right before it exits.
    pub exit_hook: Option<WorkerHook>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            rbuf_size: 16 * 1024,
            sbuf_size: 16 * 1024,
            min_rbuf_size: 32 * 1024,
            max_rbuf_size: 1024 * 1024,
            min_sbuf_size: 32 * 1024,
            max_sbuf_size: 1024 * 1024,
            keep_alive_time: 3600,
            num_worker_threads: 8,
            init_hook: None,
            exit_hook: None,
        }
    }
}

/// Per-call knobs, passed to [crate::client::Channel::call_method].
#[derive(Clone, Copy)]
pub struct CallOptions {
    /// Time in milliseconds the call may wait for its response.
    pub rpc_timeout: u64,
    /// Compression applied to the request frame.
    pub compression: CompressKind,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self { rpc_timeout: 1000, compression: CompressKind::None }
    }
}
