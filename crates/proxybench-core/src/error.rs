use thiserror::Error;

/// Phase-fatal faults surfaced by the testing engine.
///
/// Per-node faults (a probe timeout, a blocked speed test, a failed geo
/// lookup) are never represented here — they fold directly into the
/// affected `NodeMetrics` and are only logged. Only conditions that abort
/// an entire phase reach this type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("router did not become ready within {timeout_s}s (ports {socks_port}/{api_port})")]
    StartTimeout {
        socks_port: u16,
        api_port: u16,
        timeout_s: u64,
    },

    #[error("failed to spawn router process: {0}")]
    RouterProcess(String),

    #[error("failed to write router config: {0}")]
    ConfigWrite(#[source] std::io::Error),

    #[error("failed to create temp directory: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("duplicate node name in batch: {0}")]
    DuplicateNodeName(String),

    #[error("router binary not found: {0}")]
    RouterBinaryNotFound(String),
}
