//! Typed error hierarchy shared by every component boundary.
//!
//! One enum per component (mirroring `SingleFederationError` /
//! `FederationError` in the upstream federation crate this service borrows
//! its shape from), bridged into a single top-level [`ServiceError`] via
//! `#[from]` so that the HTTP/WS handlers have exactly one place to turn an
//! internal failure into a client-facing status code.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("missing required config field `{0}`")]
    MissingField(&'static str),
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[derive(Debug, Error, Clone)]
pub enum KvError {
    #[error("{scope}ID is required for {scope} scope")]
    MissingScopeId { scope: &'static str },
    #[error("store hash exceeds the 100-entry cap")]
    HashFull,
    #[error("store value exceeds 10,000 characters")]
    ValueTooLarge,
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error, Clone)]
pub enum FetchError {
    #[error("Too many requests.")]
    ConcurrencyCapped,
    #[error("Request timed out.")]
    TimedOut,
    #[error("Access to {0} is disallowed")]
    Ssrf(String),
    #[error("Request failed - {name}: {detail}")]
    Failed { name: String, detail: String },
}

#[derive(Debug, Error, Clone)]
pub enum ReverseCallError {
    #[error("Command timed out")]
    TimedOut,
    #[error("no socket client connected")]
    NoClient,
    #[error("argument {0} is not a string")]
    NonStringArgument(usize),
}

#[derive(Debug, Error, Clone)]
pub enum SandboxError {
    #[error("🚫 {name}: {message}")]
    GuestFault { name: String, message: String },
    #[error("🚫 TimeoutError: evaluation exceeded {0}ms")]
    Timeout(u64),
    #[error("isolate allocation failed: {0}")]
    Fatal(String),
}

impl SandboxError {
    /// The `"🚫 <Name>: <message>"` string returned to the caller as `data[0]`.
    /// Guest faults are not server errors — this is always a 200 at the HTTP boundary.
    pub fn as_guest_string(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Error, Clone)]
pub enum PoolError {
    #[error("The queue is full")]
    QueueFull,
    #[error("Worker execution timed out")]
    ExecutionTimeout,
    #[error("Worker is not responding")]
    Unresponsive,
    #[error("worker failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    #[error("code must be a non-empty string")]
    InvalidCode,
    #[error("msg must be a mapping if present")]
    InvalidMsg,
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Top-level error type. Every component error bridges in here so the HTTP
/// and WebSocket handlers have a single match site for status-code mapping.
#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    ReverseCall(#[from] ReverseCallError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// HTTP status code for the `/eval` handler's error branch. Guest
    /// faults never reach this — they are folded into a 200 response by the
    /// sandbox kernel per §7.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Pipeline(PipelineError::InvalidCode | PipelineError::InvalidMsg) => 400,
            _ => 500,
        }
    }
}
