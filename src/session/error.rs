use crate::session::breakpoint::BreakpointId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- scheduler errors ------------------------------------------
    #[error("scheduler already closed")]
    SchedulerClosed,
    #[error("operation canceled")]
    OperationCanceled,

    // --------------------------------- protocol errors -------------------------------------------
    #[error("debugger command failed: {0}")]
    Command(String),
    #[error("breakpoint bind failed: {0}")]
    Bind(String),

    // --------------------------------- session entity not found ----------------------------------
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(BreakpointId),

    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("config parsing error: {0}")]
    ConfigParsing(#[from] toml::de::Error),

    // --------------------------------- third party errors ----------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),
}

impl Error {
    /// Return a hint to an embedder - continue the session after error or tear it down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::OperationCanceled => false,
            Error::Command(_) => false,
            Error::Bind(_) => false,
            Error::BreakpointNotFound(_) => false,
            Error::IO(_) => false,
            Error::ConfigParsing(_) => false,
            Error::Hook(_) => false,

            // the session thread is gone, nothing left to drive
            Error::SchedulerClosed => true,
        }
    }
}
