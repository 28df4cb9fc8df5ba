//! Forwarding Error types

use thiserror::Error;

/// Failure to bring up a forwarding process.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Forwarder executable not found: {program}")]
    ExecutableNotFound { program: String },

    #[error("Port already in use: {port}. Another application may be listening on it.")]
    PortInUse { port: u16 },

    #[error("Permission denied binding port {port}. Ports below 1024 require elevated privileges.")]
    PermissionDenied { port: u16 },

    #[error("Forwarder exited during startup (exit code {code:?}): {stderr}")]
    ExitedEarly { code: Option<i32>, stderr: String },

    #[error("OS refused to start forwarder: {0}")]
    Os(#[from] std::io::Error),
}

/// Failure to tear down a forwarding process.
#[derive(Error, Debug)]
pub enum StopError {
    #[error("Process {pid} not found")]
    ProcessNotFound { pid: u32 },

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
}

/// Errors surfaced by the forwarding manager to the control API.
#[derive(Error, Debug)]
pub enum MappingError {
    #[error("Invalid mapping: {0}")]
    InvalidTarget(String),

    #[error("Port {0} already has a running mapping")]
    DuplicatePort(u16),

    #[error("Mapping not found: {0}")]
    NotFound(u16),

    #[error("Failed to create mapping: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Failed to stop mapping: {0}")]
    Stop(#[from] StopError),
}

impl MappingError {
    /// HTTP status the control API answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            MappingError::NotFound(_) => 404,
            MappingError::InvalidTarget(_)
            | MappingError::DuplicatePort(_)
            | MappingError::Spawn(_)
            | MappingError::Stop(_) => 400,
        }
    }
}

impl serde::Serialize for MappingError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(MappingError::NotFound(9000).status_code(), 404);
        assert_eq!(MappingError::DuplicatePort(9000).status_code(), 400);
        assert_eq!(
            MappingError::Spawn(SpawnError::PortInUse { port: 80 }).status_code(),
            400
        );
        assert_eq!(
            MappingError::Stop(StopError::ProcessNotFound { pid: 1 }).status_code(),
            400
        );
    }

    #[test]
    fn test_serializes_as_reason() {
        let json = serde_json::to_string(&MappingError::NotFound(9000)).unwrap();
        assert_eq!(json, "\"Mapping not found: 9000\"");
    }
}
