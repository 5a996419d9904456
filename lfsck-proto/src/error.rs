use std::fmt;

/// Domain errors raised by the checker and carried across the control
/// protocol and HTTP surface. Variant names follow the ten error kinds
/// named for the engine, plus two ambient additions (`Io`, `NotReady`)
/// surfaced only by the persistence layer. Keeping this as a closed,
/// serializable enum (rather than an opaque `anyhow::Error`) lets the HTTP
/// layer map every kind to a stable status code.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail")]
pub enum LfsckError {
    AlreadyExists(String),
    NotFound(String),
    NoSuchDevice(String),
    OutOfMemory,
    PermissionDenied(String),
    NotADirectory(String),
    NotSupported(String),
    InvalidArgument(String),
    AlreadyInState { expected: String, actual: String },
    /// A peer did not acknowledge a control-protocol event in time.
    PeerTimeout(String),
    /// The on-disk or wire bookmark record failed validation.
    CorruptBookmark(String),
    /// The lost+found builder could not complete both transactions.
    LpfBuildFailed(String),
    /// Generic I/O or storage-backend failure, with the backend's message.
    Io(String),
    /// The requested resource is still initializing and cannot serve yet.
    NotReady,
}

impl LfsckError {
    pub fn no_such_target(index: u16) -> LfsckError {
        LfsckError::NotFound(format!("no target registered at index {index}"))
    }

    pub fn no_such_component(name: impl Into<String>) -> LfsckError {
        LfsckError::NotSupported(format!("no component named '{}'", name.into()))
    }
}

impl fmt::Display for LfsckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LfsckError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            LfsckError::NotFound(what) => write!(f, "not found: {what}"),
            LfsckError::NoSuchDevice(dev) => write!(f, "no such device: {dev}"),
            LfsckError::OutOfMemory => write!(f, "out of memory"),
            LfsckError::PermissionDenied(what) => write!(f, "permission denied: {what}"),
            LfsckError::NotADirectory(what) => write!(f, "not a directory: {what}"),
            LfsckError::NotSupported(what) => write!(f, "not supported: {what}"),
            LfsckError::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            LfsckError::AlreadyInState { expected, actual } => {
                write!(f, "expected state '{expected}', found '{actual}'")
            }
            LfsckError::PeerTimeout(who) => write!(f, "peer '{who}' did not respond in time"),
            LfsckError::CorruptBookmark(why) => write!(f, "corrupt bookmark record: {why}"),
            LfsckError::LpfBuildFailed(why) => write!(f, "lost+found build failed: {why}"),
            LfsckError::Io(why) => write!(f, "storage backend error: {why}"),
            LfsckError::NotReady => write!(f, "resource is not ready yet"),
        }
    }
}

impl std::error::Error for LfsckError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_json() {
        let err = LfsckError::AlreadyInState {
            expected: "running".into(),
            actual: "stopped".into(),
        };
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: LfsckError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(err, decoded);
    }

    #[test]
    fn display_is_non_empty_for_every_variant() {
        let variants = vec![
            LfsckError::AlreadyExists("ost0".into()),
            LfsckError::NotFound("target 3".into()),
            LfsckError::NoSuchDevice("ost0".into()),
            LfsckError::OutOfMemory,
            LfsckError::PermissionDenied("write".into()),
            LfsckError::NotADirectory("fid".into()),
            LfsckError::NotSupported("layout".into()),
            LfsckError::InvalidArgument("windows".into()),
            LfsckError::AlreadyInState { expected: "a".into(), actual: "b".into() },
            LfsckError::PeerTimeout("mdt0".into()),
            LfsckError::CorruptBookmark("bad magic".into()),
            LfsckError::LpfBuildFailed("transaction 2 aborted".into()),
            LfsckError::Io("disk full".into()),
            LfsckError::NotReady,
        ];
        for v in variants {
            assert!(!v.to_string().is_empty());
        }
    }

    #[test]
    fn helper_constructors_build_expected_variants() {
        assert!(matches!(LfsckError::no_such_target(3), LfsckError::NotFound(_)));
        assert!(matches!(LfsckError::no_such_component("layout"), LfsckError::NotSupported(_)));
    }
}
