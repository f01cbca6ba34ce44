/// Errors crossing the collaborator boundary.
///
/// Contact store, settings store, announce repository and network transport
/// all report failures through this type. The manager never lets one escape
/// a public entry point: they are logged and folded into
/// `SelectionOutcome` / `SyncResult` values.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("contact store error: {0}")]
    Contact(String),

    #[error("settings store error: {0}")]
    Settings(String),

    #[error("announce lookup failed: {0}")]
    Announce(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("settings database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("relay manager stopped")]
    Stopped,
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Settings(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_contact() {
        let err = RelayError::Contact("duplicate identity".into());
        assert_eq!(err.to_string(), "contact store error: duplicate identity");
    }

    #[test]
    fn test_display_transport() {
        let err = RelayError::Transport("link closed".into());
        assert_eq!(err.to_string(), "transport error: link closed");
    }

    #[test]
    fn test_display_invalid_node_id() {
        let err = RelayError::InvalidNodeId("xyz".into());
        assert_eq!(err.to_string(), "invalid node id: xyz");
    }

    #[test]
    fn test_json_error_maps_to_settings() {
        let json_err = serde_json::from_str::<u64>("not a number").unwrap_err();
        let err: RelayError = json_err.into();
        assert!(matches!(err, RelayError::Settings(_)));
    }
}
