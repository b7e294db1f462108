use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Missing or unparseable connection parameters. Fatal at startup.
    #[error("invalid broker configuration: {0}")]
    Config(String),

    /// Broker unreachable or handshake refused. Fatal at startup.
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),

    /// Redeclaration with parameters that conflict with the existing entity.
    #[error("conflicting declaration of {entity} '{name}': {source}")]
    Topology {
        entity: &'static str,
        name: String,
        #[source]
        source: lapin::Error,
    },

    #[error("broker channel error: {0}")]
    Channel(#[from] lapin::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publisher is closed")]
    Closed,

    #[error("failed to close broker resources: {}", .0.join("; "))]
    Close(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_error_reports_every_failure() {
        let err = BrokerError::Close(vec![
            "channel: already closed".to_string(),
            "connection: reset by peer".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "failed to close broker resources: channel: already closed; connection: reset by peer"
        );
    }
}
