use http::StatusCode;
use reconcilor_client::TransportError;
use reconcilor_protocol::GaiaError;

/// Classifies a transport failure so the cookie manager can decide between
/// retrying and giving up.
pub fn map_transport_error(err: TransportError) -> GaiaError {
    match err {
        TransportError::Timeout => GaiaError::ConnectionFailed("request timed out".to_string()),
        TransportError::Network(msg) => GaiaError::ConnectionFailed(msg),
        TransportError::Build(msg) => GaiaError::ServiceError(format!("invalid request: {msg}")),
        TransportError::Http { status, body, .. } => {
            let detail = match body {
                Some(body) if !body.trim().is_empty() => format!("{status}: {}", body.trim()),
                _ => status.to_string(),
            };
            if status.is_server_error() {
                GaiaError::ServiceUnavailable(detail)
            } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                GaiaError::InvalidCredentials(detail)
            } else {
                GaiaError::ServiceError(detail)
            }
        }
    }
}
