use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    NoRouteMatch,
    UnknownService(String),
    NoHealthyInstance(String),
    CircuitOpen(String),
    UpstreamTimeout,
    UpstreamConnect(String),
    UpstreamStatus(u16),
    Config(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::UnknownService(name) => write!(f, "unknown service: {}", name),
            GatewayError::NoHealthyInstance(name) => {
                write!(f, "no healthy instance for service: {}", name)
            }
            GatewayError::CircuitOpen(key) => write!(f, "circuit breaker open: {}", key),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::UpstreamStatus(status) => write!(f, "upstream returned status {}", status),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_route_match() {
        assert_eq!(GatewayError::NoRouteMatch.to_string(), "no route matched");
    }

    #[test]
    fn display_no_healthy_instance() {
        assert_eq!(
            GatewayError::NoHealthyInstance("tags".to_string()).to_string(),
            "no healthy instance for service: tags"
        );
    }

    #[test]
    fn display_circuit_open() {
        assert_eq!(
            GatewayError::CircuitOpen("tags-t1".to_string()).to_string(),
            "circuit breaker open: tags-t1"
        );
    }

    #[test]
    fn display_upstream_timeout() {
        assert_eq!(
            GatewayError::UpstreamTimeout.to_string(),
            "upstream timeout"
        );
    }

    #[test]
    fn display_upstream_connect() {
        assert_eq!(
            GatewayError::UpstreamConnect("conn refused".to_string()).to_string(),
            "upstream connect error: conn refused"
        );
    }

    #[test]
    fn display_upstream_status() {
        assert_eq!(
            GatewayError::UpstreamStatus(500).to_string(),
            "upstream returned status 500"
        );
    }

    #[test]
    fn display_config() {
        assert_eq!(
            GatewayError::Config("bad toml".to_string()).to_string(),
            "config error: bad toml"
        );
    }

    #[test]
    fn display_internal() {
        assert_eq!(
            GatewayError::Internal("oops".to_string()).to_string(),
            "internal error: oops"
        );
    }
}
