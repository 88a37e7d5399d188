//! Tunnel request validation

use crate::port::{PortAllocator, PortRange};
use portway_proto::{ProtocolError, TunnelRequest, TunnelType};
use std::sync::Arc;

/// Validates an inbound tunnel request, returning the accepted (possibly
/// rewritten) request or the rejection whose text becomes the
/// `ResponseErr` payload.
pub trait TunnelRequestInterceptor: Send + Sync {
    fn handle_tunnel_request(
        &self,
        request: &TunnelRequest,
    ) -> Result<TunnelRequest, ProtocolError>;
}

/// Pass-through interceptor.
#[derive(Debug, Default)]
pub struct AllowAllInterceptor;

impl TunnelRequestInterceptor for AllowAllInterceptor {
    fn handle_tunnel_request(
        &self,
        request: &TunnelRequest,
    ) -> Result<TunnelRequest, ProtocolError> {
        Ok(request.clone())
    }
}

/// Default policy: optional exact-match auth token, then TCP port policy.
///
/// A requested port of 0 is rewritten with a freshly allocated one; an
/// explicit port must fall inside the allow-list when one is configured.
/// Non-TCP requests pass through unchanged (host routing is an external
/// layer's concern).
pub struct DefaultInterceptor {
    auth_token: Option<String>,
    allow_ports: Option<PortRange>,
    allocator: Arc<PortAllocator>,
}

impl DefaultInterceptor {
    pub fn new(
        auth_token: Option<String>,
        allow_ports: Option<PortRange>,
        allocator: Arc<PortAllocator>,
    ) -> Self {
        Self {
            auth_token,
            allow_ports,
            allocator,
        }
    }
}

impl TunnelRequestInterceptor for DefaultInterceptor {
    fn handle_tunnel_request(
        &self,
        request: &TunnelRequest,
    ) -> Result<TunnelRequest, ProtocolError> {
        if let Some(expected) = &self.auth_token {
            if request.auth_token.as_deref() != Some(expected.as_str()) {
                return Err(ProtocolError::BadAuthToken);
            }
        }
        match request.tunnel_type {
            TunnelType::Tcp if request.remote_port == 0 => {
                let port = self.allocator.allocate()?;
                Ok(request.clone().with_remote_port(port))
            }
            TunnelType::Tcp => {
                if let Some(allow) = &self.allow_ports {
                    if !allow.contains(request.remote_port) {
                        return Err(ProtocolError::PortNotAllowed(request.remote_port));
                    }
                }
                Ok(request.clone())
            }
            _ => Ok(request.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interceptor(auth_token: Option<&str>, allow_ports: Option<&str>) -> DefaultInterceptor {
        let allow = allow_ports.map(|expr| PortRange::parse(expr).unwrap());
        let allocator = Arc::new(PortAllocator::new(
            allow.clone().unwrap_or_default(),
        ));
        DefaultInterceptor::new(auth_token.map(String::from), allow, allocator)
    }

    #[test]
    fn test_auth_token_match_accepted() {
        let interceptor = interceptor(Some("secret"), None);
        let request = TunnelRequest::tcp("127.0.0.1", 8080, 5000).with_auth_token("secret");
        assert!(interceptor.handle_tunnel_request(&request).is_ok());
    }

    #[test]
    fn test_auth_token_mismatch_rejected() {
        let interceptor = interceptor(Some("secret"), None);
        let wrong = TunnelRequest::tcp("127.0.0.1", 8080, 5000).with_auth_token("wrong");
        assert!(matches!(
            interceptor.handle_tunnel_request(&wrong),
            Err(ProtocolError::BadAuthToken)
        ));

        let absent = TunnelRequest::tcp("127.0.0.1", 8080, 5000);
        assert!(matches!(
            interceptor.handle_tunnel_request(&absent),
            Err(ProtocolError::BadAuthToken)
        ));
    }

    #[test]
    fn test_no_token_configured_means_no_enforcement() {
        let interceptor = interceptor(None, None);
        let request = TunnelRequest::tcp("127.0.0.1", 8080, 5000);
        assert!(interceptor.handle_tunnel_request(&request).is_ok());
    }

    #[test]
    fn test_explicit_port_outside_allow_list_rejected() {
        let interceptor = interceptor(None, Some("1024-65535"));
        let request = TunnelRequest::tcp("127.0.0.1", 8080, 22);
        assert!(matches!(
            interceptor.handle_tunnel_request(&request),
            Err(ProtocolError::PortNotAllowed(22))
        ));
    }

    #[test]
    fn test_explicit_port_inside_allow_list_unchanged() {
        let interceptor = interceptor(None, Some("1024-65535"));
        let request = TunnelRequest::tcp("127.0.0.1", 8080, 5000);
        let accepted = interceptor.handle_tunnel_request(&request).unwrap();
        assert_eq!(accepted, request);
    }

    #[test]
    fn test_auto_port_rewritten() {
        let interceptor = interceptor(None, Some("45250-45260"));
        let request = TunnelRequest::tcp("127.0.0.1", 8080, 0);
        let accepted = interceptor.handle_tunnel_request(&request).unwrap();
        assert!((45250..=45260).contains(&accepted.remote_port));
        // nothing but the port was touched
        assert_eq!(accepted.with_remote_port(0), request);
    }

    #[test]
    fn test_http_request_passes_through() {
        let interceptor = interceptor(None, Some("4000-4010"));
        let request = TunnelRequest::http("127.0.0.1", 3000, "app.example.com");
        let accepted = interceptor.handle_tunnel_request(&request).unwrap();
        assert_eq!(accepted, request);
    }
}
