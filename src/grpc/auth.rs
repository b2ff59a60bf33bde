//! Role-based authorization keyed on client certificates.
//!
//! The TLS layer already verified the client's certificate against the
//! CA; this module only decides what the authenticated client may do.
//! Identity is the SHA-256 fingerprint of the leaf certificate in DER
//! form, looked up in a configured fingerprint → role map. The
//! [`AuthInterceptor`] resolves the role once per request and stores it
//! in the request extensions for the handlers to check.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::config::AuthConfig;

/// What an authenticated client is allowed to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Query and stream only.
    Reader,
    /// Everything, including start and stop.
    Writer,
}

impl Role {
    pub fn allows(self, required: Role) -> bool {
        match required {
            Role::Reader => true,
            Role::Writer => self == Role::Writer,
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reader" => Ok(Role::Reader),
            "writer" => Ok(Role::Writer),
            other => Err(format!("unknown role {other:?}, expected reader or writer")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
        }
    }
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Maps authenticated peers to roles.
#[derive(Debug, Default)]
pub struct Authorizer {
    roles: HashMap<String, Role>,
    default_role: Option<Role>,
}

impl Authorizer {
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut roles = HashMap::new();
        for fp in &config.reader_fingerprints {
            roles.insert(fp.to_ascii_lowercase(), Role::Reader);
        }
        // Writer entries win when a fingerprint appears in both lists.
        for fp in &config.writer_fingerprints {
            roles.insert(fp.to_ascii_lowercase(), Role::Writer);
        }
        Self {
            roles,
            default_role: config.default_role,
        }
    }

    /// Role for a client that presented this leaf certificate.
    pub fn role_for_cert(&self, der: &[u8]) -> Option<Role> {
        self.roles
            .get(&fingerprint(der))
            .copied()
            .or(self.default_role)
    }

    /// Role for a request, from its TLS connection info. Connections
    /// without a client certificate (TLS disabled) get the default role.
    pub fn role_for_request<T>(&self, request: &Request<T>) -> Option<Role> {
        match request.peer_certs().as_ref().and_then(|certs| {
            certs.first().map(|leaf| self.role_for_cert(leaf.as_ref()))
        }) {
            Some(role) => role,
            None => self.default_role,
        }
    }
}

/// Resolves the caller's role before any handler runs.
#[derive(Clone)]
pub struct AuthInterceptor {
    authorizer: Arc<Authorizer>,
}

impl AuthInterceptor {
    pub fn new(authorizer: Arc<Authorizer>) -> Self {
        Self { authorizer }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        match self.authorizer.role_for_request(&request) {
            Some(role) => {
                request.extensions_mut().insert(role);
                Ok(request)
            }
            None => Err(Status::unauthenticated(
                "client certificate is not authorized",
            )),
        }
    }
}

/// Handler-side role check against the role the interceptor resolved.
pub fn require_role<T>(request: &Request<T>, required: Role) -> Result<(), Status> {
    match request.extensions().get::<Role>() {
        Some(role) if role.allows(required) => Ok(()),
        Some(role) => Err(Status::permission_denied(format!(
            "role {role} may not perform this operation"
        ))),
        None => Err(Status::unauthenticated("no role established for request")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(writers: &[&str], readers: &[&str], default_role: Option<Role>) -> AuthConfig {
        AuthConfig {
            writer_fingerprints: writers.iter().map(|s| s.to_string()).collect(),
            reader_fingerprints: readers.iter().map(|s| s.to_string()).collect(),
            default_role,
        }
    }

    #[test]
    fn test_fingerprint_is_stable_lowercase_hex() {
        let fp = fingerprint(b"test certificate");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fp.to_ascii_lowercase());
        assert_eq!(fp, fingerprint(b"test certificate"));
    }

    #[test]
    fn test_role_allows() {
        assert!(Role::Writer.allows(Role::Writer));
        assert!(Role::Writer.allows(Role::Reader));
        assert!(Role::Reader.allows(Role::Reader));
        assert!(!Role::Reader.allows(Role::Writer));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("writer".parse::<Role>().unwrap(), Role::Writer);
        assert_eq!("Reader".parse::<Role>().unwrap(), Role::Reader);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn test_known_fingerprints_map_to_roles() {
        let writer_cert = b"writer cert der";
        let reader_cert = b"reader cert der";
        let auth = Authorizer::from_config(&config_with(
            &[&fingerprint(writer_cert)],
            &[&fingerprint(reader_cert)],
            None,
        ));

        assert_eq!(auth.role_for_cert(writer_cert), Some(Role::Writer));
        assert_eq!(auth.role_for_cert(reader_cert), Some(Role::Reader));
        assert_eq!(auth.role_for_cert(b"stranger"), None);
    }

    #[test]
    fn test_writer_wins_duplicate_fingerprint() {
        let cert = b"both lists";
        let fp = fingerprint(cert);
        let auth = Authorizer::from_config(&config_with(&[&fp], &[&fp], None));
        assert_eq!(auth.role_for_cert(cert), Some(Role::Writer));
    }

    #[test]
    fn test_unknown_cert_falls_back_to_default_role() {
        let auth = Authorizer::from_config(&config_with(&[], &[], Some(Role::Reader)));
        assert_eq!(auth.role_for_cert(b"whoever"), Some(Role::Reader));
    }

    #[test]
    fn test_fingerprints_match_case_insensitively() {
        let cert = b"cased cert";
        let fp = fingerprint(cert).to_ascii_uppercase();
        let auth = Authorizer::from_config(&config_with(&[&fp], &[], None));
        assert_eq!(auth.role_for_cert(cert), Some(Role::Writer));
    }

    #[test]
    fn test_require_role_enforces_extension() {
        let mut request = Request::new(());
        assert!(require_role(&request, Role::Reader).is_err());

        request.extensions_mut().insert(Role::Reader);
        assert!(require_role(&request, Role::Reader).is_ok());
        let denied = require_role(&request, Role::Writer).unwrap_err();
        assert_eq!(denied.code(), tonic::Code::PermissionDenied);

        request.extensions_mut().insert(Role::Writer);
        assert!(require_role(&request, Role::Writer).is_ok());
    }
}
