//! Connect-time authentication hook.
//!
//! The broker only asks yes/no; policy lives behind the trait.

use std::net::SocketAddr;

/// Context for authentication (CONNECT packet).
#[derive(Debug)]
#[allow(dead_code)] // Fields are the hook's surface; AllowAll ignores them
pub struct AuthContext<'a> {
    /// Client ID from the CONNECT packet.
    pub client_id: &'a str,
    /// Username (optional).
    pub username: Option<&'a str>,
    /// Password (optional).
    pub password: Option<&'a [u8]>,
    /// Client's remote address.
    pub remote_addr: SocketAddr,
}

/// Yes/no gate consulted on every CONNECT.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, ctx: &AuthContext) -> bool;
}

/// Default authenticator: every connection is accepted.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _ctx: &AuthContext) -> bool {
        true
    }
}
