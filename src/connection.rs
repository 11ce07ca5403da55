//! Connection descriptor resolution.
//!
//! The resolver is a read-only lookup from target identifier to SSH
//! parameters. Workers call it concurrently, so implementations must not rely
//! on external synchronisation.

use std::collections::HashMap;

use thiserror::Error;

use crate::target::{ConnectionRef, Target};

/// Default SSH port used when neither the reference nor configuration sets
/// one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Parameters needed to open an SSH session to one target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionDescriptor {
    /// Remote user to authenticate as.
    pub user: String,
    /// Hostname or IP address.
    pub host: String,
    /// TCP port exposed by the SSH daemon.
    pub port: u16,
    /// Private key file passed to the client with `-i`.
    pub identity_file: Option<String>,
}

impl ConnectionDescriptor {
    /// Returns `user@host` as accepted by `ssh`.
    #[must_use]
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Returns `user@host:path` as accepted by `scp`, bracketing IPv6
    /// literals.
    #[must_use]
    pub fn remote_path(&self, path: &str) -> String {
        if self.host.contains(':') {
            format!("{}@[{}]:{path}", self.user, self.host)
        } else {
            format!("{}@{}:{path}", self.user, self.host)
        }
    }
}

/// Errors raised while resolving a target's connection descriptor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResolutionError {
    /// Raised when no descriptor exists for the target.
    #[error("no connection details for {target}")]
    Missing {
        /// Identifier of the target.
        target: String,
    },
    /// Raised when the descriptor exists but the host cannot be addressed.
    #[error("{target} is unreachable: {reason}")]
    Unreachable {
        /// Identifier of the target.
        target: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Raised when credentials for the target are rejected or unusable.
    #[error("authentication rejected for {target}: {reason}")]
    AuthenticationRejected {
        /// Identifier of the target.
        target: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Maps a target identifier to connection parameters.
pub trait ConnectionResolver: Send + Sync {
    /// Resolves the descriptor for `target_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError`] when the target cannot be reached or has
    /// no usable connection details.
    fn resolve(&self, target_id: &str) -> Result<ConnectionDescriptor, ResolutionError>;
}

/// Fallback values applied when a connection reference omits them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshDefaults {
    /// User applied when the reference has no `user@` prefix.
    pub user: String,
    /// Port applied when the reference has no `:port` suffix.
    pub port: u16,
    /// Identity file forwarded to every descriptor.
    pub identity_file: Option<String>,
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self {
            user: String::from("root"),
            port: DEFAULT_SSH_PORT,
            identity_file: None,
        }
    }
}

/// Resolver backed by the connection references of an inventory snapshot.
#[derive(Clone, Debug)]
pub struct InventoryResolver {
    references: HashMap<String, Option<ConnectionRef>>,
    defaults: SshDefaults,
}

impl InventoryResolver {
    /// Indexes the connection references of `targets`.
    #[must_use]
    pub fn new(targets: &[Target], defaults: SshDefaults) -> Self {
        let references = targets
            .iter()
            .map(|target| (target.id.clone(), target.connection_ref.clone()))
            .collect();
        Self {
            references,
            defaults,
        }
    }
}

impl ConnectionResolver for InventoryResolver {
    fn resolve(&self, target_id: &str) -> Result<ConnectionDescriptor, ResolutionError> {
        let Some(Some(reference)) = self.references.get(target_id) else {
            return Err(ResolutionError::Missing {
                target: target_id.to_owned(),
            });
        };
        parse_reference(reference.as_str(), &self.defaults).map_err(|reason| {
            ResolutionError::Unreachable {
                target: target_id.to_owned(),
                reason,
            }
        })
    }
}

/// Parses `[user@]host[:port]` into a descriptor, filling gaps from
/// `defaults`.
///
/// # Errors
///
/// Returns a human-readable reason when the host is empty, the port is not a
/// valid `u16`, or an IPv6 bracket is unbalanced.
pub fn parse_reference(
    reference: &str,
    defaults: &SshDefaults,
) -> Result<ConnectionDescriptor, String> {
    let trimmed = reference.trim();
    let (user, address) = match trimmed.rsplit_once('@') {
        Some((user, address)) if !user.is_empty() => (user.to_owned(), address),
        Some(_) => return Err(format!("empty user in '{trimmed}'")),
        None => (defaults.user.clone(), trimmed),
    };

    let (host, port) = split_host_port(address)?;
    if host.is_empty() {
        return Err(format!("empty host in '{trimmed}'"));
    }

    Ok(ConnectionDescriptor {
        user,
        host: host.to_owned(),
        port: port.unwrap_or(defaults.port),
        identity_file: defaults.identity_file.clone(),
    })
}

fn split_host_port(address: &str) -> Result<(&str, Option<u16>), String> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unbalanced bracket in '{address}'"))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(port)?))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(format!("unexpected '{tail}' after host in '{address}'")),
        };
    }

    // More than one colon without brackets is a bare IPv6 literal.
    if address.matches(':').count() > 1 {
        return Ok((address, None));
    }

    match address.split_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((address, None)),
    }
}

fn parse_port(port: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .map_err(|err| format!("invalid port '{port}': {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn defaults() -> SshDefaults {
        SshDefaults {
            user: String::from("ubuntu"),
            port: 2222,
            identity_file: Some(String::from("~/.ssh/id_ed25519")),
        }
    }

    #[rstest]
    #[case("10.0.0.1", "ubuntu", "10.0.0.1", 2222)]
    #[case("admin@10.0.0.1", "admin", "10.0.0.1", 2222)]
    #[case("admin@web.example.com:22", "admin", "web.example.com", 22)]
    #[case("[2001:db8::1]:2200", "ubuntu", "2001:db8::1", 2200)]
    #[case("2001:db8::1", "ubuntu", "2001:db8::1", 2222)]
    fn parse_reference_fills_defaults(
        defaults: SshDefaults,
        #[case] reference: &str,
        #[case] user: &str,
        #[case] host: &str,
        #[case] port: u16,
    ) {
        let descriptor = parse_reference(reference, &defaults).expect("reference should parse");
        assert_eq!(descriptor.user, user);
        assert_eq!(descriptor.host, host);
        assert_eq!(descriptor.port, port);
        assert_eq!(descriptor.identity_file.as_deref(), Some("~/.ssh/id_ed25519"));
    }

    #[rstest]
    #[case("10.0.0.1:notaport")]
    #[case("@10.0.0.1")]
    #[case("[2001:db8::1")]
    #[case("ubuntu@:22")]
    fn parse_reference_rejects_malformed_input(defaults: SshDefaults, #[case] reference: &str) {
        assert!(parse_reference(reference, &defaults).is_err());
    }

    #[rstest]
    fn resolver_reports_missing_reference(defaults: SshDefaults) {
        let targets = vec![Target::new("srv-a", "host-a")];
        let resolver = InventoryResolver::new(&targets, defaults);

        assert_eq!(
            resolver.resolve("srv-a"),
            Err(ResolutionError::Missing {
                target: String::from("srv-a")
            })
        );
        assert!(matches!(
            resolver.resolve("srv-unknown"),
            Err(ResolutionError::Missing { .. })
        ));
    }

    #[rstest]
    fn resolver_maps_malformed_reference_to_unreachable(defaults: SshDefaults) {
        let targets = vec![Target::new("srv-a", "host-a").with_connection("host:99999")];
        let resolver = InventoryResolver::new(&targets, defaults);

        let err = resolver.resolve("srv-a").expect_err("port out of range");
        assert!(matches!(err, ResolutionError::Unreachable { .. }), "{err}");
    }

    #[rstest]
    fn remote_path_brackets_ipv6_hosts() {
        let descriptor = ConnectionDescriptor {
            user: String::from("root"),
            host: String::from("2001:db8::1"),
            port: 22,
            identity_file: None,
        };
        assert_eq!(descriptor.login(), "root@2001:db8::1");
        assert_eq!(descriptor.remote_path("/tmp/x"), "root@[2001:db8::1]:/tmp/x");
    }
}
