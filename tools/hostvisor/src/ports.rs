// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::TcpSocket;
use tracing::{debug, info, warn};

pub const MAX_PORT_ATTEMPTS: u32 = 100;
pub const MAX_PORT: u32 = 65535;
pub const FIRST_USER_PORT: u16 = 1024;

/// Ports that are technically user-space but blocked by browsers and other clients,
/// so a service placed on one of them would be unreachable.
pub const RESTRICTED_PORTS: &[u16] = &[
    1719, 1720, 1723, 2049, 3659, 4045, 4190, 5060, 5061, 6000, 6566, 6665, 6666, 6667, 6668, 6669,
    6679, 6697, 10080,
];

/// The four loopback ports the backend services are reachable at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEndpoints {
    /// Debug/introspection port. Served by the supervisor itself and never reassigned once started.
    pub cdp: u16,
    pub http_mcp: u16,
    pub agent: u16,
    pub extension: u16,
}

impl ServiceEndpoints {
    pub fn as_array(&self) -> [u16; 4] {
        [self.cdp, self.http_mcp, self.agent, self.extension]
    }

    pub fn is_disjoint(&self) -> bool {
        let ports = self.as_array();
        let unique: HashSet<_> = ports.iter().collect();
        unique.len() == ports.len()
    }
}

impl Display for ServiceEndpoints {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cdp: {}, http_mcp: {}, agent: {}, extension: {}",
            self.cdp, self.http_mcp, self.agent, self.extension
        )
    }
}

/// Ports pinned by the operator. A pinned port skips probing entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortOverrides {
    pub cdp: Option<u16>,
    pub http_mcp: Option<u16>,
    pub agent: Option<u16>,
    pub extension: Option<u16>,
}

/// Parses an operator supplied port. Anything that is not a number within `1..=65535`
/// is rejected with a warning so that the default is kept.
pub fn parse_port_override(name: &str, raw: &str) -> Option<u16> {
    let port = match raw.trim().parse::<u32>() {
        Ok(port) if port > 0 && port <= MAX_PORT => port as u16,
        Ok(port) => {
            warn!("ignoring the {name} port override: {port} is outside the valid port range");
            return None;
        }
        Err(_) => {
            warn!("ignoring the {name} port override: '{raw}' is not a valid port number");
            return None;
        }
    };
    if !is_port_allowed(port) {
        warn!("the {name} port override {port} is a well-known or restricted port. it might not be reachable");
    }
    Some(port)
}

/// Whether the port may ever be handed out by the arbiter.
pub fn is_port_allowed(port: u16) -> bool {
    port >= FIRST_USER_PORT && !RESTRICTED_PORTS.contains(&port)
}

/// Checks whether a port can currently be bound.
pub trait PortProbe: Send + Sync {
    fn is_available(&self, port: u16) -> bool;
}

/// Probes the port by binding it on both loopback addresses, without `SO_REUSEADDR`,
/// so a port still held by another listener is never reported as free.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortProbe;

impl SystemPortProbe {
    fn bind_v4(port: u16) -> io::Result<()> {
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    fn bind_v6(port: u16) -> io::Result<()> {
        let socket = TcpSocket::new_v6()?;
        socket.bind(SocketAddr::from((Ipv6Addr::LOCALHOST, port)))
    }

    // hosts without ipv6 loopback can't have a conflicting listener there either
    fn ipv6_unsupported(err: &io::Error) -> bool {
        matches!(
            err.raw_os_error(),
            Some(code) if code == Errno::EAFNOSUPPORT as i32 || code == Errno::EADDRNOTAVAIL as i32
        )
    }
}

impl PortProbe for SystemPortProbe {
    fn is_available(&self, port: u16) -> bool {
        if let Err(err) = Self::bind_v4(port) {
            debug!("port {port} is not available on 127.0.0.1: {err}");
            return false;
        }
        match Self::bind_v6(port) {
            Ok(()) => true,
            Err(err) if Self::ipv6_unsupported(&err) => true,
            Err(err) => {
                debug!("port {port} is not available on ::1: {err}");
                false
            }
        }
    }
}

pub struct PortArbiter<'a> {
    probe: &'a dyn PortProbe,
}

impl<'a> PortArbiter<'a> {
    pub fn new(probe: &'a dyn PortProbe) -> Self {
        PortArbiter { probe }
    }

    /// Linearly probes `preferred, preferred + 1, ...` for a bindable port that is not `excluded`.
    /// If nothing is found within the attempt budget, the preferred port is returned instead
    /// (or the first non-excluded port after it, if the preferred one is already taken by a sibling).
    pub fn find_available_port(&self, preferred: u16, excluded: &HashSet<u16>) -> u16 {
        for attempt in 0..MAX_PORT_ATTEMPTS {
            let candidate = preferred as u32 + attempt;
            if candidate > MAX_PORT {
                break;
            }
            let candidate = candidate as u16;
            if excluded.contains(&candidate) || !is_port_allowed(candidate) {
                continue;
            }
            if self.probe.is_available(candidate) {
                if candidate != preferred {
                    info!("port {preferred} is unavailable, using {candidate} instead");
                }
                return candidate;
            }
        }

        let fallback = if excluded.contains(&preferred) {
            (preferred..=u16::MAX)
                .chain(FIRST_USER_PORT..preferred)
                .find(|port| !excluded.contains(port))
                .unwrap_or(preferred)
        } else {
            preferred
        };
        warn!(
            "could not find an available port within {MAX_PORT_ATTEMPTS} attempts starting at {preferred}. falling back to {fallback}"
        );
        fallback
    }

    /// Resolves all four ports from scratch, honouring operator overrides first.
    pub fn resolve_all(
        &self,
        preferred: ServiceEndpoints,
        overrides: &PortOverrides,
    ) -> ServiceEndpoints {
        let mut excluded = HashSet::new();
        let pinned = pin_overrides(overrides, &mut excluded);

        let mut resolve = |pinned: Option<u16>, preferred: u16| match pinned {
            Some(port) => port,
            None => {
                let port = self.find_available_port(preferred, &excluded);
                excluded.insert(port);
                port
            }
        };

        let endpoints = ServiceEndpoints {
            cdp: resolve(pinned.cdp, preferred.cdp),
            http_mcp: resolve(pinned.http_mcp, preferred.http_mcp),
            agent: resolve(pinned.agent, preferred.agent),
            extension: resolve(pinned.extension, preferred.extension),
        };
        debug!("resolved service ports: {endpoints}");
        endpoints
    }

    /// Re-probes every reassignable port before a restart. The cdp port is kept as-is,
    /// since it's owned by this process and other processes rely on it.
    pub fn revalidate(
        &self,
        current: ServiceEndpoints,
        overrides: &PortOverrides,
    ) -> ServiceEndpoints {
        let mut excluded = HashSet::new();
        excluded.insert(current.cdp);
        let overrides = PortOverrides {
            cdp: None,
            ..*overrides
        };
        let pinned = pin_overrides(&overrides, &mut excluded);

        let mut resolve = |pinned: Option<u16>, preferred: u16| match pinned {
            Some(port) => port,
            None => {
                let port = self.find_available_port(preferred, &excluded);
                excluded.insert(port);
                port
            }
        };

        let endpoints = ServiceEndpoints {
            cdp: current.cdp,
            http_mcp: resolve(pinned.http_mcp, current.http_mcp),
            agent: resolve(pinned.agent, current.agent),
            extension: resolve(pinned.extension, current.extension),
        };
        if endpoints != current {
            info!("service ports changed after revalidation: {endpoints}");
        }
        endpoints
    }
}

// claims the operator pinned ports, dropping any duplicates so they get probed instead
fn pin_overrides(overrides: &PortOverrides, excluded: &mut HashSet<u16>) -> PortOverrides {
    let mut pin = |name: &str, port: Option<u16>| {
        let port = port?;
        if !excluded.insert(port) {
            warn!("the {name} port override {port} is already in use by another service. ignoring it");
            return None;
        }
        Some(port)
    };

    PortOverrides {
        cdp: pin("cdp", overrides.cdp),
        http_mcp: pin("http_mcp", overrides.http_mcp),
        agent: pin("agent", overrides.agent),
        extension: pin("extension", overrides.extension),
    }
}
