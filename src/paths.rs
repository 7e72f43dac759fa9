use std::net::SocketAddr;
use std::time::Duration;

use tracing::trace;

use crate::shared::SocketId;

/// Address family of a peer address, as cached across connections
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddressFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl AddressFamily {
    fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// Delay before the second address family joins the race
const CONN_ATTEMPT_DELAY: Duration = Duration::from_millis(150);
/// Shorter delay when a previous connection told us which family works
const CONN_ATTEMPT_DELAY_WITH_CACHE: Duration = Duration::from_millis(15);

/// Races the initial connection attempt over IPv6 and IPv4 ("Happy Eyeballs")
///
/// The connection begins on the preferred family. If the delay timer fires
/// before a valid server response arrives, outgoing datagrams are duplicated
/// onto the second socket. The first socket to carry an authenticated
/// response becomes the connection's path; the other is retired.
pub struct PathManager {
    primary: Path,
    secondary: Option<Path>,
    /// Whether the second socket has joined the race
    second_started: bool,
    /// Whether a server response has committed us to a path
    chosen: bool,
    delay: Duration,
}

#[derive(Debug, Copy, Clone)]
struct Path {
    socket: SocketId,
    remote: SocketAddr,
}

impl PathManager {
    /// Select initial and backup paths from the configured peer addresses
    ///
    /// At most one address per family is used. With Happy Eyeballs disabled,
    /// only the first address participates.
    pub fn new(
        addresses: &[SocketAddr],
        happy_eyeballs: bool,
        cached_family: Option<AddressFamily>,
    ) -> Self {
        assert!(!addresses.is_empty(), "at least one peer address required");

        let preferred = cached_family.unwrap_or(AddressFamily::V6);
        let first = addresses
            .iter()
            .find(|a| AddressFamily::of(a) == preferred)
            .or_else(|| addresses.first())
            .cloned()
            .unwrap();
        let second = if happy_eyeballs {
            addresses
                .iter()
                .find(|a| AddressFamily::of(a) != AddressFamily::of(&first))
                .cloned()
        } else {
            None
        };

        trace!(primary = %first, secondary = ?second, "initial path selection");
        Self {
            primary: Path {
                socket: SocketId::Primary,
                remote: first,
            },
            secondary: second.map(|remote| Path {
                socket: SocketId::Secondary,
                remote,
            }),
            second_started: false,
            chosen: false,
            delay: if cached_family.is_some() {
                CONN_ATTEMPT_DELAY_WITH_CACHE
            } else {
                CONN_ATTEMPT_DELAY
            },
        }
    }

    /// The socket and address outgoing packets should use
    pub fn current(&self) -> (SocketId, SocketAddr) {
        (self.primary.socket, self.primary.remote)
    }

    /// The backup path, while datagrams are being duplicated onto it
    pub fn duplicate_target(&self) -> Option<(SocketId, SocketAddr)> {
        if self.chosen || !self.second_started {
            return None;
        }
        self.secondary.map(|p| (p.socket, p.remote))
    }

    /// Whether the connection-attempt delay timer should be armed at start
    pub fn needs_delay_timer(&self) -> bool {
        !self.chosen && self.secondary.is_some()
    }

    /// How long to wait before the second family joins
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// The delay timer fired without a usable response on the primary
    pub fn on_delay_expired(&mut self) {
        if self.chosen || self.secondary.is_none() {
            return;
        }
        trace!("second connection attempt started");
        self.second_started = true;
    }

    /// Whether a datagram arriving on `socket` from `remote` belongs to this connection
    pub fn is_known_remote(&self, socket: SocketId, remote: SocketAddr) -> bool {
        if self.primary.socket == socket && self.primary.remote == remote {
            return true;
        }
        match self.secondary {
            Some(ref p) => p.socket == socket && p.remote == remote,
            None => false,
        }
    }

    /// A valid server response arrived on `socket`; commit to that path.
    ///
    /// Returns the socket to retire, if a loser exists.
    pub fn on_response(&mut self, socket: SocketId) -> Option<SocketId> {
        if self.chosen {
            return None;
        }
        self.chosen = true;
        let secondary = self.secondary.take()?;
        if secondary.socket == socket {
            // The backup won the race
            let loser = std::mem::replace(&mut self.primary, secondary);
            trace!(remote = %self.primary.remote, "backup path chosen");
            Some(loser.socket)
        } else {
            trace!(remote = %self.primary.remote, "primary path confirmed");
            Some(secondary.socket)
        }
    }

    /// Whether a path has been committed to
    pub fn is_chosen(&self) -> bool {
        self.chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4() -> SocketAddr {
        "192.0.2.1:4433".parse().unwrap()
    }

    fn v6() -> SocketAddr {
        "[2001:db8::1]:4433".parse().unwrap()
    }

    #[test]
    fn prefers_v6_by_default() {
        let paths = PathManager::new(&[v4(), v6()], true, None);
        assert_eq!(paths.current(), (SocketId::Primary, v6()));
        assert!(paths.needs_delay_timer());
        assert_eq!(paths.delay(), CONN_ATTEMPT_DELAY);
    }

    #[test]
    fn cached_family_overrides_preference() {
        let paths = PathManager::new(&[v6(), v4()], true, Some(AddressFamily::V4));
        assert_eq!(paths.current(), (SocketId::Primary, v4()));
        assert_eq!(paths.delay(), CONN_ATTEMPT_DELAY_WITH_CACHE);
    }

    #[test]
    fn single_family_never_races() {
        let paths = PathManager::new(&[v4()], true, None);
        assert!(!paths.needs_delay_timer());
        assert!(paths.duplicate_target().is_none());
    }

    #[test]
    fn disabled_never_races() {
        let paths = PathManager::new(&[v6(), v4()], false, None);
        assert!(!paths.needs_delay_timer());
    }

    #[test]
    fn duplication_begins_when_timer_fires() {
        let mut paths = PathManager::new(&[v4(), v6()], true, None);
        assert!(paths.duplicate_target().is_none());
        paths.on_delay_expired();
        assert_eq!(paths.duplicate_target(), Some((SocketId::Secondary, v4())));
    }

    #[test]
    fn early_response_retires_backup() {
        let mut paths = PathManager::new(&[v4(), v6()], true, None);
        let retired = paths.on_response(SocketId::Primary);
        assert_eq!(retired, Some(SocketId::Secondary));
        assert_eq!(paths.current(), (SocketId::Primary, v6()));
        assert!(paths.is_chosen());
        // The race is over; the timer expiring later must not restart it
        paths.on_delay_expired();
        assert!(paths.duplicate_target().is_none());
    }

    #[test]
    fn backup_can_win() {
        let mut paths = PathManager::new(&[v4(), v6()], true, None);
        paths.on_delay_expired();
        let retired = paths.on_response(SocketId::Secondary);
        assert_eq!(retired, Some(SocketId::Primary));
        assert_eq!(paths.current(), (SocketId::Secondary, v4()));
    }

    #[test]
    fn response_commits_only_once() {
        let mut paths = PathManager::new(&[v4(), v6()], true, None);
        assert!(paths.on_response(SocketId::Primary).is_some());
        assert!(paths.on_response(SocketId::Secondary).is_none());
    }

    #[test]
    fn known_remotes() {
        let mut paths = PathManager::new(&[v4(), v6()], true, None);
        assert!(paths.is_known_remote(SocketId::Primary, v6()));
        assert!(paths.is_known_remote(SocketId::Secondary, v4()));
        assert!(!paths.is_known_remote(SocketId::Primary, v4()));
        paths.on_response(SocketId::Primary);
        assert!(!paths.is_known_remote(SocketId::Secondary, v4()));
    }
}
