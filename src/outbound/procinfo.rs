//! Local-port process ownership lookup (diagnostic only)
//!
//! When a new flow is opened, the gateway logs which local process owns the
//! originating port. The lookup walks `/proc/net/{tcp,tcp6,udp,udp6}` for
//! the socket inode, then scans `/proc/*/fd` for the process holding it.
//! Failures are silent; nothing on the data path depends on this.

use std::fmt;

/// Owner of a local port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    /// Owning process id, when the fd scan finds one
    pub pid: Option<u32>,
    /// Process name from `/proc/<pid>/comm`
    pub comm: Option<String>,
    /// Owning uid from the socket table
    pub uid: u32,
    /// Socket inode
    pub inode: u64,
}

impl fmt::Display for PortOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.pid, self.comm.as_deref()) {
            (Some(pid), Some(comm)) => write!(f, "pid {pid} ({comm}), uid {}", self.uid),
            (Some(pid), None) => write!(f, "pid {pid}, uid {}", self.uid),
            _ => write!(f, "uid {}, inode {}", self.uid, self.inode),
        }
    }
}

/// Transport table to search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    /// `/proc/net/tcp` and `/proc/net/tcp6`
    Tcp,
    /// `/proc/net/udp` and `/proc/net/udp6`
    Udp,
}

/// Find the process owning a local port, if the platform exposes it.
#[must_use]
pub fn port_owner(protocol: PortProtocol, port: u16) -> Option<PortOwner> {
    imp::port_owner(protocol, port)
}

/// Parse one `/proc/net/*` table, returning `(uid, inode)` for the first
/// entry whose local port matches.
///
/// Lines look like:
/// `0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000  0 12345 ...`
fn scan_proc_net(table: &str, port: u16) -> Option<(u32, u64)> {
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let _slot = fields.next()?;
        let local = fields.next()?;

        let (_, port_hex) = local.rsplit_once(':')?;
        let local_port = u16::from_str_radix(port_hex, 16).ok()?;
        if local_port != port {
            continue;
        }

        // remote, state, queues, timer, retransmit
        let mut rest = fields.skip(5);
        let uid = rest.next()?.parse().ok()?;
        let _timeout = rest.next()?;
        let inode = rest.next()?.parse().ok()?;
        return Some((uid, inode));
    }
    None
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{scan_proc_net, PortOwner, PortProtocol};
    use std::fs;

    pub(super) fn port_owner(protocol: PortProtocol, port: u16) -> Option<PortOwner> {
        let tables: &[&str] = match protocol {
            PortProtocol::Tcp => &["/proc/net/tcp", "/proc/net/tcp6"],
            PortProtocol::Udp => &["/proc/net/udp", "/proc/net/udp6"],
        };

        let (uid, inode) = tables
            .iter()
            .filter_map(|path| scan_proc_net(&fs::read_to_string(path).ok()?, port))
            .next()?;

        let (pid, comm) = match find_pid_by_inode(inode) {
            Some(pid) => {
                let comm = fs::read_to_string(format!("/proc/{pid}/comm"))
                    .ok()
                    .map(|s| s.trim().to_string());
                (Some(pid), comm)
            }
            None => (None, None),
        };

        Some(PortOwner {
            pid,
            comm,
            uid,
            inode,
        })
    }

    fn find_pid_by_inode(inode: u64) -> Option<u32> {
        let target = format!("socket:[{inode}]");
        for entry in fs::read_dir("/proc").ok()? {
            let entry = entry.ok()?;
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };

            let Ok(fds) = fs::read_dir(format!("/proc/{pid}/fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if link.to_string_lossy() == target {
                        return Some(pid);
                    }
                }
            }
        }
        None
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::{PortOwner, PortProtocol};

    pub(super) fn port_owner(_protocol: PortProtocol, _port: u16) -> Option<PortOwner> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 340212 1 0000000000000000 100 0 0 10 0
   1: 3500007F:0035 00000000:0000 07 00000000:00000000 00:00000000 00000000   102        0 24816 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn test_scan_proc_net_finds_port() {
        // 0x1f90 = 8080
        let (uid, inode) = scan_proc_net(SAMPLE, 8080).unwrap();
        assert_eq!(uid, 1000);
        assert_eq!(inode, 340_212);

        // 0x0035 = 53
        let (uid, inode) = scan_proc_net(SAMPLE, 53).unwrap();
        assert_eq!(uid, 102);
        assert_eq!(inode, 24_816);
    }

    #[test]
    fn test_scan_proc_net_misses_unknown_port() {
        assert!(scan_proc_net(SAMPLE, 9999).is_none());
        assert!(scan_proc_net("", 8080).is_none());
    }

    #[test]
    fn test_port_owner_display() {
        let owner = PortOwner {
            pid: Some(4242),
            comm: Some("curl".into()),
            uid: 1000,
            inode: 1,
        };
        assert_eq!(owner.to_string(), "pid 4242 (curl), uid 1000");

        let anonymous = PortOwner {
            pid: None,
            comm: None,
            uid: 0,
            inode: 77,
        };
        assert_eq!(anonymous.to_string(), "uid 0, inode 77");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lookup_own_listener() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // The socket table must at least contain our listener; the fd scan
        // may or may not resolve depending on /proc visibility.
        let owner = port_owner(PortProtocol::Tcp, port).expect("own listener not found");
        assert!(owner.inode > 0);
    }
}
