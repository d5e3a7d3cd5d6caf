//! Kernel network tunables.

use std::io;
use std::path::{Path, PathBuf};

/// Writes network tunables by key relative to the tunable root, for
/// example `ipv4/route/flush`.
pub trait Sysctl: Send + Sync {
    fn write(&self, key: &str, value: &str) -> io::Result<()>;
}

/// Tunables backed by files under a root directory (`/proc/sys/net`).
#[derive(Debug, Clone)]
pub struct SysctlFs {
    root: PathBuf,
}

impl SysctlFs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Sysctl for SysctlFs {
    fn write(&self, key: &str, value: &str) -> io::Result<()> {
        let path = self.root.join(key);
        tracing::trace!(path = %path.display(), value, "writing tunable");
        std::fs::write(path, value)
    }
}

/// Key of the tunable redirecting router advertisement routes of `ifname`.
pub(crate) fn accept_ra_rt_table_key(ifname: &str) -> String {
    format!("ipv6/conf/{}/accept_ra_rt_table", ifname)
}

/// Keys of the route cache flush tunables.
pub(crate) const ROUTE_FLUSH_KEYS: [&str; 2] = ["ipv4/route/flush", "ipv6/route/flush"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_write_under_root() {
        let root = std::env::temp_dir().join(format!("policyroute-sysctl-{}", std::process::id()));
        std::fs::create_dir_all(root.join("ipv4/route")).unwrap();

        let sysctl = SysctlFs::new(&root);
        sysctl.write("ipv4/route/flush", "-1").unwrap();
        assert_eq!(std::fs::read_to_string(root.join("ipv4/route/flush")).unwrap(), "-1");

        let err = sysctl
            .write(&accept_ra_rt_table_key("gone0"), "0")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        std::fs::remove_dir_all(root).unwrap();
    }
}
