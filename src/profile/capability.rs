//! Linux capability identifiers.
//!
//! Profiles may only name capabilities from this fixed set. Names are accepted
//! in either the kernel form (`CAP_NET_ADMIN`) or the short form (`net_admin`),
//! case-insensitively, and always render in the kernel form.

use std::fmt;
use std::str::FromStr;

use crate::error::IsolatorError;

macro_rules! capabilities {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// A Linux capability that a sandboxed process may retain.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum Capability {
            $($variant),+
        }

        impl Capability {
            /// Every known capability, in kernel numbering order.
            pub const ALL: &'static [Capability] = &[$(Capability::$variant),+];

            /// The kernel name, e.g. `CAP_SYS_ADMIN`.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Capability::$variant => $name),+
                }
            }
        }
    };
}

capabilities! {
    Chown => "CAP_CHOWN",
    DacOverride => "CAP_DAC_OVERRIDE",
    DacReadSearch => "CAP_DAC_READ_SEARCH",
    Fowner => "CAP_FOWNER",
    Fsetid => "CAP_FSETID",
    Kill => "CAP_KILL",
    Setgid => "CAP_SETGID",
    Setuid => "CAP_SETUID",
    Setpcap => "CAP_SETPCAP",
    LinuxImmutable => "CAP_LINUX_IMMUTABLE",
    NetBindService => "CAP_NET_BIND_SERVICE",
    NetBroadcast => "CAP_NET_BROADCAST",
    NetAdmin => "CAP_NET_ADMIN",
    NetRaw => "CAP_NET_RAW",
    IpcLock => "CAP_IPC_LOCK",
    IpcOwner => "CAP_IPC_OWNER",
    SysModule => "CAP_SYS_MODULE",
    SysRawio => "CAP_SYS_RAWIO",
    SysChroot => "CAP_SYS_CHROOT",
    SysPtrace => "CAP_SYS_PTRACE",
    SysPacct => "CAP_SYS_PACCT",
    SysAdmin => "CAP_SYS_ADMIN",
    SysBoot => "CAP_SYS_BOOT",
    SysNice => "CAP_SYS_NICE",
    SysResource => "CAP_SYS_RESOURCE",
    SysTime => "CAP_SYS_TIME",
    SysTtyConfig => "CAP_SYS_TTY_CONFIG",
    Mknod => "CAP_MKNOD",
    Lease => "CAP_LEASE",
    AuditWrite => "CAP_AUDIT_WRITE",
    AuditControl => "CAP_AUDIT_CONTROL",
    Setfcap => "CAP_SETFCAP",
    MacOverride => "CAP_MAC_OVERRIDE",
    MacAdmin => "CAP_MAC_ADMIN",
    Syslog => "CAP_SYSLOG",
    WakeAlarm => "CAP_WAKE_ALARM",
    BlockSuspend => "CAP_BLOCK_SUSPEND",
    AuditRead => "CAP_AUDIT_READ",
    Perfmon => "CAP_PERFMON",
    Bpf => "CAP_BPF",
    CheckpointRestore => "CAP_CHECKPOINT_RESTORE",
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = IsolatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let canonical = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{upper}")
        };
        Capability::ALL
            .iter()
            .copied()
            .find(|cap| cap.as_str() == canonical)
            .ok_or_else(|| IsolatorError::InvalidOverride(format!("unknown capability '{s}'")))
    }
}

impl TryFrom<String> for Capability {
    type Error = IsolatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_and_short_forms() {
        assert_eq!("CAP_SYS_ADMIN".parse::<Capability>().unwrap(), Capability::SysAdmin);
        assert_eq!("net_admin".parse::<Capability>().unwrap(), Capability::NetAdmin);
        assert_eq!("cap_setuid".parse::<Capability>().unwrap(), Capability::Setuid);
        assert_eq!(" SETGID ".parse::<Capability>().unwrap(), Capability::Setgid);
    }

    #[test]
    fn test_parse_unknown_capability() {
        let err = "CAP_TELEPORT".parse::<Capability>().unwrap_err();
        assert!(matches!(err, IsolatorError::InvalidOverride(_)));
        assert!(err.to_string().contains("CAP_TELEPORT"));
    }

    #[test]
    fn test_names_are_unique_and_round_trip() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), *cap);
        }
        let mut names: Vec<_> = Capability::ALL.iter().map(Capability::as_str).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Capability::ALL.len());
    }

    #[test]
    fn test_serde_uses_kernel_names() {
        let json = serde_json::to_string(&Capability::NetAdmin).unwrap();
        assert_eq!(json, "\"CAP_NET_ADMIN\"");
        let cap: Capability = serde_json::from_str("\"sys_ptrace\"").unwrap();
        assert_eq!(cap, Capability::SysPtrace);
        assert!(serde_json::from_str::<Capability>("\"bogus\"").is_err());
    }
}
