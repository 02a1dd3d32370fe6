//! Host identity detection for the startup banner.
//!
//! A process is considered containerized when PID 1's cgroup file names a
//! docker scope built from the first 12 characters of the host name, which
//! is how docker names its containers by default.

use std::fs;
use std::io;
use std::path::Path;

pub const CGROUP_PATH: &str = "/proc/1/cgroup";
const CONTAINER_ID_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    /// Host name, or the short container id when containerized.
    pub id: String,
    pub containerized: bool,
}

impl HostIdentity {
    /// Detect the identity of this process.
    ///
    /// Runs before logging is initialized (the log format depends on the
    /// result), so a cgroup read failure is returned for the caller to log.
    /// The identity then falls back to the plain host name.
    pub fn detect() -> (Self, Option<io::Error>) {
        Self::detect_with(&hostname(), Path::new(CGROUP_PATH))
    }

    fn detect_with(hostname: &str, cgroup: &Path) -> (Self, Option<io::Error>) {
        let short: String = hostname.chars().take(CONTAINER_ID_LEN).collect();
        let marker = format!("/docker-{short}");
        let plain = HostIdentity {
            id: hostname.to_string(),
            containerized: false,
        };

        match fs::read_to_string(cgroup) {
            Ok(contents) if contents.lines().any(|line| line.contains(&marker)) => (
                HostIdentity {
                    id: short,
                    containerized: true,
                },
                None,
            ),
            Ok(_) => (plain, None),
            Err(e) => (plain, Some(e)),
        }
    }
}

/// Local host name as reported by the kernel.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for writes of buf.len() bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}
