//! Container identity of the tracer itself

use crate::procfs::ProcFs;
use crate::proto::ContainerContext;
use regex::Regex;
use std::os::unix::fs::MetadataExt;
use std::sync::OnceLock;
use tracing::{debug, warn};

fn container_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            // Docker, containerd and CRI-O name the leaf cgroup after a
            // 64-hex-digit id, with an optional runtime prefix and scope suffix
            Regex::new(r"(?:^|[/\-:])([0-9a-f]{64})(?:\.scope)?(?:$|/)").ok()
        })
        .as_ref()
}

/// Extract a container id from the contents of a `cgroup` file
pub fn container_id_from_cgroup(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        // hierarchy-id:controllers:path
        let path = line.splitn(3, ':').nth(2)?;
        container_id_pattern()?
            .captures(path)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Container id of the current process, empty when not containerized
pub fn current_container_id(procfs: &ProcFs) -> String {
    match procfs.read_self("cgroup") {
        Ok(content) => container_id_from_cgroup(&content).unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "unable to read own cgroup, assuming no container");
            String::new()
        }
    }
}

/// Container context sent in the handshake.
///
/// The creation time is the start time of the namespace's init process.
pub fn container_context(procfs: &ProcFs) -> ContainerContext {
    let id = current_container_id(procfs);
    if id.is_empty() {
        return ContainerContext::default();
    }

    let created_at = procfs.start_time_ns(1).unwrap_or_else(|e| {
        debug!(error = %e, "unable to read container start time");
        0
    });
    ContainerContext { id, created_at }
}

/// Inode of the tracer's pid namespace, 0 when unavailable
pub fn namespace_id(procfs: &ProcFs) -> u64 {
    match std::fs::metadata(procfs.root().join("self/ns/pid")) {
        Ok(meta) => meta.ino(),
        Err(e) => {
            debug!(error = %e, "unable to stat pid namespace");
            0
        }
    }
}
