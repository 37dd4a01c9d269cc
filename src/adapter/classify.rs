//! Exit-code + stderr classification into the stable error taxonomy.
//!
//! Matchers are tried in order, most specific first; the first match wins
//! (spec §4.A). `Busy` is the only kind handlers retry automatically.

use crate::error::Error;

struct Matcher {
    needle: &'static str,
    build: fn(&str) -> Error,
}

const MATCHERS: &[Matcher] = &[
    Matcher {
        needle: "is already locked",
        build: |stderr| Error::Busy(stderr.to_string()),
    },
    Matcher {
        needle: "already locked for a session",
        build: |stderr| Error::Busy(stderr.to_string()),
    },
    Matcher {
        needle: "Could not find a registered machine",
        build: |stderr| Error::NotFound(stderr.to_string()),
    },
    Matcher {
        needle: "Could not find a snapshot",
        build: |stderr| Error::NotFound(stderr.to_string()),
    },
    Matcher {
        needle: "Could not find file for the medium",
        build: |stderr| Error::NotFound(stderr.to_string()),
    },
    Matcher {
        needle: "VM name already exists",
        build: |stderr| Error::AlreadyExists(stderr.to_string()),
    },
    Matcher {
        needle: "already exists",
        build: |stderr| Error::AlreadyExists(stderr.to_string()),
    },
    Matcher {
        needle: "is not currently running",
        build: |stderr| Error::InvalidState(stderr.to_string()),
    },
    Matcher {
        needle: "is not currently in a running/paused state",
        build: |stderr| Error::InvalidState(stderr.to_string()),
    },
    Matcher {
        needle: "Invalid machine state",
        build: |stderr| Error::InvalidState(stderr.to_string()),
    },
    Matcher {
        needle: "Permission denied",
        build: |stderr| Error::PermissionDenied(stderr.to_string()),
    },
    Matcher {
        needle: "Access is denied",
        build: |stderr| Error::PermissionDenied(stderr.to_string()),
    },
    Matcher {
        needle: "VERR_DISK_FULL",
        build: |stderr| Error::HostError(stderr.to_string()),
    },
    Matcher {
        needle: "not enough memory",
        build: |stderr| Error::HostError(stderr.to_string()),
    },
];

/// Classify a failed `VBoxManage` invocation. Only called when `exit_code != 0`.
pub fn classify(exit_code: i32, stderr: &str) -> Error {
    for m in MATCHERS {
        if stderr.contains(m.needle) {
            return (m.build)(stderr);
        }
    }
    Error::HostError(format!(
        "VBoxManage exited with status {exit_code}: {}",
        stderr.trim()
    ))
}
