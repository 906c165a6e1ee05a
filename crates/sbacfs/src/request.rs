//! Access requests handed to the decision pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bit the kernel sets in the open flags of an `open` issued by `execve`.
///
/// FUSE forwards it unchanged, so it is the only way to tell an open for
/// execution apart from an open for reading.
pub const FMODE_EXEC: i32 = 0x20;

/// The policy table an operation is checked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessClass {
    /// Reading file contents or listing a directory
    Read,
    /// Anything that modifies the tree
    Write,
    /// Opening an object to execute it
    Execute,
}

impl AccessClass {
    /// The `access(2)` mask that corresponds to this class.
    pub fn access_mask(&self) -> i32 {
        match self {
            AccessClass::Read => libc::R_OK,
            AccessClass::Write => libc::W_OK,
            AccessClass::Execute => libc::X_OK,
        }
    }
}

impl fmt::Display for AccessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessClass::Read => "read",
            AccessClass::Write => "write",
            AccessClass::Execute => "execute",
        })
    }
}

/// The filesystem operation being performed.
///
/// The lowercase name is what ends up in the history log and what the
/// remote authorities receive on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Opening a file
    Open,
    /// Reading from an open file
    Read,
    /// Listing a directory
    Readdir,
    /// Writing to an open file
    Write,
    /// Creating a file
    Create,
    /// Changing the size of a file
    Truncate,
    /// Removing a file
    Unlink,
    /// Creating a directory
    Mkdir,
    /// Removing a directory
    Rmdir,
    /// Renaming a file or directory
    Rename,
    /// Creating a symbolic link
    Symlink,
}

impl Mode {
    /// Wire and history name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Open => "open",
            Mode::Read => "read",
            Mode::Readdir => "readdir",
            Mode::Write => "write",
            Mode::Create => "create",
            Mode::Truncate => "truncate",
            Mode::Unlink => "unlink",
            Mode::Mkdir => "mkdir",
            Mode::Rmdir => "rmdir",
            Mode::Rename => "rename",
            Mode::Symlink => "symlink",
        }
    }

    /// The access class an operation is checked against when no open flags
    /// are involved.
    pub fn default_class(&self) -> AccessClass {
        match self {
            Mode::Open | Mode::Read | Mode::Readdir => AccessClass::Read,
            Mode::Write
            | Mode::Create
            | Mode::Truncate
            | Mode::Unlink
            | Mode::Mkdir
            | Mode::Rmdir
            | Mode::Rename
            | Mode::Symlink => AccessClass::Write,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "open" => Mode::Open,
            "read" => Mode::Read,
            "readdir" => Mode::Readdir,
            "write" => Mode::Write,
            "create" => Mode::Create,
            "truncate" => Mode::Truncate,
            "unlink" => Mode::Unlink,
            "mkdir" => Mode::Mkdir,
            "rmdir" => Mode::Rmdir,
            "rename" => Mode::Rename,
            "symlink" => Mode::Symlink,
            other => return Err(format!("unknown operation '{other}'")),
        })
    }
}

/// One request entering the decision pipeline.
///
/// Whether an open is meant for execution is decided from the flags seen at
/// the call site and carried here, so concurrent requests never observe each
/// other's flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessRequest {
    /// Mount-relative absolute path (`/dir/file`)
    pub path: String,
    /// The operation
    pub mode: Mode,
    /// The policy section consulted
    pub class: AccessClass,
    /// Set on opens carrying [`FMODE_EXEC`]
    pub exec_intent: bool,
}

impl AccessRequest {
    /// A request checked against the operation's default class.
    pub fn new(path: impl Into<String>, mode: Mode) -> Self {
        Self {
            path: path.into(),
            mode,
            class: mode.default_class(),
            exec_intent: false,
        }
    }

    /// An `open` request; the flags decide between `read` and `execute`.
    pub fn open(path: impl Into<String>, flags: i32) -> Self {
        let exec_intent = flags & FMODE_EXEC != 0;
        Self {
            path: path.into(),
            mode: Mode::Open,
            class: if exec_intent {
                AccessClass::Execute
            } else {
                AccessClass::Read
            },
            exec_intent,
        }
    }

    /// Parent directory of the requested path, as recorded in the history.
    pub fn prefix(&self) -> &str {
        parent_dir(&self.path)
    }
}

/// Parent directory of a slash-separated path.
///
/// `/a/b` → `/a`, `/a` → `/`, `/` → `/`, `name` → `""`.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}
