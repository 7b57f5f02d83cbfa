//! The two Git server-side RPCs.

use std::fmt;

/// Which server-side Git program a request maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rpc {
    /// `git upload-pack`: fetch/clone (read).
    UploadPack,
    /// `git receive-pack`: push (write).
    ReceivePack,
}

impl Rpc {
    /// The wire service name, e.g. `git-upload-pack`.
    pub fn service_name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// The `git` subcommand, e.g. `upload-pack`.
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    pub fn from_service_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::ReceivePack)
    }
}

impl fmt::Display for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}
