// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::env;
use std::fmt::{self, Display, Formatter};

pub const OS_MACOS: &str = "macos";
pub const OS_LINUX: &str = "linux";
pub const OS_WINDOWS: &str = "windows";

pub const ARCH_ARM64: &str = "arm64";
pub const ARCH_X86_64: &str = "x86_64";

/// OS and CPU architecture tags, as they appear on feed enclosures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new<S: Into<String>, T: Into<String>>(os: S, arch: T) -> Self {
        Platform {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Tags of the platform this binary was compiled for.
    /// Returns `None` if the feed has no naming convention for it.
    pub fn current() -> Option<Self> {
        let os = match env::consts::OS {
            "macos" => OS_MACOS,
            "linux" => OS_LINUX,
            "windows" => OS_WINDOWS,
            _ => return None,
        };
        let arch = match env::consts::ARCH {
            "aarch64" => ARCH_ARM64,
            "x86_64" => ARCH_X86_64,
            _ => return None,
        };
        Some(Platform::new(os, arch))
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_platform_uses_feed_tags() {
        let Some(platform) = Platform::current() else {
            return;
        };
        assert!([OS_MACOS, OS_LINUX, OS_WINDOWS].contains(&platform.os.as_str()));
        assert!([ARCH_ARM64, ARCH_X86_64].contains(&platform.arch.as_str()));
        assert_ne!(platform.arch, "aarch64");
    }

    #[test]
    fn display() {
        assert_eq!(
            Platform::new(OS_LINUX, ARCH_X86_64).to_string(),
            "linux-x86_64"
        );
    }
}
