//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! Derives a remote peer's capability flags from its advertised runtime.

use crate::core::signaling::UserAgent;

/// Capability flags derived from a remote peer's [`UserAgent`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_remove_stream: bool,
    pub supports_plan_b: bool,
}

impl Capabilities {
    /// `FireFox` clears both flags; every other advertised runtime sets
    /// both. Must be called before the session transitions forward on
    /// receipt of an invitation or acceptance, so later `Publish` calls see
    /// the right flags.
    pub fn classify(ua: &UserAgent) -> Self {
        if ua.runtime.name == "FireFox" {
            Capabilities {
                supports_remove_stream: false,
                supports_plan_b: false,
            }
        } else {
            Capabilities {
                supports_remove_stream: true,
                supports_plan_b: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signaling::{RuntimeInfo, SdkInfo};

    fn ua(runtime_name: &str) -> UserAgent {
        UserAgent {
            sdk: SdkInfo {
                kind: "chatrtc".to_string(),
                version: "1.0.0".to_string(),
            },
            runtime: RuntimeInfo {
                name: runtime_name.to_string(),
                version: "1".to_string(),
            },
        }
    }

    #[test]
    fn firefox_clears_both_flags() {
        let caps = Capabilities::classify(&ua("FireFox"));
        assert!(!caps.supports_remove_stream);
        assert!(!caps.supports_plan_b);
    }

    #[test]
    fn other_runtimes_set_both_flags() {
        for name in ["Chrome", "Safari", "Edge", ""] {
            let caps = Capabilities::classify(&ua(name));
            assert!(caps.supports_remove_stream, "runtime {name}");
            assert!(caps.supports_plan_b, "runtime {name}");
        }
    }
}
