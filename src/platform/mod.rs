//! Platform adapter: the only place that touches host primitives.
//!
//! Every other subsystem reads file bytes through [`ContentSource`] and talks
//! HTTP through [`Transport`], so host drift stays contained here.

mod source;
mod transport;

pub use source::{BytesSource, ContentSource, FileSource};
pub use transport::{
    FormField, FormPart, HttpTransport, ProbeResponse, Transport, TransportResponse,
};

use serde::{Deserialize, Serialize};

/// The host family this library is embedded in.
///
/// Selection happens once at kernel boot via capability probing instead of
/// duck-typing host globals at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformKind {
    Browser,
    WechatMp,
    AlipayMp,
    BytedanceMp,
    BaiduMp,
    Native,
}

impl PlatformKind {
    /// Per-origin connection cap observed on this host class.
    pub fn connection_limit(&self) -> usize {
        match self {
            PlatformKind::Browser => 6,
            PlatformKind::WechatMp
            | PlatformKind::AlipayMp
            | PlatformKind::BytedanceMp
            | PlatformKind::BaiduMp => 10,
            PlatformKind::Native => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Browser => "browser",
            PlatformKind::WechatMp => "wechat-mp",
            PlatformKind::AlipayMp => "alipay-mp",
            PlatformKind::BytedanceMp => "bytedance-mp",
            PlatformKind::BaiduMp => "baidu-mp",
            PlatformKind::Native => "native",
        }
    }

    /// Probe the running host. The Rust build always resolves to `Native`;
    /// the other variants exist so persisted telemetry and config stay
    /// portable across hosts.
    pub fn detect() -> Self {
        PlatformKind::Native
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_platform_is_detected() {
        assert_eq!(PlatformKind::detect(), PlatformKind::Native);
        assert!(PlatformKind::detect().connection_limit() > 0);
    }
}
