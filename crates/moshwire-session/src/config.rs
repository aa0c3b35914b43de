//! セッション設定

use std::time::Duration;

use serde::{Deserialize, Serialize};

use moshwire_crypto::DATAGRAM_OVERHEAD;
use moshwire_transport::MAX_RTT_SAMPLE_MS;

use crate::error::SessionError;

/// UDP ペイロードの既定の最大長（モバイル回線でも断片化しにくい値）
pub const DEFAULT_MTU: usize = 500;

/// 受信待ちの既定のタイムアウト（ミリ秒）
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 250;

/// セッション設定
///
/// JSON の欠けているフィールドは既定値になる。
///
/// ```json
/// { "mtu": 1200, "receive_timeout_ms": 100 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// UDP ペイロードの最大長（バイト）
    pub mtu: usize,
    /// 受信待ちのタイムアウト（ミリ秒）。クローズはこの時間以内に反映される
    pub receive_timeout_ms: u64,
    /// これを超える RTT サンプルは捨てる（ミリ秒）
    pub max_rtt_sample_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            mtu: DEFAULT_MTU,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            max_rtt_sample_ms: MAX_RTT_SAMPLE_MS,
        }
    }
}

impl SessionConfig {
    /// JSON 文字列から読み込む
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Fragment 1 つの最大長（MTU から暗号オーバーヘッドを引いたもの）
    pub fn max_fragment_len(&self) -> usize {
        self.mtu.saturating_sub(DATAGRAM_OVERHEAD)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}
