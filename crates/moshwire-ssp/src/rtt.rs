//! RTT 推定
//!
//! Jacobson/Karels アルゴリズム（RFC 6298）を整数ミリ秒で計算する。

use crate::{RTO_INITIAL_MS, RTO_MAX_MS, RTO_MIN_MS, SEND_INTERVAL_MAX_MS, SEND_INTERVAL_MIN_MS};

/// Smoothed RTT / RTTVAR / RTO の推定器
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    srtt_ms: u64,
    rttvar_ms: u64,
    /// 最初のサンプルを受け取ったか
    hit: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// RTT サンプルを反映する（0 ms のサンプルは無視）
    ///
    /// ```text
    /// 初回:   SRTT = R, RTTVAR = R/2
    /// 以降:   RTTVAR = (3*RTTVAR + |SRTT - R|) / 4
    ///         SRTT   = (7*SRTT + R) / 8
    /// ```
    pub fn observe(&mut self, sample_ms: u64) {
        if sample_ms == 0 {
            return;
        }

        if !self.hit {
            self.srtt_ms = sample_ms;
            self.rttvar_ms = sample_ms / 2;
            self.hit = true;
            return;
        }

        self.rttvar_ms = (self.rttvar_ms.saturating_mul(3) + self.srtt_ms.abs_diff(sample_ms)) / 4;
        self.srtt_ms = (self.srtt_ms.saturating_mul(7) + sample_ms) / 8;
    }

    /// Smoothed RTT（サンプルがなければ 0）
    pub fn srtt(&self) -> u64 {
        self.srtt_ms
    }

    /// RTT のばらつき（サンプルがなければ 0）
    pub fn rttvar(&self) -> u64 {
        self.rttvar_ms
    }

    /// サンプルを 1 つ以上受け取ったか
    pub fn has_samples(&self) -> bool {
        self.hit
    }

    /// 想定 RTT（サンプルがなければ初期 RTO）
    pub fn rtt_estimate(&self) -> u64 {
        if self.hit {
            self.srtt_ms
        } else {
            RTO_INITIAL_MS
        }
    }

    /// 再送タイムアウト: `clamp(SRTT + 4*RTTVAR, 50, 1000)`
    pub fn rto(&self) -> u64 {
        if !self.hit {
            return RTO_INITIAL_MS;
        }
        (self.srtt_ms + 4 * self.rttvar_ms).clamp(RTO_MIN_MS, RTO_MAX_MS)
    }

    /// 送信間隔: `clamp(SRTT/2, 20, 250)`（RTT が小さいほど速く送る）
    pub fn send_interval(&self) -> u64 {
        self.rtt_estimate().div_ceil(2).clamp(SEND_INTERVAL_MIN_MS, SEND_INTERVAL_MAX_MS)
    }
}
