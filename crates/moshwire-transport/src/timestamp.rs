//! mosh タイムスタンプ（16ビット）とタイムスタンプエコー
//!
//! mosh はミリ秒単位の時刻の下位 16 ビットをタイムスタンプとして使用する。
//! 受信側は最後に受け取ったタイムスタンプを保持時間ぶん補正してエコーバックし、
//! 送信側はエコーされた値と現在時刻の差から RTT サンプルを得る。

/// エコーを返してよい、受信からの経過時間の上限（ms）
pub const ECHO_WINDOW_MS: u64 = 1000;

/// これより大きい RTT サンプルは捨てる（ms）
pub const MAX_RTT_SAMPLE_MS: u64 = 5000;

/// mosh パケットのタイムスタンプ（16ビット、ミリ秒の下位16ビット）
///
/// オーバーフローは mod 2^16 として扱う（最大表現できるのは約 65 秒）。
/// `0xFFFF` は「タイムスタンプなし」を表すので、ローカル時刻からは生成しない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp16(pub u16);

impl Timestamp16 {
    /// タイムスタンプなし（エコーすべき値がない）
    pub const NONE: Self = Timestamp16(u16::MAX);

    /// ミリ秒の時刻から Timestamp16 を生成する
    ///
    /// 下位 16 ビットが `0xFFFF` になる場合は 0 に丸める。
    pub fn now_from_ms(now_ms: u64) -> Self {
        let ts = (now_ms & 0xFFFF) as u16;
        if ts == u16::MAX {
            Timestamp16(0)
        } else {
            Timestamp16(ts)
        }
    }

    /// 2 つのタイムスタンプの差を計算する（newer - older, mod 2^16）
    pub fn diff(newer: Self, older: Self) -> u16 {
        newer.0.wrapping_sub(older.0)
    }

    /// 生の u16 値を返す
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// 有効なタイムスタンプか（`NONE` でない）
    pub fn is_some(&self) -> bool {
        *self != Self::NONE
    }
}

impl From<u16> for Timestamp16 {
    fn from(val: u16) -> Self {
        Timestamp16(val)
    }
}

/// エコーされたタイムスタンプから RTT サンプル（ms）を計算する
///
/// エコーがない場合と、`max_sample_ms` を超える場合は `None`。
pub fn rtt_sample(timestamp_reply: Timestamp16, now_ms: u64, max_sample_ms: u64) -> Option<u64> {
    if !timestamp_reply.is_some() {
        return None;
    }
    let sample = u64::from(Timestamp16::diff(Timestamp16::now_from_ms(now_ms), timestamp_reply));
    (sample <= max_sample_ms).then_some(sample)
}

/// 相手のタイムスタンプを保持し、次の送信でエコーする
#[derive(Debug, Clone, Default)]
pub struct TimestampEcho {
    /// (相手のタイムスタンプ, 受信時刻 ms)
    saved: Option<(Timestamp16, u64)>,
}

impl TimestampEcho {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最新のデータグラムのタイムスタンプを記録する
    pub fn on_remote_timestamp(&mut self, timestamp: Timestamp16, now_ms: u64) {
        if timestamp.is_some() {
            self.saved = Some((timestamp, now_ms));
        }
    }

    /// 送信するデータグラムに載せる `timestamp_reply` を返す
    ///
    /// 受信から `ECHO_WINDOW_MS` 以内なら、保持していた時間を足した値を返す。
    /// 一度エコーした値は消費される。
    pub fn reply(&mut self, now_ms: u64) -> Timestamp16 {
        match self.saved.take() {
            Some((ts, received_at)) if now_ms.saturating_sub(received_at) < ECHO_WINDOW_MS => {
                let held = (now_ms - received_at) as u16;
                let echoed = ts.0.wrapping_add(held);
                if echoed == u16::MAX {
                    Timestamp16(0)
                } else {
                    Timestamp16(echoed)
                }
            }
            _ => Timestamp16::NONE,
        }
    }

    /// エコー待ちのタイムスタンプがあるか
    pub fn has_pending(&self) -> bool {
        self.saved.is_some()
    }
}
