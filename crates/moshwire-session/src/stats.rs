//! セッション統計情報

use serde::Serialize;

use crate::error::SessionError;
use crate::Role;

/// データグラムの送受信カウンタ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub datagrams_discarded: u64,
    pub send_failures: u64,
    pub instructions_received: u64,
}

/// セッション統計
///
/// JSON 出力例:
/// ```json
/// {
///   "role": "client",
///   "srtt_ms": 45,
///   "rto_ms": 230,
///   "local_state_num": 42,
///   "known_receiver_state": 40,
///   "remote_state_num": 38,
///   "pending_states": 2,
///   "datagrams_sent": 120,
///   ...
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub role: Role,
    /// Smoothed RTT（ミリ秒）
    pub srtt_ms: u64,
    /// RTTVAR（ミリ秒）
    pub rttvar_ms: u64,
    /// RTO（ミリ秒）
    pub rto_ms: u64,
    /// 最後に割り当てたローカルの状態番号
    pub local_state_num: u64,
    /// 相手が受け取ったと確定しているローカルの状態番号
    pub known_receiver_state: u64,
    /// 相手から受け取った最新の状態番号
    pub remote_state_num: u64,
    /// ACK 待ちの送信済み状態の数
    pub pending_states: usize,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    /// 復号・展開・デコードに失敗して捨てたデータグラム
    pub datagrams_discarded: u64,
    pub send_failures: u64,
    pub instructions_received: u64,
}

impl SessionStats {
    /// JSON 文字列に変換する
    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string(self)?)
    }
}
