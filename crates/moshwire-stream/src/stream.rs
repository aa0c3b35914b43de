//! バイトストリームの状態

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use moshwire_ssp::StateSync;

/// ストリーム上の位置をスナップショットに変換する（位置 0 は空 = 初期状態）
pub fn encode_position(pos: u64) -> Vec<u8> {
    if pos == 0 {
        Vec::new()
    } else {
        pos.to_be_bytes().to_vec()
    }
}

/// スナップショットからストリーム上の位置を取り出す
pub fn decode_position(snapshot: &[u8]) -> Option<u64> {
    match snapshot.len() {
        0 => Some(0),
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(snapshot);
            Some(u64::from_be_bytes(bytes))
        }
        _ => None,
    }
}

/// 追記専用バイトストリーム
///
/// ## 責任
/// - アプリケーションからの送信データを、相手の ACK まで保持する
/// - SSP から受け取った差分のうち、まだ渡していない部分を受信バッファに積む
///
/// 送信方向と受信方向は独立している。1 つのセッションで両方向に使える。
pub struct StreamState {
    /// ACK されていない送信データ
    outgoing: Vec<u8>,
    /// `outgoing[0]` のストリーム上の位置（ここまでは相手に届いている）
    outgoing_base: u64,
    /// 受信側で上位に渡した位置
    delivered: u64,
    /// 受信バッファ（上位レイヤーへ渡すデータ）
    inbox: VecDeque<u8>,
    total_written: u64,
    total_received: u64,
}

impl StreamState {
    /// 空のストリームを生成する
    pub fn new() -> Self {
        StreamState {
            outgoing: Vec::new(),
            outgoing_base: 0,
            delivered: 0,
            inbox: VecDeque::new(),
            total_written: 0,
            total_received: 0,
        }
    }

    /// 送信データを追記する
    pub fn write(&mut self, data: &[u8]) {
        self.outgoing.extend_from_slice(data);
        self.total_written += data.len() as u64;
    }

    /// 受信済みのデータをすべて取り出す
    pub fn read_available(&mut self) -> Vec<u8> {
        self.inbox.drain(..).collect()
    }

    /// 未読データがあるか
    pub fn has_pending_read(&self) -> bool {
        !self.inbox.is_empty()
    }

    /// 送信側の現在位置（書き込んだ総バイト数）
    pub fn write_position(&self) -> u64 {
        self.outgoing_base + self.outgoing.len() as u64
    }

    /// 受信側で上位に渡した位置
    pub fn delivered_position(&self) -> u64 {
        self.delivered
    }

    /// 相手の ACK を待っている送信データのバイト数
    pub fn unacked_len(&self) -> usize {
        self.outgoing.len()
    }

    /// 書き込んだ総バイト数（統計用）
    pub fn total_written_bytes(&self) -> u64 {
        self.total_written
    }

    /// 受信した総バイト数（統計用）
    pub fn total_received_bytes(&self) -> u64 {
        self.total_received
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSync for StreamState {
    fn apply(&mut self, base: &[u8], diff: &[u8]) -> Option<Vec<u8>> {
        let start = decode_position(base)?;
        // 起点は必ず自分が作った状態なので、渡し済みの位置を超えることはない
        if start > self.delivered {
            return None;
        }
        let end = start + diff.len() as u64;

        let already = (self.delivered - start) as usize;
        if already < diff.len() {
            let fresh = &diff[already..];
            self.inbox.extend(fresh.iter().copied());
            self.total_received += fresh.len() as u64;
            self.delivered = end;
        }

        Some(encode_position(end))
    }

    fn current_state(&self) -> Option<Vec<u8>> {
        Some(encode_position(self.write_position()))
    }

    fn diff_since(&self, known: &[u8]) -> Vec<u8> {
        let known_pos = decode_position(known).unwrap_or(self.outgoing_base);
        let start = known_pos.saturating_sub(self.outgoing_base) as usize;
        self.outgoing.get(start..).map(<[u8]>::to_vec).unwrap_or_default()
    }

    fn on_acked(&mut self, state: &[u8]) {
        let Some(acked) = decode_position(state) else {
            return;
        };
        if acked <= self.outgoing_base {
            return;
        }
        let released = ((acked - self.outgoing_base) as usize).min(self.outgoing.len());
        self.outgoing.drain(..released);
        self.outgoing_base += released as u64;
    }
}
