//! SSP 送信側
//!
//! mosh の TransportSender 相当。送信する Instruction の組み立て（差分の起点の選択）、
//! 送信タイミングの決定、相手の ACK の追跡を担当する。
//!
//! Instruction を生成したら、呼び出し側はそれを必ず送信すること。
//! 送信時刻や ACK タイマーは生成時点で更新される。

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use moshwire_proto::Instruction;

use crate::rtt::RttEstimator;
use crate::{
    ACK_DELAY_MS, ACK_INTERVAL_MS, ACTIVE_RETRY_TIMEOUT_MS, MAX_PENDING_STATES, SHUTDOWN_RETRIES,
    SHUTDOWN_STATE_NUM,
};

/// ACK 前の送信済み状態
#[derive(Debug, Clone)]
struct SentState {
    /// 状態番号
    num: u64,
    /// 最後に送信した時刻（ミリ秒）
    sent_at_ms: u64,
    /// この番号が表す状態のスナップショット（後続の差分の起点になる）
    state: Vec<u8>,
}

/// SSP 送信側の状態
pub struct Sender {
    /// 次に割り当てる状態番号（1 始まり）
    next_num: u64,
    /// ACK 待ちの送信済み状態（番号の昇順）
    sent: VecDeque<SentState>,
    /// 相手が受け取ったと確定している状態
    known_num: u64,
    known_state: Vec<u8>,
    /// こちらの受信側が持つ最新の状態番号（送信する ack_num）
    ack_num: u64,
    /// 最後に送信した Instruction の ack_num
    last_sent_ack: Option<u64>,
    rtt: RttEstimator,
    /// 最後に送信した時刻（ミリ秒）
    last_send_ms: Option<u64>,
    /// 最後に相手の Instruction を受け取った時刻（ミリ秒）
    last_ack_seen_ms: u64,
    /// ACK を返すべき期限
    ack_due_ms: Option<u64>,
    /// 未送信のローカル変更がある
    dirty: bool,
    shutdown_in_progress: bool,
    shutdown_tries: u32,
}

/// 送信側の統計情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderStats {
    /// 次に割り当てる状態番号
    pub next_state_num: u64,
    /// 相手が受け取ったと確定している状態番号
    pub known_receiver_state: u64,
    /// ACK 待ちの送信済み状態の数
    pub pending_states: usize,
    /// Smoothed RTT（ミリ秒）
    pub srtt_ms: u64,
    /// RTTVAR（ミリ秒）
    pub rttvar_ms: u64,
    /// RTO（ミリ秒）
    pub rto_ms: u64,
    /// シャットダウン Instruction の送信回数
    pub shutdown_tries: u32,
}

impl Sender {
    /// 新しい送信側を生成する
    ///
    /// 相手は初期状態（state 0、空のスナップショット）を持っているものとする。
    /// `now_ms` は接続タイムアウトの起点になる。
    pub fn new(now_ms: u64) -> Self {
        Sender {
            next_num: 1,
            sent: VecDeque::new(),
            known_num: 0,
            known_state: Vec::new(),
            ack_num: 0,
            last_sent_ack: None,
            rtt: RttEstimator::new(),
            last_send_ms: None,
            last_ack_seen_ms: now_ms,
            ack_due_ms: None,
            dirty: false,
            shutdown_in_progress: false,
            shutdown_tries: 0,
        }
    }

    /// 相手から受け取った ack_num を反映する
    ///
    /// 確定状態が進んだら ACK 済みの送信記録を解放して `true` を返す。
    /// 送信記録が残っていない番号への ACK では確定状態は進まない。
    /// いずれの場合も「最後に ACK を見た時刻」は更新する。
    pub fn record_peer_ack(&mut self, ack_num: u64, now_ms: u64) -> bool {
        self.last_ack_seen_ms = self.last_ack_seen_ms.max(now_ms);

        if ack_num <= self.known_num {
            return false;
        }
        let Some(pos) = self.sent.iter().position(|s| s.num == ack_num) else {
            tracing::trace!(ack_num, "ack for a state that is no longer tracked");
            return false;
        };

        let Some(acked) = self.sent.drain(..=pos).last() else {
            return false;
        };
        self.known_num = acked.num;
        self.known_state = acked.state;
        if self.known_num == SHUTDOWN_STATE_NUM {
            tracing::debug!("shutdown acknowledged by peer");
        }
        true
    }

    /// 相手が持っていると想定できる最新の状態番号
    ///
    /// `rtt_ms` 以上前に送った状態のうち最も新しいもの。確定状態より下にはならない。
    pub fn assumed_receiver_state(&self, now_ms: u64, rtt_ms: u64) -> u64 {
        self.sent
            .iter()
            .rev()
            .find(|s| now_ms.saturating_sub(s.sent_at_ms) >= rtt_ms)
            .map_or(self.known_num, |s| s.num)
            .max(self.known_num)
    }

    /// `current_state` を送るときの差分の起点 (状態番号, スナップショット)
    pub fn diff_base(&self, now_ms: u64, current_state: &[u8]) -> (u64, &[u8]) {
        let new_num = self.num_for(current_state);
        self.select_base(now_ms, new_num)
    }

    /// 送信する状態 `new_num` に対する差分の起点を選ぶ
    ///
    /// 候補は `new_num` より小さい番号だけなので、起点は常に `new_num - 1` 以下になる。
    fn select_base(&self, now_ms: u64, new_num: u64) -> (u64, &[u8]) {
        let known = (self.known_num, self.known_state.as_slice());

        if self.sent.len() >= MAX_PENDING_STATES {
            return known;
        }

        let candidates = || self.sent.iter().filter(move |s| s.num < new_num);

        // RTO を過ぎても ACK のない状態があれば、途中の状態は失われたとみなす
        let lost_after = self.rtt.rto() + ACK_DELAY_MS;
        if candidates().any(|s| now_ms.saturating_sub(s.sent_at_ms) >= lost_after) {
            return known;
        }

        let rtt = self.rtt.rtt_estimate();
        candidates()
            .filter(|s| now_ms.saturating_sub(s.sent_at_ms) >= rtt)
            .last()
            .map_or(known, |s| (s.num, s.state.as_slice()))
    }

    /// `current_state` に割り当てる状態番号（直前と同じ状態なら再送として同じ番号）
    fn num_for(&self, current_state: &[u8]) -> u64 {
        match self.sent.back() {
            Some(last) if last.state == current_state && last.num != SHUTDOWN_STATE_NUM => last.num,
            _ => self.next_num,
        }
    }

    /// 次に送る Instruction を組み立てる
    ///
    /// # 引数
    /// - `current_state`: 現在の状態のスナップショット
    /// - `diff_since`: 起点のスナップショットから現在の状態までの差分を返す関数
    ///
    /// # 戻り値
    /// シャットダウン中は番兵の Instruction。報告する状態がなければ `None`。
    pub fn next_instruction<F>(
        &mut self,
        now_ms: u64,
        current_state: Option<&[u8]>,
        diff_since: F,
    ) -> Option<Instruction>
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        if self.shutdown_in_progress {
            return Some(self.shutdown_instruction(now_ms));
        }
        let current = current_state?;

        let new_num = self.num_for(current);
        let (old_num, diff) = {
            let (base_num, base_state) = self.select_base(now_ms, new_num);
            (base_num, diff_since(base_state))
        };

        if new_num == self.next_num {
            self.sent.push_back(SentState {
                num: new_num,
                sent_at_ms: now_ms,
                state: current.to_vec(),
            });
            self.next_num += 1;
            while self.sent.len() > MAX_PENDING_STATES {
                self.sent.pop_front();
            }
        } else if let Some(last) = self.sent.back_mut() {
            last.sent_at_ms = now_ms;
        }

        self.mark_sent(now_ms);
        Some(Instruction::new_send(old_num, new_num, self.ack_num, self.known_num, diff))
    }

    /// ACK のみの Instruction（old_num = new_num = 確定状態、送信記録は作らない）
    pub fn heartbeat_instruction(&mut self, now_ms: u64) -> Instruction {
        self.mark_sent(now_ms);
        Instruction::new_heartbeat(self.known_num, self.ack_num, self.known_num)
    }

    fn shutdown_instruction(&mut self, now_ms: u64) -> Instruction {
        self.shutdown_tries += 1;

        match self.sent.back_mut() {
            Some(last) if last.num == SHUTDOWN_STATE_NUM => last.sent_at_ms = now_ms,
            _ => self.sent.push_back(SentState {
                num: SHUTDOWN_STATE_NUM,
                sent_at_ms: now_ms,
                state: self.known_state.clone(),
            }),
        }

        self.mark_sent(now_ms);
        Instruction::new_send(
            self.known_num,
            SHUTDOWN_STATE_NUM,
            self.ack_num,
            self.known_num,
            vec![],
        )
    }

    fn mark_sent(&mut self, now_ms: u64) {
        self.last_send_ms = Some(now_ms);
        self.ack_due_ms = None;
        self.dirty = false;
        self.last_sent_ack = Some(self.ack_num);
    }

    /// `current_state` を相手がまだ受け取っていないか（データを送るべきか）
    pub fn needs_data(&self, current_state: &[u8]) -> bool {
        current_state != self.known_state.as_slice()
    }

    /// ローカルの状態が変わった
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// 相手から新しい状態を受け取った（ACK_DELAY 以内に ACK を返す）
    pub fn remote_heard(&mut self, now_ms: u64) {
        let due = now_ms + ACK_DELAY_MS;
        self.ack_due_ms = Some(self.ack_due_ms.map_or(due, |d| d.min(due)));
    }

    /// 送信する ack_num（こちらの受信側が持つ最新の状態番号）を設定する
    pub fn set_ack_num(&mut self, ack_num: u64) {
        self.ack_num = ack_num;
    }

    pub fn ack_num(&self) -> u64 {
        self.ack_num
    }

    /// RTT サンプルを反映する
    pub fn observe_rtt(&mut self, sample_ms: u64) {
        self.rtt.observe(sample_ms);
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// 次に送信すべき時刻までの待ち時間（ミリ秒、0 = 今すぐ送る）
    pub fn wait_time(&self, now_ms: u64) -> u64 {
        let Some(last_send) = self.last_send_ms else {
            return 0;
        };
        let interval = self.rtt.send_interval();

        let mut next = last_send + ACK_INTERVAL_MS;
        if let Some(due) = self.ack_due_ms {
            next = next.min(due);
        }
        if self.dirty {
            next = next.min(last_send + interval);
        }
        if let Some(last) = self.sent.back() {
            next = next.min(last.sent_at_ms + self.rtt.rto());
        }
        if self.shutdown_in_progress && !self.shutdown_acknowledged() {
            next = next.min(last_send + interval);
        }
        // 相手のシャットダウンにはすぐ ACK を返す
        if self.ack_num == SHUTDOWN_STATE_NUM && self.last_sent_ack != Some(SHUTDOWN_STATE_NUM) {
            next = next.min(last_send + interval);
        }

        next.saturating_sub(now_ms)
    }

    /// シャットダウンを開始する（以降の Instruction はすべて番兵になる）
    pub fn start_shutdown(&mut self) {
        if !self.shutdown_in_progress {
            tracing::debug!("starting shutdown");
            self.shutdown_in_progress = true;
        }
    }

    pub fn shutdown_in_progress(&self) -> bool {
        self.shutdown_in_progress
    }

    /// 相手がシャットダウンの番兵を ACK した
    pub fn shutdown_acknowledged(&self) -> bool {
        self.known_num == SHUTDOWN_STATE_NUM
    }

    /// シャットダウンの送信回数が上限に達した
    pub fn shutdown_timed_out(&self) -> bool {
        self.shutdown_tries >= SHUTDOWN_RETRIES
    }

    /// 相手のシャットダウンへの ACK を送信済みか
    pub fn counterparty_shutdown_ack_sent(&self) -> bool {
        self.last_sent_ack == Some(SHUTDOWN_STATE_NUM)
    }

    /// ACK が `ACTIVE_RETRY_TIMEOUT_MS` より長く届いていない
    pub fn connection_timed_out(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_ack_seen_ms) > ACTIVE_RETRY_TIMEOUT_MS
    }

    /// 相手が受け取ったと確定している状態 (状態番号, スナップショット)
    pub fn known_state(&self) -> (u64, &[u8]) {
        (self.known_num, &self.known_state)
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            next_state_num: self.next_num,
            known_receiver_state: self.known_num,
            pending_states: self.sent.len(),
            srtt_ms: self.rtt.srtt(),
            rttvar_ms: self.rtt.rttvar(),
            rto_ms: self.rtt.rto(),
            shutdown_tries: self.shutdown_tries,
        }
    }
}
