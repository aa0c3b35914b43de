//! SSP 受信側
//!
//! 受信した Instruction を状態ウィンドウに適用する。
//!
//! 状態ウィンドウは状態番号 → スナップショットの対応で、初期状態 (state 0) を
//! 最初から持つ。差分の起点 (old_num) がウィンドウにない Instruction は適用できない。
//! これは UDP の並べ替え・重複で普通に起こることなので、エラーにせず無視する。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use moshwire_proto::Instruction;

use crate::state::StateSync;
use crate::SHUTDOWN_STATE_NUM;

/// SSP 受信側の状態
pub struct Receiver {
    /// 状態ウィンドウ（状態番号 → スナップショット）
    window: BTreeMap<u64, Vec<u8>>,
    /// これまでに受け取った最大の状態番号（送り返す ack_num）
    latest_num: u64,
    /// 相手がシャットダウンを開始した
    peer_shutdown: bool,
}

impl Receiver {
    /// 初期状態（空のスナップショット）だけを持つ受信側を生成する
    pub fn new() -> Self {
        let mut window = BTreeMap::new();
        window.insert(0, Vec::new());
        Receiver {
            window,
            latest_num: 0,
            peer_shutdown: false,
        }
    }

    /// Instruction を処理し、受け取った最大の状態番号を返す
    ///
    /// 戻り値は次に送る Instruction の ack_num になる。
    ///
    /// 次の場合は何もせず、現在の最大番号をそのまま返す:
    /// - プロトコルバージョンが一致しない
    /// - old_num の状態をウィンドウに持っていない
    /// - `state.apply` が差分を拒否した
    ///
    /// new_num がすでにウィンドウにあれば再適用しない（GC だけ行う）。
    pub fn receive<S>(&mut self, instr: &Instruction, state: &mut S) -> u64
    where
        S: StateSync + ?Sized,
    {
        if !instr.is_compatible() {
            tracing::trace!(version = ?instr.protocol_version, "ignoring incompatible instruction");
            return self.latest_num;
        }

        let old_num = instr.old_num_or_zero();
        let new_num = instr.new_num_or_zero();
        let throwaway_num = instr.throwaway_num_or_zero();

        if new_num == SHUTDOWN_STATE_NUM {
            if !self.peer_shutdown {
                tracing::debug!("peer started shutdown");
                self.peer_shutdown = true;
            }
            self.latest_num = SHUTDOWN_STATE_NUM;
            return self.latest_num;
        }

        if self.window.contains_key(&new_num) {
            self.collect_garbage(throwaway_num);
            return self.latest_num;
        }

        let next = {
            let Some(base) = self.window.get(&old_num) else {
                tracing::trace!(old_num, new_num, "unknown base state, ignoring instruction");
                return self.latest_num;
            };
            state.apply(base, instr.diff_bytes())
        };
        let Some(next) = next else {
            tracing::trace!(old_num, new_num, "diff rejected by state");
            return self.latest_num;
        };

        if new_num > self.latest_num {
            self.latest_num = new_num;
            state.on_new_state(&next);
        }
        self.window.insert(new_num, next);
        self.collect_garbage(throwaway_num);

        self.latest_num
    }

    /// `throwaway_num` より小さい番号の状態を捨てる（最新の状態は残す）
    fn collect_garbage(&mut self, throwaway_num: u64) {
        let Some(&newest) = self.window.keys().next_back() else {
            return;
        };
        self.window.retain(|&num, _| num >= throwaway_num || num == newest);
    }

    /// 受け取った最大の状態番号
    pub fn latest_num(&self) -> u64 {
        self.latest_num
    }

    /// 最新の状態のスナップショット
    pub fn latest_state(&self) -> &[u8] {
        self.window.values().next_back().map(Vec::as_slice).unwrap_or_default()
    }

    /// 状態ウィンドウに `num` があるか
    pub fn contains(&self, num: u64) -> bool {
        self.window.contains_key(&num)
    }

    /// 状態ウィンドウ内の状態数
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// ウィンドウ内で最も古い状態番号
    pub fn oldest_num(&self) -> Option<u64> {
        self.window.keys().next().copied()
    }

    /// 相手がシャットダウンを開始したか
    pub fn peer_shutdown(&self) -> bool {
        self.peer_shutdown
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}
