//! 同期対象の状態（アプリケーション層）とのインターフェース

use alloc::vec::Vec;

/// SSP が同期する状態の実装者
///
/// 状態はスナップショット（バイト列）で識別される。スナップショットの中身は
/// SSP からは不透明で、空のバイト列は両端で共有される初期状態（state 0）を表す。
pub trait StateSync {
    /// `base` のスナップショットに `diff` を適用し、新しいスナップショットを返す
    ///
    /// 適用できない差分（壊れている、`base` と矛盾する）は `None` を返す。
    /// その Instruction は破棄される。
    fn apply(&mut self, base: &[u8], diff: &[u8]) -> Option<Vec<u8>>;

    /// 送信側の現在の状態のスナップショット（報告すべき状態がなければ `None`）
    fn current_state(&self) -> Option<Vec<u8>>;

    /// 相手が `known` の状態を持っているとして、現在の状態までの差分を返す
    fn diff_since(&self, known: &[u8]) -> Vec<u8>;

    /// 受信側で最新の状態が進んだ
    fn on_new_state(&mut self, _state: &[u8]) {}

    /// 相手が `state` まで受け取ったことが確定した（それより前の送信履歴は不要）
    fn on_acked(&mut self, _state: &[u8]) {}
}
