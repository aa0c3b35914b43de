//! # moshwire-ssp
//!
//! SSP (State Synchronization Protocol) のコア状態機械。
//!
//! ## SSP の概要
//!
//! SSP は mosh のトランスポートプロトコル。TCP とは異なり、
//! 最新の状態の同期を保証する（中間の状態はスキップ可能）。
//!
//! ### キーコンセプト
//!
//! - **Instruction**: 送信の最小単位。old_num の状態から new_num の状態への差分を含む
//! - **ACK**: ack_num で「ここまでの状態を受け取った」ことを通知する
//! - **throwaway_num**: これより古い状態はもう差分の起点にならない（受信側の GC の合図）
//! - **想定受信状態**: 1 RTT 以上前に送った状態は相手に届いているとみなし、差分の起点にする
//! - **キープアライブ**: 3000ms ごとに ACK のみの Instruction を送って接続を維持する
//! - **RTT 推定**: 整数演算の Jacobson/Karels で Smoothed RTT と RTO を推定
//! - **シャットダウン**: new_num = `u64::MAX` の Instruction を最大 16 回送る
//!
//! 時刻はすべて呼び出し側が `now_ms`（ミリ秒）で注入する。

#![no_std]
extern crate alloc;

pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod state;

pub use receiver::Receiver;
pub use rtt::RttEstimator;
pub use sender::{Sender, SenderStats};
pub use state::StateSync;

pub use moshwire_proto::MOSH_PROTOCOL_VERSION;

/// 送信間隔の最小値（ミリ秒）
pub const SEND_INTERVAL_MIN_MS: u64 = 20;

/// 送信間隔の最大値（ミリ秒）
pub const SEND_INTERVAL_MAX_MS: u64 = 250;

/// 相手から新しい状態を受け取ってから ACK を返すまでの猶予（ミリ秒）
pub const ACK_DELAY_MS: u64 = 100;

/// キープアライブ間隔（ミリ秒）
/// mosh C++ 実装では 3000ms
pub const ACK_INTERVAL_MS: u64 = 3000;

/// これだけ ACK が届かなければ接続断とみなす（ミリ秒）
pub const ACTIVE_RETRY_TIMEOUT_MS: u64 = 10_000;

/// シャットダウン Instruction の最大送信回数
pub const SHUTDOWN_RETRIES: u32 = 16;

/// ACK 待ちの送信済み状態の上限
pub const MAX_PENDING_STATES: usize = 32;

/// 再送タイムアウト最小値（ミリ秒）
pub const RTO_MIN_MS: u64 = 50;

/// 再送タイムアウト最大値（ミリ秒）
pub const RTO_MAX_MS: u64 = 1000;

/// 初期 RTO（ミリ秒）
pub const RTO_INITIAL_MS: u64 = 1000;

/// シャットダウンを表す番兵の状態番号
pub const SHUTDOWN_STATE_NUM: u64 = u64::MAX;
