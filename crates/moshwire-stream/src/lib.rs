//! # moshwire-stream
//!
//! SSP で同期する追記専用のバイトストリーム。
//!
//! mosh 本来の用途は VT100 端末エミュレーションで、状態差分は「画面の変化」。
//! このクレートの `StreamState` は端末エミュレーションの代わりに、
//! キー入力や生の出力のような追記専用のバイト列を状態として扱う。
//!
//! ## バイトストリームの同期
//!
//! ```text
//! 送信:
//!   1. アプリケーション → stream.write(data)
//!   2. SSP が diff_since(相手の位置) で未達のバイト列を取り出す
//!   3. SSP → Fragment 分割 → 暗号化 → UDP
//!
//! 受信:
//!   1. UDP → 復号 → Fragment 再組み立て → SSP
//!   2. SSP → stream.apply(起点の位置, diff)（まだ渡していない部分だけ受信バッファへ）
//!   3. stream.read_available() → アプリケーション
//! ```
//!
//! 状態のスナップショットはストリーム上の位置（8 バイト big-endian）なので、
//! SSP の状態ウィンドウはストリームの長さに関係なく小さいまま保たれる。

#![no_std]
extern crate alloc;

pub mod stream;

pub use stream::{decode_position, encode_position, StreamState};
