//! # moshwire-transport
//!
//! Instruction の Fragment 分割/再組み立てと、RTT 計測用の 16 ビットタイムスタンプ。
//!
//! ## Fragment の Wire Format
//!
//! ```text
//! [instruction_id: u64 BE][fragment_num_with_final: u16 BE][chunk...]
//!
//! fragment_num_with_final:
//!   bit 15 (MSB) = is_final フラグ（最後の Fragment なら 1）
//!   bit 0..14    = fragment_num（0 始まり）
//! ```
//!
//! chunk を順に連結したものが zlib 圧縮済みの Instruction になる。
//! Fragment 自体は暗号化前のデータグラムのペイロードとして運ばれる。

#![no_std]
extern crate alloc;

pub mod error;
pub mod fragment;
pub mod timestamp;

pub use error::TransportError;
pub use fragment::{
    compress, decompress, encode_fragments, split_compressed, Fragment, FragmentAssembly,
    Fragmenter, MAX_DECOMPRESSED_LEN, MAX_FRAGMENTS,
};
pub use timestamp::{rtt_sample, Timestamp16, TimestampEcho, ECHO_WINDOW_MS, MAX_RTT_SAMPLE_MS};
