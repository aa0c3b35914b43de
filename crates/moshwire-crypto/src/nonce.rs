//! mosh Nonce 実装
//!
//! ## ワイヤ上の Nonce（8バイト）
//! ```text
//! bit 63       = direction (TO_SERVER=0, TO_CLIENT=1)
//! bit 0..62    = seq（63ビット）
//! big-endian で 8 バイト
//! ```
//!
//! ## AES-128-OCB3 に渡す Nonce（12バイト）
//! ```text
//! bytes[0..4]  = 0x00000000  (ゼロパディング)
//! bytes[4..12] = ワイヤ上の 8 バイト
//! ```
//!
//! UDP ペイロードには後半 8 バイト（bytes[4..12]）のみ平文で送信する
//! （先頭 4 バイトは常にゼロなので省略）

use crate::error::CryptoError;
use crate::Direction;

/// ワイヤ上の Nonce 長
pub const NONCE_LEN: usize = 8;

/// 63 ビットに収まる最大のシーケンス番号
pub const MAX_SEQ: u64 = (1u64 << 63) - 1;

/// mosh プロトコルの Nonce（12バイト、先頭4バイトはゼロ）
///
/// 方向ビットとシーケンス番号から構築され、AES-128-OCB3 の nonce として使用される。
/// 同じ鍵の下で (direction, seq) の組を再利用してはならない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoshNonce([u8; 12]);

impl MoshNonce {
    /// 方向とシーケンス番号から Nonce を構築する
    ///
    /// # エラー
    /// - `CryptoError::InvalidSequence`: `seq` が 63 ビットを超える
    ///
    /// # 例
    /// ```
    /// use moshwire_crypto::{Direction, MoshNonce};
    /// let nonce = MoshNonce::new(Direction::ToClient, 42).unwrap();
    /// assert_eq!(nonce.seq(), 42);
    /// assert_eq!(nonce.direction(), Direction::ToClient);
    /// ```
    pub fn new(direction: Direction, seq: u64) -> Result<Self, CryptoError> {
        if seq > MAX_SEQ {
            return Err(CryptoError::InvalidSequence(seq));
        }
        Ok(Self::from_direction_seq(direction.apply_to_seq(seq)))
    }

    /// direction ビット込みの u64 から Nonce を構築する
    fn from_direction_seq(direction_seq: u64) -> Self {
        let mut bytes = [0u8; 12];
        // bytes[0..4] はゼロのまま（ゼロパディング）
        bytes[4..12].copy_from_slice(&direction_seq.to_be_bytes());
        MoshNonce(bytes)
    }

    /// ワイヤ上の 8 バイトから Nonce を復元する
    ///
    /// 受信時は 8 バイトを受け取り、先頭 4 バイトをゼロ埋めして復元する。
    pub fn from_wire(tail: &[u8; NONCE_LEN]) -> Self {
        Self::from_direction_seq(u64::from_be_bytes(*tail))
    }

    /// 受信パケットの先頭 8 バイトから Nonce を復元する（スライス版）
    pub fn from_udp_payload_prefix(bytes: &[u8]) -> Option<Self> {
        let tail: &[u8; NONCE_LEN] = bytes.get(..NONCE_LEN)?.try_into().ok()?;
        Some(Self::from_wire(tail))
    }

    fn direction_seq(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[4..12]);
        u64::from_be_bytes(buf)
    }

    /// シーケンス番号（direction ビットを除いた 63 ビット）
    pub fn seq(&self) -> u64 {
        self.direction_seq() & MAX_SEQ
    }

    /// パケットの方向
    pub fn direction(&self) -> Direction {
        Direction::from_seq(self.direction_seq())
    }

    /// 12 バイトの nonce データへの参照を返す
    /// AES-OCB3 の nonce 引数として使用する
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// UDP ペイロードに埋め込む 8 バイト（nonce の後半）
    pub fn wire_bytes(&self) -> &[u8] {
        &self.0[4..12]
    }
}
