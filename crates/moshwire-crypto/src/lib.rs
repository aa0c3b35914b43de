//! # moshwire-crypto
//!
//! mosh SSP データグラムの AES-128-OCB3 暗号化と nonce 管理。
//! `no_std` + `alloc` 環境で動作する。
//!
//! ## mosh の暗号化仕様
//!
//! ```text
//! UDP ペイロード構造:
//!   [nonce: 8bytes][ciphertext + auth_tag(16): variable]
//!
//! Nonce（ワイヤ上 8 バイト、OCB には 12 バイトで渡す）:
//!   OCB nonce bytes[0..4]  = 0x00000000 (ゼロパディング、送信時省略)
//!   OCB nonce bytes[4..12] = direction_seq as u64, big-endian
//!
//! direction_seq:
//!   MSB (bit 63) = direction (TO_SERVER=0, TO_CLIENT=1)
//!   bit 0..62    = seq
//!
//! 平文（暗号化前）:
//!   [timestamp: u16 BE][timestamp_reply: u16 BE][fragment...]
//! ```

#![no_std]
extern crate alloc;

mod cipher;
mod datagram;
mod error;
mod nonce;
mod session;

pub use cipher::{SspCipher, KEY_LEN, TAG_LEN};
pub use datagram::{
    Datagram, DatagramCodec, DATAGRAM_OVERHEAD, MIN_PACKET_LEN, TIMESTAMP_HEADER_LEN,
};
pub use error::CryptoError;
pub use nonce::{MoshNonce, MAX_SEQ, NONCE_LEN};
pub use session::{CryptoSession, OpenedPacket};

/// mosh パケットの方向（TO_SERVER or TO_CLIENT）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// クライアント → サーバー (bit 63 = 0)
    ToServer = 0,
    /// サーバー → クライアント (bit 63 = 1)
    ToClient = 1,
}

impl Direction {
    /// seq の MSB から方向を判定する
    pub fn from_seq(direction_seq: u64) -> Self {
        if direction_seq >> 63 == 0 {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    /// direction を seq の MSB に適用する
    pub fn apply_to_seq(&self, seq: u64) -> u64 {
        match self {
            Direction::ToServer => seq & !(1u64 << 63),
            Direction::ToClient => seq | (1u64 << 63),
        }
    }

    /// 逆方向
    pub fn reverse(&self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

/// mosh のセッション鍵（AES-128、16バイト）
///
/// ログや永続化はしないこと。Debug 出力でも鍵は表示しない。
#[derive(Clone, PartialEq, Eq)]
pub struct MoshKey([u8; KEY_LEN]);

impl MoshKey {
    /// Base64 文字列の長さ（16 バイト = パディングなし 22 文字）
    pub const BASE64_LEN: usize = 22;

    /// mosh-server が出力する 22 文字の Base64 鍵をデコードする
    ///
    /// mosh は標準アルファベット（`+` `/`）のパディングなし形式を使う。
    /// 前後の空白は無視する。
    pub fn from_base64(key_b64: &str) -> Result<Self, CryptoError> {
        use base64::Engine as _;

        let normalized = key_b64.trim();
        if normalized.len() != Self::BASE64_LEN {
            return Err(CryptoError::InvalidBase64);
        }
        let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(normalized)
            .map_err(|_| CryptoError::InvalidBase64)?;

        Self::from_slice(&bytes)
    }

    /// raw 鍵バイト列から生成する（長さは 16 バイト固定）
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(MoshKey(key))
    }

    /// 鍵バイト列への参照
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for MoshKey {
    fn from(key: [u8; KEY_LEN]) -> Self {
        MoshKey(key)
    }
}

impl core::fmt::Debug for MoshKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("MoshKey(<redacted>)")
    }
}

/// Base64 文字列（22文字）を 16 バイトのキーにデコードする
///
/// mosh-server が出力するキーフォーマット: `4NeCCgvZFe2RnPgrcU1PQw`（22文字）
pub fn decode_base64_key(key_b64: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    MoshKey::from_base64(key_b64).map(|key| *key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_seq() {
        assert_eq!(Direction::from_seq(0x0000000000000001u64), Direction::ToServer);
        assert_eq!(Direction::from_seq(0x8000000000000001u64), Direction::ToClient);
    }

    #[test]
    fn test_direction_apply_to_seq() {
        let seq: u64 = 42;
        assert_eq!(Direction::ToServer.apply_to_seq(seq) >> 63, 0);
        assert_eq!(Direction::ToClient.apply_to_seq(seq) >> 63, 1);
        assert_eq!(Direction::ToClient.reverse(), Direction::ToServer);
    }

    #[test]
    fn test_decode_base64_key_valid() {
        let key = decode_base64_key("AAAAAAAAAAAAAAAAAAAAAA").unwrap(); // 16 zero bytes
        assert_eq!(key, [0u8; 16]);

        // 標準アルファベット（+ と /）を含む鍵
        let key = decode_base64_key("+/+/+/+/+/+/+/+/+/+/+w").unwrap();
        assert_eq!(key[0], 0xFB);
    }

    #[test]
    fn test_decode_base64_key_trims_whitespace() {
        assert!(decode_base64_key("  AAAAAAAAAAAAAAAAAAAAAA\n").is_ok());
    }

    #[test]
    fn test_decode_base64_key_invalid_length() {
        assert_eq!(decode_base64_key("AAAAAAAAAAAAAA"), Err(CryptoError::InvalidBase64));
        assert_eq!(
            decode_base64_key("AAAAAAAAAAAAAAAAAAAAAAA"),
            Err(CryptoError::InvalidBase64)
        );
    }

    #[test]
    fn test_key_from_slice() {
        assert!(MoshKey::from_slice(&[1u8; 16]).is_ok());
        assert_eq!(
            MoshKey::from_slice(&[1u8; 15]),
            Err(CryptoError::InvalidKeyLength(15))
        );
        assert_eq!(
            MoshKey::from_slice(&[1u8; 17]),
            Err(CryptoError::InvalidKeyLength(17))
        );
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = MoshKey::from([0xAB; 16]);
        assert_eq!(alloc::format!("{:?}", key), "MoshKey(<redacted>)");
    }
}
