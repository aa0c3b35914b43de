//! SSP データグラムの暗号化/復号
//!
//! ## UDP ペイロード構造
//! ```text
//! [nonce: 8bytes][ciphertext: variable][auth_tag: 16bytes]
//! ```
//!
//! ## 平文構造（暗号化前）
//! ```text
//! [timestamp: u16 BE][timestamp_reply: u16 BE][fragment...]
//! ```

use alloc::vec::Vec;

use crate::cipher::{SspCipher, KEY_LEN, TAG_LEN};
use crate::error::CryptoError;
use crate::nonce::{MoshNonce, NONCE_LEN};
use crate::Direction;

/// 平文ヘッダー長（timestamp + timestamp_reply）
pub const TIMESTAMP_HEADER_LEN: usize = 4;

/// 復号を試みる前に要求する最小パケット長
pub const MIN_PACKET_LEN: usize = NONCE_LEN + TIMESTAMP_HEADER_LEN + TAG_LEN;

/// 1 データグラムあたりの暗号オーバーヘッド（nonce + タグ + タイムスタンプ）
pub const DATAGRAM_OVERHEAD: usize = MIN_PACKET_LEN;

/// 復号されたデータグラムの内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// シーケンス番号（direction ビット除く）
    pub seq: u64,
    /// パケットの方向
    pub direction: Direction,
    /// 送信側のタイムスタンプ（16bit ms）
    pub timestamp: u16,
    /// 送信側がエコーした、こちらのタイムスタンプ
    pub timestamp_reply: u16,
    /// 復号されたペイロード（Fragment バイト列）
    pub payload: Vec<u8>,
}

/// データグラムのエンコーダ/デコーダ
///
/// (direction, seq) の一意性は呼び出し側の責任。同じ組を二度使うと機密性が失われる。
pub struct DatagramCodec {
    cipher: SspCipher,
}

impl DatagramCodec {
    /// 16 バイトの raw 鍵から初期化する
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        DatagramCodec {
            cipher: SspCipher::new(key),
        }
    }

    /// データグラムを組み立てて暗号化し、UDP ペイロードを返す
    ///
    /// # エラー
    /// - `CryptoError::InvalidSequence`: `seq` が 63 ビットを超える
    pub fn encode(
        &self,
        direction: Direction,
        seq: u64,
        timestamp: u16,
        timestamp_reply: u16,
        fragment: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = MoshNonce::new(direction, seq)?;

        let mut plaintext = Vec::with_capacity(TIMESTAMP_HEADER_LEN + fragment.len());
        plaintext.extend_from_slice(&timestamp.to_be_bytes());
        plaintext.extend_from_slice(&timestamp_reply.to_be_bytes());
        plaintext.extend_from_slice(fragment);

        let ciphertext = self.cipher.encrypt(&nonce, &plaintext)?;

        // UDP ペイロードの組み立て: nonce 8バイト + 暗号文
        let mut packet = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packet.extend_from_slice(nonce.wire_bytes());
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// 受信した UDP ペイロードを復号する
    ///
    /// # エラー
    /// - `CryptoError::PacketTooShort`: 復号前に長さ不足で拒否
    /// - `CryptoError::DecryptionFailed`: 認証タグ検証失敗
    pub fn decode(&self, packet: &[u8]) -> Result<Datagram, CryptoError> {
        if packet.len() < MIN_PACKET_LEN {
            return Err(CryptoError::PacketTooShort);
        }

        let nonce = MoshNonce::from_udp_payload_prefix(packet).ok_or(CryptoError::PacketTooShort)?;
        let plaintext = self.cipher.decrypt(&nonce, &packet[NONCE_LEN..])?;

        // 認証済みでもヘッダーが欠けていれば破棄する
        if plaintext.len() < TIMESTAMP_HEADER_LEN {
            return Err(CryptoError::PacketTooShort);
        }

        Ok(Datagram {
            seq: nonce.seq(),
            direction: nonce.direction(),
            timestamp: u16::from_be_bytes([plaintext[0], plaintext[1]]),
            timestamp_reply: u16::from_be_bytes([plaintext[2], plaintext[3]]),
            payload: plaintext[TIMESTAMP_HEADER_LEN..].to_vec(),
        })
    }
}
