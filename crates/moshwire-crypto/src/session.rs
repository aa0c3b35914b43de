//! 暗号セッション
//!
//! mosh の Connection が持つ送信シーケンス番号と受信シーケンス番号の管理。
//! nonce の再利用を防ぐのはこの型の責任。

use alloc::vec::Vec;

use crate::cipher::KEY_LEN;
use crate::datagram::{Datagram, DatagramCodec};
use crate::error::CryptoError;
use crate::nonce::MAX_SEQ;
use crate::{Direction, MoshKey};

/// 暗号セッション
///
/// 送信シーケンス番号を自動インクリメントし、Nonce の重複を防ぐ。
/// 送信方向はセッション生成時に固定される（クライアントなら `ToServer`）。
pub struct CryptoSession {
    codec: DatagramCodec,
    /// 送信方向
    direction: Direction,
    /// 次の送信シーケンス番号
    send_seq: u64,
    /// これまでに受信した最大シーケンス番号 + 1
    expected_recv_seq: u64,
}

/// `CryptoSession::decrypt_packet` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPacket {
    /// 復号されたデータグラム
    pub datagram: Datagram,
    /// これまでで最も新しいシーケンス番号か
    ///
    /// ローミング先アドレスとタイムスタンプの更新は最新のパケットでのみ行う。
    pub is_newest: bool,
}

impl CryptoSession {
    /// mosh-server が出力する Base64 鍵（22文字）からセッションを初期化する
    ///
    /// # エラー
    /// - `CryptoError::InvalidBase64`: Base64 デコード失敗
    /// - `CryptoError::InvalidKeyLength`: 鍵長が 16 バイト以外
    pub fn from_base64_key(key_b64: &str, direction: Direction) -> Result<Self, CryptoError> {
        let key = MoshKey::from_base64(key_b64)?;
        Ok(Self::from_key(*key.as_bytes(), direction))
    }

    /// 16 バイトの raw 鍵からセッションを初期化する
    pub fn from_key(key: [u8; KEY_LEN], direction: Direction) -> Self {
        CryptoSession {
            codec: DatagramCodec::new(&key),
            direction,
            send_seq: 0,
            expected_recv_seq: 0,
        }
    }

    /// Fragment を暗号化して UDP ペイロードを返す
    ///
    /// # 引数
    /// - `timestamp`: ローカルタイムスタンプ（16bit, ms の下位16ビット）
    /// - `timestamp_reply`: 相手から受け取ったタイムスタンプのエコー
    /// - `payload`: 暗号化するペイロード（Fragment バイト列）
    ///
    /// # エラー
    /// - `CryptoError::SequenceExhausted`: 63 ビットのシーケンス空間を使い切った
    pub fn encrypt_packet(
        &mut self,
        timestamp: u16,
        timestamp_reply: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if self.send_seq > MAX_SEQ {
            return Err(CryptoError::SequenceExhausted);
        }
        let seq = self.send_seq;
        let packet = self
            .codec
            .encode(self.direction, seq, timestamp, timestamp_reply, payload)?;
        // 暗号化に成功した場合のみ番号を消費する
        self.send_seq += 1;
        Ok(packet)
    }

    /// 受信した UDP ペイロードを復号する
    ///
    /// 自分の送信方向のパケット（反射）は受信シーケンス番号を更新せずに拒否する。
    ///
    /// # エラー
    /// - `CryptoError::PacketTooShort` / `CryptoError::DecryptionFailed`: 破棄すべきパケット
    /// - `CryptoError::UnexpectedDirection`: 方向が逆
    pub fn decrypt_packet(&mut self, packet: &[u8]) -> Result<OpenedPacket, CryptoError> {
        let datagram = self.codec.decode(packet)?;
        if datagram.direction == self.direction {
            return Err(CryptoError::UnexpectedDirection);
        }

        let is_newest = datagram.seq >= self.expected_recv_seq;
        if is_newest {
            self.expected_recv_seq = datagram.seq + 1;
        }

        Ok(OpenedPacket { datagram, is_newest })
    }

    /// 送信方向
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 次に使う送信シーケンス番号
    pub fn send_seq(&self) -> u64 {
        self.send_seq
    }

    /// 次に期待する受信シーケンス番号
    pub fn expected_recv_seq(&self) -> u64 {
        self.expected_recv_seq
    }

    #[cfg(test)]
    pub(crate) fn set_send_seq(&mut self, seq: u64) {
        self.send_seq = seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (CryptoSession, CryptoSession) {
        (
            CryptoSession::from_key([0u8; 16], Direction::ToServer),
            CryptoSession::from_key([0u8; 16], Direction::ToClient),
        )
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (mut client, mut server) = pair();
        let packet = client.encrypt_packet(1000, 0, b"Hello, mosh!").unwrap();

        let opened = server.decrypt_packet(&packet).unwrap();
        assert!(opened.is_newest);
        assert_eq!(opened.datagram.payload, b"Hello, mosh!");
        assert_eq!(opened.datagram.direction, Direction::ToServer);
        assert_eq!(opened.datagram.timestamp, 1000);
    }

    #[test]
    fn test_seq_increments() {
        let (mut client, _) = pair();
        assert_eq!(client.send_seq(), 0);
        client.encrypt_packet(0, 0, b"").unwrap();
        assert_eq!(client.send_seq(), 1);
        client.encrypt_packet(0, 0, b"").unwrap();
        assert_eq!(client.send_seq(), 2);
    }

    #[test]
    fn test_same_plaintext_never_repeats_on_wire() {
        let (mut client, _) = pair();
        let a = client.encrypt_packet(0, 0, b"same").unwrap();
        let b = client.encrypt_packet(0, 0, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_reordered_packet_is_not_newest() {
        let (mut client, mut server) = pair();
        let first = client.encrypt_packet(0, 0, b"1").unwrap();
        let second = client.encrypt_packet(0, 0, b"2").unwrap();

        assert!(server.decrypt_packet(&second).unwrap().is_newest);
        let late = server.decrypt_packet(&first).unwrap();
        assert!(!late.is_newest);
        assert_eq!(server.expected_recv_seq(), 2);
    }

    #[test]
    fn test_reflected_packet_rejected() {
        let (mut client, _) = pair();
        let own = client.encrypt_packet(0, 0, b"echo").unwrap();
        assert_eq!(client.decrypt_packet(&own), Err(CryptoError::UnexpectedDirection));
        assert_eq!(client.expected_recv_seq(), 0);
    }

    #[test]
    fn test_sequence_exhaustion() {
        let (mut client, _) = pair();
        client.set_send_seq(MAX_SEQ);
        assert!(client.encrypt_packet(0, 0, b"").is_ok());
        assert_eq!(
            client.encrypt_packet(0, 0, b""),
            Err(CryptoError::SequenceExhausted)
        );
    }

    #[test]
    fn test_from_base64_key() {
        let session = CryptoSession::from_base64_key("AAAAAAAAAAAAAAAAAAAAAA", Direction::ToServer);
        assert!(session.is_ok());
        assert!(CryptoSession::from_base64_key("short", Direction::ToServer).is_err());
    }
}
