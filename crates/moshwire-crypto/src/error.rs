//! 暗号エラー型

use thiserror::Error;

/// 暗号操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// 鍵の長さが不正（16バイト以外）
    #[error("Invalid key length (expected 16 bytes, got {0})")]
    InvalidKeyLength(usize),
    /// Base64 デコードに失敗（22文字の unpadded base64 以外）
    #[error("Invalid Base64 key encoding")]
    InvalidBase64,
    /// シーケンス番号が 63 ビットに収まらない（呼び出し側のバグ）
    #[error("Sequence number {0:#x} does not fit in 63 bits")]
    InvalidSequence(u64),
    /// 送信シーケンス番号を使い切った（nonce 再利用になるため以降の送信は不可）
    #[error("Send sequence space exhausted")]
    SequenceExhausted,
    /// 暗号化に失敗
    #[error("Encryption failed")]
    EncryptionFailed,
    /// 復号に失敗（認証タグ検証失敗を含む）
    #[error("Decryption failed (authentication tag mismatch)")]
    DecryptionFailed,
    /// パケットが短すぎる
    #[error("Packet too short")]
    PacketTooShort,
    /// 自分と同じ送信方向のパケット（反射されたパケット）
    #[error("Packet travels in our own direction")]
    UnexpectedDirection,
}
