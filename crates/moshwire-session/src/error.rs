//! セッション層のエラー型

use std::io;

use moshwire_crypto::CryptoError;
use moshwire_transport::TransportError;
use thiserror::Error;

/// セッション操作のエラー
///
/// 受信したデータグラムの問題（復号失敗・破損など）はエラーにならず、
/// 破棄されて統計に数えられるだけ。ここに来るのはローカル側の問題。
#[derive(Debug, Error)]
pub enum SessionError {
    /// 鍵の不正、シーケンス番号の枯渇など
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// Instruction が Fragment の上限を超えるなど
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// ソケットの I/O エラー
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// 設定・統計の JSON 変換に失敗
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// チャンネルがクローズされた
    #[error("channel closed")]
    Closed,
}
