//! moshwire-transport エラー型

use thiserror::Error;

/// トランスポート層のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// パケット/フラグメントが短すぎる
    #[error("Packet or fragment too short")]
    TooShort,
    /// MTU が Fragment ヘッダーすら収まらない
    #[error("MTU of {0} bytes cannot hold a fragment header")]
    MtuTooSmall(usize),
    /// 1 つの Instruction に必要な Fragment 数がプロトコル上限を超える
    #[error("Instruction needs {0} fragments (protocol limit is 32768)")]
    TooManyFragments(usize),
    /// 再組み立て後の zlib 展開に失敗
    #[error("Fragment payload failed to decompress")]
    DecompressFailed,
}
