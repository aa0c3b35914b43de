//! moshwire-proto エラー型

use thiserror::Error;

/// Protobuf エンコード/デコードのエラー
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Protobuf デコード失敗
    #[error("Proto decode failed: {0}")]
    DecodeFailed(prost::DecodeError),
    /// protocol_version フィールドが存在しない
    #[error("Missing protocol version")]
    MissingProtocolVersion,
    /// プロトコルバージョン不一致（現在サポートするのはバージョン 2 のみ）
    #[error(
        "Invalid protocol version: {0} (expected {expected})",
        expected = crate::MOSH_PROTOCOL_VERSION
    )]
    InvalidProtocolVersion(u32),
}
