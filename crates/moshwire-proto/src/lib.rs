//! # moshwire-proto
//!
//! mosh SSP (State Synchronization Protocol) の Instruction メッセージと
//! エンコード/デコードユーティリティ。
//!
//! ## Instruction の役割
//!
//! SSP の Instruction は、以下の情報を一つのメッセージに格納する：
//! - `old_num` / `new_num`: 送信側の状態番号（差分の起点と終点）
//! - `ack_num`: 受信確認済みの状態番号
//! - `throwaway_num`: これより古い状態は破棄可能
//! - `diff`: 状態差分データ
//! - `chaff`: 平文長を隠すためのランダムなパディング（受信側は無視する）
//!
//! ## ワイヤ形式
//!
//! `TransportBuffers.Instruction`（proto2）と互換。すべてのフィールドは optional。
//!
//! ```text
//! message Instruction {
//!   optional uint32 protocol_version = 1;
//!   optional uint64 old_num = 2;
//!   optional uint64 new_num = 3;
//!   optional uint64 ack_num = 4;
//!   optional uint64 throwaway_num = 5;
//!   optional bytes diff = 6;
//!   optional bytes chaff = 7;
//! }
//! ```
//!
//! ## プロトコルバージョン
//!
//! mosh のプロトコルバージョンは 2 (MOSH_PROTOCOL_VERSION)。
//! バージョンが欠けている、または一致しない Instruction は破棄する。

#![no_std]
extern crate alloc;

use alloc::vec::Vec;

pub mod error;

pub use error::ProtoError;

/// mosh SSP プロトコルバージョン
pub const MOSH_PROTOCOL_VERSION: u32 = 2;

/// chaff の最大長（バイト）
pub const MAX_CHAFF_LEN: usize = 16;

pub mod transport_buffers {
    use alloc::vec::Vec;

    /// SSP Instruction（`TransportBuffers.Instruction` と互換）
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Instruction {
        #[prost(uint32, optional, tag = "1")]
        pub protocol_version: Option<u32>,
        #[prost(uint64, optional, tag = "2")]
        pub old_num: Option<u64>,
        #[prost(uint64, optional, tag = "3")]
        pub new_num: Option<u64>,
        #[prost(uint64, optional, tag = "4")]
        pub ack_num: Option<u64>,
        #[prost(uint64, optional, tag = "5")]
        pub throwaway_num: Option<u64>,
        #[prost(bytes = "vec", optional, tag = "6")]
        pub diff: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "7")]
        pub chaff: Option<Vec<u8>>,
    }
}

pub use transport_buffers::Instruction;

/// Instruction の構築・エンコード・デコードユーティリティ
impl Instruction {
    /// 送信用 Instruction を組み立てる
    ///
    /// # 引数
    /// - `old_num`: 前の状態番号（差分の起点。0 = 初期状態）
    /// - `new_num`: 新しい状態番号
    /// - `ack_num`: ACK する受信済み状態番号
    /// - `throwaway_num`: これより古い状態は破棄可能
    /// - `diff`: 差分データ（空なら diff フィールド自体を省略）
    pub fn new_send(
        old_num: u64,
        new_num: u64,
        ack_num: u64,
        throwaway_num: u64,
        diff: Vec<u8>,
    ) -> Self {
        Instruction {
            protocol_version: Some(MOSH_PROTOCOL_VERSION),
            old_num: Some(old_num),
            new_num: Some(new_num),
            ack_num: Some(ack_num),
            throwaway_num: Some(throwaway_num),
            diff: if diff.is_empty() { None } else { Some(diff) },
            chaff: None,
        }
    }

    /// ACK のみの Instruction（差分なし・ハートビート用）
    ///
    /// `old_num == new_num` なので受信側の状態は変化しない。
    pub fn new_heartbeat(state_num: u64, ack_num: u64, throwaway_num: u64) -> Self {
        Self::new_send(state_num, state_num, ack_num, throwaway_num, Vec::new())
    }

    /// chaff を付与する（空なら省略）
    pub fn with_chaff(mut self, chaff: Vec<u8>) -> Self {
        self.chaff = if chaff.is_empty() { None } else { Some(chaff) };
        self
    }

    /// バイト列から Instruction をデコードする
    ///
    /// # エラー
    /// - `ProtoError::DecodeFailed`: protobuf デコード失敗
    /// - `ProtoError::MissingProtocolVersion`: バージョンなし
    /// - `ProtoError::InvalidProtocolVersion`: バージョン不一致
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        use prost::Message;
        let instr = Instruction::decode(bytes).map_err(ProtoError::DecodeFailed)?;

        match instr.protocol_version {
            None => Err(ProtoError::MissingProtocolVersion),
            Some(ver) if ver != MOSH_PROTOCOL_VERSION => {
                Err(ProtoError::InvalidProtocolVersion(ver))
            }
            Some(_) => Ok(instr),
        }
    }

    /// Instruction をバイト列にエンコードする
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        use prost::Message;
        self.encode_to_vec()
    }

    /// protocol_version が存在し、かつ一致するか
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == Some(MOSH_PROTOCOL_VERSION)
    }

    /// diff フィールドの参照を返す（None の場合は空スライス）
    pub fn diff_bytes(&self) -> &[u8] {
        self.diff.as_deref().unwrap_or(&[])
    }

    /// old_num の値（デフォルト 0）
    pub fn old_num_or_zero(&self) -> u64 {
        self.old_num.unwrap_or(0)
    }

    /// new_num の値（デフォルト 0）
    pub fn new_num_or_zero(&self) -> u64 {
        self.new_num.unwrap_or(0)
    }

    /// ack_num の値（デフォルト 0）
    pub fn ack_num_or_zero(&self) -> u64 {
        self.ack_num.unwrap_or(0)
    }

    /// throwaway_num の値（デフォルト 0）
    pub fn throwaway_num_or_zero(&self) -> u64 {
        self.throwaway_num.unwrap_or(0)
    }

    /// 差分データを持つか（diff フィールドが Some かつ非空）
    pub fn has_diff(&self) -> bool {
        self.diff.as_ref().is_some_and(|d| !d.is_empty())
    }
}

/// 0〜`MAX_CHAFF_LEN` バイトのランダムな chaff を生成する
///
/// 乱数源が使えない場合は空を返す（chaff は意味を持たないため送信は継続できる）。
pub fn make_chaff() -> Vec<u8> {
    let mut len_byte = [0u8; 1];
    if getrandom::getrandom(&mut len_byte).is_err() {
        return Vec::new();
    }
    let len = usize::from(len_byte[0]) % (MAX_CHAFF_LEN + 1);

    let mut chaff = alloc::vec![0u8; len];
    if getrandom::getrandom(&mut chaff).is_err() {
        return Vec::new();
    }
    chaff
}
