//! Fragment 分割と再組み立て
//!
//! Instruction のエンコード済みバイト列は zlib で圧縮してから分割する。
//!
//! ## Fragment Wire Format
//! ```text
//! [instruction_id: u64 BE (8 bytes)]
//! [fragment_num_with_final: u16 BE (2 bytes)]
//!   - bit 15: is_final (最後の Fragment の場合 1)
//!   - bit 0..14: fragment 番号 (0 始まり)
//! [chunk: variable]  zlib 圧縮済み Instruction の一部
//! ```

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::TransportError;

/// 1 Instruction あたりの Fragment 数の上限（15 ビットの fragment 番号）
pub const MAX_FRAGMENTS: usize = 1 << 15;

/// 展開後サイズの上限（zlib bomb 対策）
pub const MAX_DECOMPRESSED_LEN: usize = 16 * 1024 * 1024;

/// zlib 圧縮レベル（zlib のデフォルトと同じ）
const COMPRESSION_LEVEL: u8 = 6;

const FINAL_FLAG: u16 = 0x8000;

/// mosh Fragment（ネットワーク上の最小送受信単位）
///
/// 一つの SSP Instruction が MTU を超える場合、複数の Fragment に分割される。
/// すべての Fragment が揃うと元の Instruction バイト列に再組み立てされる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// この Fragment が属する Instruction の ID
    pub instruction_id: u64,
    /// Fragment 番号（0 始まり、15 ビット）
    pub fragment_num: u16,
    /// 最後の Fragment かどうか
    pub is_final: bool,
    /// 圧縮済み Instruction バイト列の一部
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Fragment ヘッダー長（instruction_id: 8 + fragment_num_with_final: 2）
    pub const HEADER_LEN: usize = 10;

    /// バイト列から Fragment を復元する（復号後のバイト列を渡す）
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(TransportError::TooShort);
        }

        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&bytes[0..8]);
        let instruction_id = u64::from_be_bytes(id_bytes);

        let frag_word = u16::from_be_bytes([bytes[8], bytes[9]]);

        Ok(Fragment {
            instruction_id,
            fragment_num: frag_word & !FINAL_FLAG,
            is_final: frag_word & FINAL_FLAG != 0,
            payload: bytes[Self::HEADER_LEN..].to_vec(),
        })
    }

    /// Fragment を Wire Format に変換する
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.instruction_id.to_be_bytes());

        let final_bit = if self.is_final { FINAL_FLAG } else { 0 };
        let frag_word: u16 = (self.fragment_num & !FINAL_FLAG) | final_bit;
        bytes.extend_from_slice(&frag_word.to_be_bytes());

        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// zlib 圧縮
pub fn compress(bytes: &[u8]) -> Vec<u8> {
    miniz_oxide::deflate::compress_to_vec_zlib(bytes, COMPRESSION_LEVEL)
}

/// zlib 展開（破損・途中切れ・上限超過はエラー）
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
    miniz_oxide::inflate::decompress_to_vec_zlib_with_limit(bytes, MAX_DECOMPRESSED_LEN)
        .map_err(|_| TransportError::DecompressFailed)
}

/// Instruction バイト列を圧縮し、Fragment 列に分割する
///
/// # 引数
/// - `instruction_id`: この Instruction の ID
/// - `instruction_bytes`: Instruction の Protocol Buffer エンコード済みバイト列
/// - `max_fragment_len`: Fragment 1 つの最大バイト数（ヘッダー込み）
///
/// # エラー
/// - `TransportError::MtuTooSmall`: ヘッダー分の余地がない
/// - `TransportError::TooManyFragments`: 32768 個を超える（送信側のバグ扱い）
pub fn encode_fragments(
    instruction_id: u64,
    instruction_bytes: &[u8],
    max_fragment_len: usize,
) -> Result<Vec<Fragment>, TransportError> {
    split_compressed(instruction_id, &compress(instruction_bytes), max_fragment_len)
}

/// 圧縮済みバイト列を Fragment 列に分割する
///
/// 空でも Fragment を 1 つ作る。エラーは `encode_fragments` と同じ。
pub fn split_compressed(
    instruction_id: u64,
    compressed: &[u8],
    max_fragment_len: usize,
) -> Result<Vec<Fragment>, TransportError> {
    if max_fragment_len <= Fragment::HEADER_LEN {
        return Err(TransportError::MtuTooSmall(max_fragment_len));
    }
    let chunk_len = max_fragment_len - Fragment::HEADER_LEN;

    let count = compressed.len().div_ceil(chunk_len).max(1);
    if count > MAX_FRAGMENTS {
        return Err(TransportError::TooManyFragments(count));
    }

    let fragments = (0..count)
        .map(|i| {
            let start = i * chunk_len;
            let end = compressed.len().min(start + chunk_len);
            Fragment {
                instruction_id,
                fragment_num: i as u16,
                is_final: i == count - 1,
                payload: compressed[start..end].to_vec(),
            }
        })
        .collect();

    Ok(fragments)
}

/// Instruction バイト列を Fragment 列に分割する
///
/// 呼び出しごとに新しい instruction_id を割り当てる。送信のたびに chaff が変わるので、
/// 再送でもバイト列は一致しない。
pub struct Fragmenter {
    /// 次に使う instruction_id
    next_instruction_id: u64,
}

impl Fragmenter {
    /// 新しい Fragmenter を生成する
    pub fn new() -> Self {
        Fragmenter {
            next_instruction_id: 0,
        }
    }

    /// Instruction バイト列を Fragment 列に分割する
    ///
    /// 失敗した場合は ID を消費しない。
    ///
    /// # 引数
    /// - `instruction_bytes`: Instruction の Protocol Buffer エンコード済みバイト列
    /// - `max_fragment_len`: Fragment 1 つの最大バイト数（ヘッダー込み）
    pub fn make_fragments(
        &mut self,
        instruction_bytes: &[u8],
        max_fragment_len: usize,
    ) -> Result<Vec<Fragment>, TransportError> {
        let fragments =
            encode_fragments(self.next_instruction_id, instruction_bytes, max_fragment_len)?;
        self.next_instruction_id = self.next_instruction_id.wrapping_add(1);
        Ok(fragments)
    }

    /// 次に割り当てる instruction_id
    pub fn next_id(&self) -> u64 {
        self.next_instruction_id
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Fragment を受け取り、Instruction に再組み立てする
///
/// 複数の Fragment を順不同で受け取り、すべて揃った時点で展開済みの
/// Instruction バイト列を返す。
///
/// 組み立て中の Instruction は常に 1 つだけ。別の instruction_id の Fragment が
/// 来たら、組み立て中の Fragment は破棄する。
pub struct FragmentAssembly {
    /// 現在組み立て中の instruction_id
    current_id: Option<u64>,
    /// 受信済み Fragment（fragment_num → payload）
    arrived: BTreeMap<u16, Vec<u8>>,
    /// 最後の Fragment（is_final=true）の fragment_num
    final_fragment_num: Option<u16>,
}

impl FragmentAssembly {
    /// 新しい FragmentAssembly を生成する
    pub fn new() -> Self {
        FragmentAssembly {
            current_id: None,
            arrived: BTreeMap::new(),
            final_fragment_num: None,
        }
    }

    /// 復号済みの Fragment バイト列を解析して追加する
    pub fn decode(&mut self, fragment_bytes: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        let frag = Fragment::from_bytes(fragment_bytes)?;
        self.add_fragment(frag)
    }

    /// Fragment を追加する
    ///
    /// # 戻り値
    /// - `Ok(Some(bytes))`: すべての Fragment が揃い、展開した Instruction バイト列
    /// - `Ok(None)`: まだ Fragment が足りない
    /// - `Err(DecompressFailed)`: 揃ったが展開できない（パケットごと破棄すること）
    pub fn add_fragment(&mut self, frag: Fragment) -> Result<Option<Vec<u8>>, TransportError> {
        if self.reset_if_new_id(frag.instruction_id) {
            tracing::trace!(instruction_id = frag.instruction_id, "started new fragment assembly");
        }

        if frag.is_final {
            self.final_fragment_num = Some(frag.fragment_num);
        }
        self.arrived.insert(frag.fragment_num, frag.payload);

        let Some(compressed) = self.try_assemble() else {
            return Ok(None);
        };
        self.clear();
        decompress(&compressed).map(Some)
    }

    /// 新しい instruction_id が来たら古い状態をリセットする
    ///
    /// # 戻り値
    /// - `true`: リセットが行われた（新しい ID だった）
    /// - `false`: 同じ ID（リセットなし）
    pub fn reset_if_new_id(&mut self, id: u64) -> bool {
        match self.current_id {
            Some(current) if current == id => false,
            _ => {
                self.clear();
                self.current_id = Some(id);
                true
            }
        }
    }

    fn clear(&mut self) {
        self.arrived.clear();
        self.final_fragment_num = None;
        self.current_id = None;
    }

    /// すべての Fragment が揃っていれば圧縮済みバイト列を返す
    fn try_assemble(&self) -> Option<Vec<u8>> {
        let final_num = self.final_fragment_num?;

        if !(0..=final_num).all(|num| self.arrived.contains_key(&num)) {
            return None;
        }

        let mut assembled = Vec::new();
        for (_, payload) in self.arrived.range(0..=final_num) {
            assembled.extend_from_slice(payload);
        }
        Some(assembled)
    }

    /// 現在組み立て中の instruction_id を返す
    pub fn current_id(&self) -> Option<u64> {
        self.current_id
    }

    /// 組み立て中の Fragment 数
    pub fn pending_fragments(&self) -> usize {
        self.arrived.len()
    }
}

impl Default for FragmentAssembly {
    fn default() -> Self {
        Self::new()
    }
}
